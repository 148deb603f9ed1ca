//! Cost-sensitive contextual bandit learner
//!
//! Reduces the bandit problem to one cost regressor per action. Each
//! regressor is linear over `[1, context / scale]` and trained with
//! importance-weighted AdaGrad steps; `predict` puts `1 - epsilon` on the
//! cheapest action and spreads `epsilon` uniformly. Regressors start at zero,
//! so an action that was never trained predicts cost 0 and competes with the
//! trained ones. A learner with no training at all predicts uniformly.

/// Contract the tuning tower relies on
pub trait ContextualBandit {
    /// One training example: `action` was taken with `probability` and cost `cost`
    fn learn(&mut self, context: f64, action: usize, cost: f64, probability: f64);

    /// Probability distribution over actions for `context`
    fn predict(&self, context: f64) -> Vec<f64>;
}

const FEATURES: usize = 2;
const MIN_PROBABILITY: f64 = 1e-6;
const ADAGRAD_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct RegressionBandit {
    learning_rate: f64,
    epsilon: f64,
    weights: Vec<[f64; FEATURES]>,
    squared_gradients: Vec<[f64; FEATURES]>,
    trained: Vec<bool>,
    /// Largest |context| seen so far
    scale: f64,
}

impl RegressionBandit {
    pub fn new(actions: usize, learning_rate: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            epsilon: epsilon.clamp(0.0, 1.0),
            weights: vec![[0.0; FEATURES]; actions],
            squared_gradients: vec![[0.0; FEATURES]; actions],
            trained: vec![false; actions],
            scale: 0.0,
        }
    }

    pub fn actions(&self) -> usize {
        self.weights.len()
    }

    fn features(&self, context: f64) -> [f64; FEATURES] {
        let scaled = if self.scale > 0.0 {
            context / self.scale
        } else {
            context
        };
        [1.0, scaled]
    }

    /// Predicted cost of `action` in `context`
    pub fn predict_cost(&self, context: f64, action: usize) -> f64 {
        let x = self.features(context);
        self.weights[action]
            .iter()
            .zip(x.iter())
            .map(|(w, x)| w * x)
            .sum()
    }

    /// Cheapest action; `None` until some action has been trained
    pub fn best_action(&self, context: f64) -> Option<usize> {
        if !self.trained.iter().any(|&t| t) {
            return None;
        }
        (0..self.actions())
            .map(|a| (a, self.predict_cost(context, a)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(a, _)| a)
    }
}

impl ContextualBandit for RegressionBandit {
    fn learn(&mut self, context: f64, action: usize, cost: f64, probability: f64) {
        if action >= self.actions() || !cost.is_finite() || !context.is_finite() {
            return;
        }
        self.scale = self.scale.max(context.abs());

        let importance = 1.0 / (probability.max(MIN_PROBABILITY) * self.actions() as f64);
        let x = self.features(context);
        let error = self.predict_cost(context, action) - cost;

        let weights = &mut self.weights[action];
        let squared = &mut self.squared_gradients[action];
        for i in 0..FEATURES {
            let gradient = importance * error * x[i];
            squared[i] += gradient * gradient;
            weights[i] -= self.learning_rate * gradient / (squared[i].sqrt() + ADAGRAD_EPSILON);
        }
        self.trained[action] = true;
    }

    fn predict(&self, context: f64) -> Vec<f64> {
        let actions = self.actions();
        if actions == 0 {
            return Vec::new();
        }
        let Some(best) = self.best_action(context) else {
            return vec![1.0 / actions as f64; actions];
        };
        let mut distribution = vec![self.epsilon / actions as f64; actions];
        distribution[best] += 1.0 - self.epsilon;
        distribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrained_is_uniform() {
        let learner = RegressionBandit::new(4, 0.5, 0.0);
        assert_eq!(learner.predict(10.0), vec![0.25; 4]);
    }

    #[test]
    fn test_converges_to_cheapest_action() {
        let mut learner = RegressionBandit::new(3, 0.5, 0.0);
        let costs = [0.8, 0.1, 2.5];
        for i in 0..3000 {
            let action = i % 3;
            learner.learn(100.0, action, costs[action], 1.0 / 3.0);
        }
        for (action, cost) in costs.iter().enumerate() {
            assert!((learner.predict_cost(100.0, action) - cost).abs() < 0.05);
        }
        assert_eq!(learner.predict(100.0), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_context_dependent_costs() {
        let mut learner = RegressionBandit::new(2, 0.5, 0.0);
        // action 0 is cheap at low load, action 1 at high load
        for i in 0..20000 {
            let rps = if i % 2 == 0 { 50.0 } else { 200.0 };
            let (c0, c1) = if rps < 100.0 { (0.2, 0.9) } else { (2.5, 0.4) };
            learner.learn(rps, (i / 2) % 2, if (i / 2) % 2 == 0 { c0 } else { c1 }, 0.5);
        }
        assert_eq!(learner.best_action(50.0), Some(0));
        assert_eq!(learner.best_action(200.0), Some(1));
    }

    #[test]
    fn test_untried_action_beats_costly_trained_one() {
        let mut learner = RegressionBandit::new(3, 0.5, 0.0);
        for _ in 0..500 {
            learner.learn(100.0, 0, 2.0, 1.0 / 3.0);
        }
        assert!(learner.predict_cost(100.0, 0) > 1.5);
        assert_eq!(learner.predict_cost(100.0, 1), 0.0);
        assert_eq!(learner.best_action(100.0), Some(1));
    }

    #[test]
    fn test_epsilon_spreads_mass() {
        let mut learner = RegressionBandit::new(4, 0.5, 0.2);
        for _ in 0..500 {
            for action in [0, 1, 3] {
                learner.learn(1.0, action, 1.0, 0.25);
            }
            learner.learn(1.0, 2, 0.0, 0.25);
        }
        let distribution = learner.predict(1.0);
        assert!((distribution[2] - 0.85).abs() < 1e-12);
        assert!((distribution[0] - 0.05).abs() < 1e-12);
        assert!((distribution.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }
}
