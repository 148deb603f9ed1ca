//! Newline-delimited JSON control protocol
//!
//! Every request is one JSON object on one line, tagged by `method`; every
//! request gets exactly one response line.

use crate::models::{ScalerConfig, StatsMap, TargetUpdates};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Request {
    /// Resolve components, build their scalers and start the control loop
    Start {
        namespace: String,
        components: Vec<String>,
        #[serde(default)]
        scalers: BTreeMap<String, ScalerConfig>,
    },
    /// Stage new scaler targets for the next tick
    Update { update: TargetUpdates },
    /// Drain records gathered since the previous poll
    Stats,
    /// End the session and return the full history
    Stop,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Start { .. } => "start",
            Request::Update { .. } => "update",
            Request::Stats => "stats",
            Request::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn with_stats(stats: StatsMap) -> Self {
        Self {
            ok: true,
            stats: Some(stats),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            stats: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScalerKind, StatRecord, TimedRecord};

    #[test]
    fn test_parse_start() {
        let line = r#"{"method": "start", "namespace": "social-network", "components": ["frontend", "cache"], "scalers": {"frontend": {"type": "captain", "params": [0.1, 4]}}}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        let Request::Start {
            namespace,
            components,
            scalers,
        } = request
        else {
            panic!("expected start");
        };
        assert_eq!(namespace, "social-network");
        assert_eq!(components, vec!["frontend", "cache"]);
        assert_eq!(scalers["frontend"].kind, ScalerKind::Captain);
        assert_eq!(scalers["frontend"].params, vec![0.1, 4.0]);
    }

    #[test]
    fn test_parse_update_and_bare_methods() {
        let request: Request =
            serde_json::from_str(r#"{"method":"update","update":{"frontend":[0.2]}}"#).unwrap();
        assert_eq!(request.method(), "update");
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"method":"stats"}"#).unwrap(),
            Request::Stats
        );
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"method":"stop"}"#).unwrap(),
            Request::Stop
        );
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"method":"restart"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"namespace":"x"}"#).is_err());
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(serde_json::to_string(&Response::ok()).unwrap(), r#"{"ok":true}"#);
        assert_eq!(
            serde_json::to_string(&Response::error("boom")).unwrap(),
            r#"{"ok":false,"error":"boom"}"#
        );

        let mut stats = StatsMap::new();
        stats.insert(
            "frontend".into(),
            vec![TimedRecord(1.5, StatRecord::default())],
        );
        let json = serde_json::to_value(Response::with_stats(stats)).unwrap();
        assert_eq!(json["stats"]["frontend"][0][0], 1.5);
        assert!(json["stats"]["frontend"][0][1]["scaler.limit"].is_null());
    }
}
