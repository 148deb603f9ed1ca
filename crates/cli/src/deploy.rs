//! Application deploy and teardown hooks

use crate::config::DeployConfig;
use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Deployment {
    config: DeployConfig,
    namespace: String,
}

async fn run_shell(command: &str) -> Result<()> {
    debug!(command, "Running deploy command");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await
        .with_context(|| format!("Failed to run {:?}", command))?;
    if !status.success() {
        bail!("{:?} exited with {}", command, status);
    }
    Ok(())
}

/// True when exactly `expected` pods are listed and all of them are done starting
pub fn all_ready(listing: &str, expected: usize) -> bool {
    let pods: Vec<&str> = listing.lines().filter(|l| !l.trim().is_empty()).collect();
    pods.len() == expected
        && pods.iter().all(|line| {
            matches!(
                line.split_whitespace().nth(1),
                Some("Running") | Some("Succeeded")
            )
        })
}

impl Deployment {
    pub fn new(config: DeployConfig, namespace: impl Into<String>) -> Self {
        Self {
            config,
            namespace: namespace.into(),
        }
    }

    async fn pod_phases(&self) -> Result<String> {
        let output = Command::new(&self.config.kubectl)
            .arg("get")
            .arg("pods")
            .arg(format!("-n={}", self.namespace))
            .arg(r#"-o=jsonpath={range .items[*]}{.metadata.name} {.status.phase}{"\n"}{end}"#)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to list pods")?;
        if !output.status.success() {
            bail!(
                "kubectl get pods failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn apply(&self) -> Result<()> {
        for command in &self.config.apply {
            run_shell(command).await?;
        }
        if let Some(expected) = self.config.pod_count {
            while !all_ready(&self.pod_phases().await?, expected) {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        info!(namespace = %self.namespace, "Application deployed");
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        for command in &self.config.delete {
            run_shell(command).await?;
        }
        if self.config.pod_count.is_some() {
            while !self.pod_phases().await?.trim().is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        info!(namespace = %self.namespace, "Application torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ready() {
        let listing = "frontend-abc Running\nschema-init-x Succeeded\n";
        assert!(all_ready(listing, 2));
        assert!(!all_ready(listing, 3));
        assert!(!all_ready("frontend-abc Pending\n", 1));
    }

    #[tokio::test]
    async fn test_failing_command_is_error() {
        let deployment = Deployment::new(
            DeployConfig {
                apply: vec!["exit 3".to_string()],
                ..Default::default()
            },
            "test",
        );
        assert!(deployment.apply().await.is_err());
    }

    #[tokio::test]
    async fn test_commands_without_pod_wait() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("deployed");
        let deployment = Deployment::new(
            DeployConfig {
                apply: vec![format!("touch {}", marker.display())],
                delete: vec![format!("rm {}", marker.display())],
                ..Default::default()
            },
            "test",
        );
        deployment.apply().await.unwrap();
        assert!(marker.exists());
        deployment.teardown().await.unwrap();
        assert!(!marker.exists());
    }
}
