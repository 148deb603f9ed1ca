//! Component to pod-cgroup resolution
//!
//! Kubernetes pods are found by listing the namespace with kubectl and then
//! scanning the kubelet's QoS slices for the matching pod UIDs.

use super::PodCgroup;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

/// QoS classes scanned under `kubepods.slice`
pub const QOS_CLASSES: [&str; 3] = ["guaranteed", "burstable", "besteffort"];

const POD_LISTING_JSONPATH: &str =
    r#"-o=jsonpath={range .items[*]}{.metadata.uid} {.metadata.name}{"\n"}{end}"#;

/// Maps component names to pod cgroups at session start
#[async_trait]
pub trait PodResolver: Send + Sync {
    /// Resolve as many of `components` as possible; unresolved ones are left out
    async fn resolve(
        &self,
        namespace: &str,
        components: &[String],
    ) -> Result<BTreeMap<String, PodCgroup>>;
}

/// Parse `"<uid> <pod name>"` lines into component -> uid.
///
/// The component is the pod name with its replica-set and pod hash suffixes
/// (the last two `-` segments) removed. Only names in `components` are kept.
pub fn parse_pod_listing(output: &str, components: &[String]) -> Result<HashMap<String, String>> {
    let mut name_to_uid = HashMap::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(uid), Some(pod_name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let component = pod_name.rsplitn(3, '-').last().unwrap_or(pod_name);
        if !components.iter().any(|c| c == component) {
            continue;
        }
        if name_to_uid
            .insert(component.to_string(), uid.to_string())
            .is_some()
        {
            return Err(AgentError::Protocol(format!(
                "more than one pod for component {}",
                component
            )));
        }
    }
    Ok(name_to_uid)
}

/// Extract the pod UID from a `kubepods-<qos>-pod<uid>.slice` directory name
pub fn parse_pod_slice_name(qos: &str, dir_name: &str) -> Option<String> {
    let prefix = format!("kubepods-{}-pod", qos);
    dir_name
        .strip_prefix(&prefix)
        .and_then(|rest| rest.strip_suffix(".slice"))
        .filter(|uid| !uid.is_empty())
        .map(|uid| uid.replace('_', "-"))
}

/// Resolver backed by `kubectl get pods` and the kubelet slice layout
pub struct KubectlResolver {
    kubectl: String,
    /// Directory holding `kubepods.slice` (the cpu controller root on v1)
    slice_root: PathBuf,
}

impl KubectlResolver {
    pub fn new(kubectl: impl Into<String>, slice_root: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
            slice_root: slice_root.into(),
        }
    }

    async fn list_pods(&self, namespace: &str) -> Result<String> {
        let output = Command::new(&self.kubectl)
            .arg("get")
            .arg("pods")
            .arg(format!("-n={}", namespace))
            .arg(POD_LISTING_JSONPATH)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(AgentError::Protocol(format!(
                "kubectl get pods failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// uid -> qos for every pod slice present on this node
    async fn scan_slices(&self) -> HashMap<String, &'static str> {
        let mut uid_to_qos = HashMap::new();
        for qos in QOS_CLASSES {
            let dir = self
                .slice_root
                .join("kubepods.slice")
                .join(format!("kubepods-{}.slice", qos));
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                debug!(path = %dir.display(), "QoS slice not present");
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(uid) = parse_pod_slice_name(qos, &entry.file_name().to_string_lossy())
                {
                    uid_to_qos.insert(uid, qos);
                }
            }
        }
        uid_to_qos
    }
}

#[async_trait]
impl PodResolver for KubectlResolver {
    async fn resolve(
        &self,
        namespace: &str,
        components: &[String],
    ) -> Result<BTreeMap<String, PodCgroup>> {
        let listing = self.list_pods(namespace).await?;
        let name_to_uid = parse_pod_listing(&listing, components)?;
        let uid_to_qos = self.scan_slices().await;

        let mut pods = BTreeMap::new();
        for component in components {
            let Some(uid) = name_to_uid.get(component) else {
                warn!(component = %component, namespace = %namespace, "No pod found for component");
                continue;
            };
            match uid_to_qos.get(uid) {
                Some(qos) => {
                    pods.insert(component.clone(), PodCgroup::kubepods(qos, uid));
                }
                None => {
                    warn!(component = %component, uid = %uid, "Pod is not scheduled on this node");
                }
            }
        }
        Ok(pods)
    }
}

/// Fixed component -> slice mapping
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    pods: BTreeMap<String, PodCgroup>,
}

impl StaticResolver {
    pub fn new(pods: BTreeMap<String, PodCgroup>) -> Self {
        Self { pods }
    }

    pub fn with_pod(mut self, component: impl Into<String>, pod: PodCgroup) -> Self {
        self.pods.insert(component.into(), pod);
        self
    }
}

#[async_trait]
impl PodResolver for StaticResolver {
    async fn resolve(
        &self,
        _namespace: &str,
        components: &[String],
    ) -> Result<BTreeMap<String, PodCgroup>> {
        Ok(components
            .iter()
            .filter_map(|c| self.pods.get(c).map(|pod| (c.clone(), pod.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_pod_listing_strips_hash_suffixes() {
        let output = "a1-b2 frontend-7d9f8c6b5-x2x4z\nc3-d4 user-service-5c4f7b-qq8lm\ne5 jaeger-6b7d-abcde\n";
        let map = parse_pod_listing(output, &names(&["frontend", "user-service"])).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["frontend"], "a1-b2");
        assert_eq!(map["user-service"], "c3-d4");
    }

    #[test]
    fn test_parse_pod_listing_duplicate_component() {
        let output = "u1 frontend-abc-111\nu2 frontend-def-222\n";
        assert!(parse_pod_listing(output, &names(&["frontend"])).is_err());
    }

    #[test]
    fn test_parse_pod_slice_name() {
        assert_eq!(
            parse_pod_slice_name("burstable", "kubepods-burstable-pod12ab_34cd.slice"),
            Some("12ab-34cd".to_string())
        );
        assert_eq!(parse_pod_slice_name("burstable", "kubepods-besteffort-pod1.slice"), None);
        assert_eq!(parse_pod_slice_name("guaranteed", "kubepods-guaranteed-pod.slice"), None);
    }

    #[tokio::test]
    async fn test_static_resolver_skips_unknown() {
        let resolver = StaticResolver::default().with_pod("a", PodCgroup::new("a.slice"));
        let pods = resolver.resolve("ns", &names(&["a", "b"])).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods["a"], PodCgroup::new("a.slice"));
    }

    #[tokio::test]
    async fn test_scan_slices_finds_pods() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp
            .path()
            .join("kubepods.slice/kubepods-burstable.slice/kubepods-burstable-poda_b.slice");
        fs::create_dir_all(&dir).await.unwrap();

        let resolver = KubectlResolver::new("kubectl", temp.path());
        let slices = resolver.scan_slices().await;
        assert_eq!(slices.get("a-b"), Some(&"burstable"));
    }
}
