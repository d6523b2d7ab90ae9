//! Regatta live-state seam: the cache/watch subsystem lives outside this
//! core; the comparison pipeline only sees this trait.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use anyhow::Result;
use regatta_core::{Application, GroupKind, ResourceKey, Unstructured};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionsInfo {
    pub server_version: String,
    pub api_groups: Vec<String>,
}

/// Mapping from resource identity to the observed live object. `None` entries
/// are a valid result ("missing on cluster"), not a failure.
pub type LiveObjsByKey = FxHashMap<ResourceKey, Option<Unstructured>>;

/// Read access to the observed state of a target cluster. Network-backed
/// implementations own their failure domain; callers treat any error as a
/// degraded (not fatal) pass.
#[async_trait::async_trait]
pub trait LiveStateCache: Send + Sync {
    async fn get_versions_info(&self, server: &str) -> Result<VersionsInfo>;

    /// Live counterparts for every target key, plus any other live object
    /// already associated with the application.
    async fn get_managed_live_objs(
        &self,
        app: &Application,
        targets: &[Unstructured],
    ) -> Result<LiveObjsByKey>;

    /// Whether a kind is namespace-scoped on the given cluster.
    fn is_namespaced(&self, server: &str, group_kind: &GroupKind) -> Result<bool>;
}

/// Fixed in-memory live state for tests and offline comparison.
#[derive(Debug, Clone, Default)]
pub struct MemLiveState {
    pub versions: VersionsInfo,
    pub objs: FxHashMap<ResourceKey, Unstructured>,
    pub cluster_scoped_kinds: HashSet<GroupKind>,
}

impl MemLiveState {
    pub fn with_objs(objs: impl IntoIterator<Item = Unstructured>) -> Self {
        let mut m = Self::default();
        for o in objs {
            m.objs.insert(o.resource_key(), o);
        }
        m
    }
}

#[async_trait::async_trait]
impl LiveStateCache for MemLiveState {
    async fn get_versions_info(&self, _server: &str) -> Result<VersionsInfo> {
        Ok(self.versions.clone())
    }

    async fn get_managed_live_objs(
        &self,
        _app: &Application,
        targets: &[Unstructured],
    ) -> Result<LiveObjsByKey> {
        let mut out: LiveObjsByKey = FxHashMap::default();
        for t in targets {
            let key = t.resource_key();
            let live = self.objs.get(&key).cloned();
            out.insert(key, live);
        }
        for (key, obj) in &self.objs {
            out.entry(key.clone()).or_insert_with(|| Some(obj.clone()));
        }
        Ok(out)
    }

    fn is_namespaced(&self, _server: &str, group_kind: &GroupKind) -> Result<bool> {
        Ok(!self.cluster_scoped_kinds.contains(group_kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, ns: &str) -> Unstructured {
        Unstructured::new(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns}
        }))
    }

    #[tokio::test]
    async fn mem_live_state_covers_targets_and_extras() {
        let live = MemLiveState::with_objs([cm("present", "ns1"), cm("orphan", "ns1")]);
        let app = Application::default();
        let targets = vec![cm("present", "ns1"), cm("absent", "ns1")];
        let map = live.get_managed_live_objs(&app, &targets).await.unwrap();

        assert_eq!(map.len(), 3);
        assert!(map[&targets[0].resource_key()].is_some());
        assert!(map[&targets[1].resource_key()].is_none());
        assert!(map[&cm("orphan", "ns1").resource_key()].is_some());
    }

    #[test]
    fn scope_oracle_defaults_to_namespaced() {
        let mut live = MemLiveState::default();
        let ns_kind = GroupKind { group: "".into(), kind: "Namespace".into() };
        live.cluster_scoped_kinds.insert(ns_kind.clone());
        assert!(!live.is_namespaced("s", &ns_kind).unwrap());
        let cm_kind = GroupKind { group: "".into(), kind: "ConfigMap".into() };
        assert!(live.is_namespaced("s", &cm_kind).unwrap());
    }
}
