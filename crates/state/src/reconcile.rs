//! Target deduplication, policy filtering and target/live pairing.

use anyhow::Result;
use regatta_core::{ApplicationCondition, ConditionKind, ResourceKey, Unstructured};
use regatta_livestate::{LiveObjsByKey, LiveStateCache};
use regatta_settings::ResourcesFilter;
use rustc_hash::FxHashMap;

/// Equal-length, index-aligned target/live sequences. No index has both
/// sides absent.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    pub target: Vec<Option<Unstructured>>,
    pub live: Vec<Option<Unstructured>>,
}

/// Normalize namespaces against the destination and collapse same-identity
/// duplicates, last declaration wins. Emits one RepeatedResourceWarning per
/// collapsed group. Fails only if the namespaced-kind oracle errors.
pub fn dedup_target_objects(
    live: &dyn LiveStateCache,
    server: &str,
    namespace: &str,
    objs: &[Unstructured],
) -> Result<(Vec<Unstructured>, Vec<ApplicationCondition>)> {
    let mut by_key: FxHashMap<ResourceKey, Vec<Unstructured>> = FxHashMap::default();
    let mut order: Vec<ResourceKey> = Vec::new();
    for obj in objs {
        let mut obj = obj.clone();
        let namespaced = live.is_namespaced(server, &obj.group_kind())?;
        if !namespaced {
            obj.set_namespace("");
        } else if obj.namespace().is_empty() {
            obj.set_namespace(namespace);
        }
        let key = obj.resource_key();
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.entry(key).or_default().push(obj);
    }

    let mut conditions = Vec::new();
    let mut result = Vec::with_capacity(order.len());
    for key in order {
        let mut group = by_key.remove(&key).unwrap_or_default();
        if group.len() > 1 {
            conditions.push(ApplicationCondition::new(
                ConditionKind::RepeatedResourceWarning,
                format!("Resource {} appeared {} times among application resources", key, group.len()),
            ));
        }
        if let Some(last) = group.pop() {
            result.push(last);
        }
    }
    Ok((result, conditions))
}

/// Drop excluded-by-policy targets, returning the retained sequence plus the
/// removed objects with their reasons.
pub fn filter_excluded(
    objs: Vec<Unstructured>,
    filter: &ResourcesFilter,
    server: &str,
) -> (Vec<Unstructured>, Vec<(Unstructured, String)>) {
    let mut kept = Vec::with_capacity(objs.len());
    let mut removed = Vec::new();
    for obj in objs {
        if filter.is_excluded_resource(obj.group(), obj.kind(), server) {
            let reason = format!(
                "Resource {}/{} {} is excluded in the settings",
                obj.group(),
                obj.kind(),
                obj.name()
            );
            removed.push((obj, reason));
        } else {
            kept.push(obj);
        }
    }
    (kept, removed)
}

/// Pair each target with its live counterpart, then append live objects
/// unclaimed by any target. Phase-2 order follows map iteration and is
/// deliberately unspecified.
pub fn reconcile(targets: Vec<Unstructured>, mut live_by_key: LiveObjsByKey) -> ReconciliationResult {
    let mut result = ReconciliationResult {
        target: Vec::with_capacity(targets.len()),
        live: Vec::with_capacity(targets.len()),
    };
    for target in targets {
        let key = target.resource_key();
        let live = live_by_key.remove(&key).flatten();
        result.target.push(Some(target));
        result.live.push(live);
    }
    for (_key, live) in live_by_key {
        if let Some(live) = live {
            result.target.push(None);
            result.live.push(Some(live));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use regatta_core::GroupKind;
    use regatta_livestate::MemLiveState;
    use regatta_settings::FilterRule;
    use serde_json::json;

    fn cm(name: &str, ns: Option<&str>, data: &str) -> Unstructured {
        let mut meta = json!({"name": name});
        if let Some(ns) = ns {
            meta["namespace"] = json!(ns);
        }
        Unstructured::new(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": meta, "data": {"v": data}}))
    }

    fn cluster_role(name: &str, ns: Option<&str>) -> Unstructured {
        let mut meta = json!({"name": name});
        if let Some(ns) = ns {
            meta["namespace"] = json!(ns);
        }
        Unstructured::new(json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": meta}))
    }

    fn oracle() -> MemLiveState {
        let mut live = MemLiveState::default();
        live.cluster_scoped_kinds
            .insert(GroupKind { group: "rbac.authorization.k8s.io".into(), kind: "ClusterRole".into() });
        live
    }

    #[test]
    fn dedup_last_wins_with_one_warning() {
        let objs = vec![cm("x", Some("ns1"), "a"), cm("x", Some("ns1"), "b"), cm("x", Some("ns1"), "c")];
        let (result, conditions) = dedup_target_objects(&oracle(), "srv", "ns1", &objs).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].0["data"]["v"], "c");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].kind, ConditionKind::RepeatedResourceWarning);
        assert!(conditions[0].message.contains("appeared 3 times"), "{}", conditions[0].message);
    }

    #[test]
    fn dedup_normalizes_namespaces() {
        let objs = vec![cm("a", None, "v"), cluster_role("admin", Some("leaked-ns"))];
        let (result, conditions) = dedup_target_objects(&oracle(), "srv", "ns1", &objs).unwrap();
        assert!(conditions.is_empty());
        assert_eq!(result[0].namespace(), "ns1");
        assert_eq!(result[1].namespace(), "");
    }

    #[test]
    fn dedup_distinct_keys_survive() {
        let objs = vec![cm("a", Some("ns1"), "v"), cm("a", Some("ns2"), "v"), cm("b", Some("ns1"), "v")];
        let (result, conditions) = dedup_target_objects(&oracle(), "srv", "ns1", &objs).unwrap();
        assert_eq!(result.len(), 3);
        assert!(conditions.is_empty());
    }

    #[test]
    fn filter_splits_kept_and_removed() {
        let filter = ResourcesFilter {
            exclusions: vec![FilterRule {
                api_groups: vec!["".into()],
                kinds: vec!["ConfigMap".into()],
                clusters: vec!["*".into()],
            }],
        };
        let objs = vec![cm("a", Some("ns1"), "v"), cluster_role("admin", None), cm("b", Some("ns1"), "v")];
        let (kept, removed) = filter_excluded(objs, &filter, "srv");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].kind(), "ClusterRole");
        assert_eq!(removed.len(), 2);
        assert!(removed[0].1.contains("excluded in the settings"));
    }

    #[test]
    fn reconcile_pairs_and_appends_orphans() {
        let t1 = cm("present", Some("ns1"), "v");
        let t2 = cm("absent", Some("ns1"), "v");
        let orphan = cm("orphan", Some("ns1"), "v");
        let mut live_by_key: LiveObjsByKey = Default::default();
        live_by_key.insert(t1.resource_key(), Some(t1.clone()));
        live_by_key.insert(t2.resource_key(), None);
        live_by_key.insert(orphan.resource_key(), Some(orphan.clone()));

        let result = reconcile(vec![t1.clone(), t2.clone()], live_by_key);
        assert_eq!(result.target.len(), result.live.len());
        assert_eq!(result.target.len(), 3);
        // Aligned targets keep declaration order.
        assert_eq!(result.target[0].as_ref().unwrap().name(), "present");
        assert!(result.live[0].is_some());
        assert_eq!(result.target[1].as_ref().unwrap().name(), "absent");
        assert!(result.live[1].is_none());
        // Orphan slot: no position assertion beyond "last", since phase-2
        // order is unspecified set order.
        assert!(result.target[2].is_none());
        assert_eq!(result.live[2].as_ref().unwrap().name(), "orphan");
        // Invariant: no slot has both sides absent.
        for i in 0..result.target.len() {
            assert!(result.target[i].is_some() || result.live[i].is_some());
        }
    }

    #[test]
    fn reconcile_drops_unclaimed_nil_entries() {
        let ghost = cm("ghost", Some("ns1"), "v");
        let mut live_by_key: LiveObjsByKey = Default::default();
        live_by_key.insert(ghost.resource_key(), None);
        let result = reconcile(Vec::new(), live_by_key);
        assert!(result.target.is_empty());
        assert!(result.live.is_empty());
    }
}
