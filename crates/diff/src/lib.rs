//! Regatta diff seam: ignore-difference normalization plus the engine trait
//! the orchestrator invokes once per reconciled pair.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use regatta_core::{IgnoreDifference, Unstructured};
use regatta_settings::ResourceOverride;
use serde_json::Value;
use tracing::debug;

/// One normalization rule: which objects it applies to and which JSON
/// pointers to drop before comparison.
#[derive(Debug, Clone)]
struct NormalizeRule {
    group: String,
    kind: String,
    name: Option<String>,
    namespace: Option<String>,
    json_pointers: Vec<String>,
}

impl NormalizeRule {
    fn applies_to(&self, obj: &Unstructured) -> bool {
        (self.group == "*" || self.group == obj.group())
            && (self.kind == "*" || self.kind == obj.kind())
            && self.name.as_deref().map(|n| n == obj.name()).unwrap_or(true)
            && self.namespace.as_deref().map(|ns| ns == obj.namespace()).unwrap_or(true)
    }
}

/// Normalizer built from per-application ignore-difference rules plus global
/// per-kind overrides. Also strips server-populated noise from every object.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rules: Vec<NormalizeRule>,
}

impl Normalizer {
    pub fn new(
        ignore: &[IgnoreDifference],
        overrides: &HashMap<String, ResourceOverride>,
    ) -> Result<Self> {
        let mut rules = Vec::new();
        for ig in ignore {
            for p in &ig.json_pointers {
                validate_pointer(p)?;
            }
            rules.push(NormalizeRule {
                group: ig.group.clone(),
                kind: ig.kind.clone(),
                name: ig.name.clone(),
                namespace: ig.namespace.clone(),
                json_pointers: ig.json_pointers.clone(),
            });
        }
        for (key, ov) in overrides {
            if ov.ignore_differences.is_empty() {
                continue;
            }
            for p in &ov.ignore_differences {
                validate_pointer(p)?;
            }
            let (group, kind) = match key.split_once('/') {
                Some((g, k)) => (g.to_string(), k.to_string()),
                None => (String::new(), key.clone()),
            };
            rules.push(NormalizeRule {
                group,
                kind,
                name: None,
                namespace: None,
                json_pointers: ov.ignore_differences.clone(),
            });
        }
        Ok(Self { rules })
    }

    /// Produce the comparison view of an object: noisy server fields removed,
    /// then every matching ignore pointer dropped.
    pub fn normalize(&self, obj: &Unstructured) -> Value {
        let mut v = strip_noisy(obj.0.clone());
        for rule in self.rules.iter().filter(|r| r.applies_to(obj)) {
            for p in &rule.json_pointers {
                if remove_pointer(&mut v, p) {
                    debug!(pointer = %p, kind = %obj.kind(), name = %obj.name(), "normalized away ignored field");
                }
            }
        }
        v
    }
}

fn validate_pointer(p: &str) -> Result<()> {
    if !p.starts_with('/') {
        return Err(anyhow!("invalid JSON pointer {:?}: must start with '/'", p));
    }
    Ok(())
}

/// Remove server-populated fields that churn on every read.
fn strip_noisy(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Remove the value addressed by a JSON pointer. Returns whether anything
/// was removed.
fn remove_pointer(v: &mut Value, pointer: &str) -> bool {
    let (parent_ptr, last) = match pointer.rsplit_once('/') {
        Some(split) => split,
        None => return false,
    };
    let last = last.replace("~1", "/").replace("~0", "~");
    match v.pointer_mut(parent_ptr) {
        Some(Value::Object(map)) => map.remove(&last).is_some(),
        Some(Value::Array(arr)) => match last.parse::<usize>() {
            Ok(i) if i < arr.len() => {
                arr.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

// ---------------- Diff results ----------------

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub modified: bool,
    pub normalized_live: Value,
    pub predicted_live: Value,
}

impl DiffResult {
    /// The no-diff placeholder substituted when a batch diff fails.
    pub fn empty() -> Self {
        Self {
            modified: false,
            normalized_live: Value::Object(Default::default()),
            predicted_live: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffResultList {
    pub diffs: Vec<DiffResult>,
}

/// Structural diff invoked once per aligned target/live pair. A missing side
/// is treated as an empty document.
pub trait DiffEngine: Send + Sync {
    fn diff_array(
        &self,
        targets: &[Option<Unstructured>],
        lives: &[Option<Unstructured>],
        normalizer: &Normalizer,
    ) -> Result<DiffResultList>;
}

/// Default engine: normalize both sides and compare structurally.
#[derive(Debug, Default)]
pub struct NormalizingDiff;

impl DiffEngine for NormalizingDiff {
    fn diff_array(
        &self,
        targets: &[Option<Unstructured>],
        lives: &[Option<Unstructured>],
        normalizer: &Normalizer,
    ) -> Result<DiffResultList> {
        if targets.len() != lives.len() {
            return Err(anyhow!(
                "diff input length mismatch: {} targets vs {} lives",
                targets.len(),
                lives.len()
            ));
        }
        let empty = Value::Object(Default::default());
        let mut diffs = Vec::with_capacity(targets.len());
        for (target, live) in targets.iter().zip(lives.iter()) {
            let norm_target = target.as_ref().map(|o| normalizer.normalize(o));
            let norm_live = live.as_ref().map(|o| normalizer.normalize(o));
            let modified = norm_target.as_ref().unwrap_or(&empty) != norm_live.as_ref().unwrap_or(&empty);
            let predicted = norm_target.clone().or_else(|| norm_live.clone()).unwrap_or_else(|| empty.clone());
            diffs.push(DiffResult {
                modified,
                normalized_live: norm_live.unwrap_or_else(|| empty.clone()),
                predicted_live: predicted,
            });
        }
        Ok(DiffResultList { diffs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Unstructured {
        Unstructured::new(v)
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let pruned = strip_noisy(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "uid": "aaaa"
            },
            "status": {"observed": true},
            "data": {"k": "v"}
        }));
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.keys().collect::<Vec<_>>(), vec!["name"]);
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn normalizer_drops_ignored_pointers_for_matching_kind() {
        let ignore = vec![IgnoreDifference {
            group: "apps".into(),
            kind: "Deployment".into(),
            name: None,
            namespace: None,
            json_pointers: vec!["/spec/replicas".into()],
        }];
        let n = Normalizer::new(&ignore, &HashMap::new()).unwrap();
        let dep = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d"}, "spec": {"replicas": 3, "paused": false}}));
        let v = n.normalize(&dep);
        assert!(v["spec"].get("replicas").is_none());
        assert_eq!(v["spec"]["paused"], false);

        let cm = obj(json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c"}, "spec": {"replicas": 1}}));
        assert_eq!(n.normalize(&cm)["spec"]["replicas"], 1);
    }

    #[test]
    fn normalizer_applies_per_kind_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "apps/Deployment".to_string(),
            ResourceOverride { ignore_differences: vec!["/spec/revisionHistoryLimit".into()], health_rule: None },
        );
        let n = Normalizer::new(&[], &overrides).unwrap();
        let dep = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d"}, "spec": {"revisionHistoryLimit": 10}}));
        assert!(n.normalize(&dep)["spec"].get("revisionHistoryLimit").is_none());
    }

    #[test]
    fn invalid_pointer_is_rejected() {
        let ignore = vec![IgnoreDifference {
            group: "*".into(),
            kind: "*".into(),
            name: None,
            namespace: None,
            json_pointers: vec!["spec.replicas".into()],
        }];
        assert!(Normalizer::new(&ignore, &HashMap::new()).is_err());
    }

    #[test]
    fn diff_missing_side_is_empty_document() {
        let n = Normalizer::default();
        let cm = obj(json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c"}, "data": {"k": "v"}}));
        let res = NormalizingDiff
            .diff_array(&[Some(cm.clone()), None], &[None, Some(cm)], &n)
            .unwrap();
        assert_eq!(res.diffs.len(), 2);
        assert!(res.diffs[0].modified);
        assert!(res.diffs[1].modified);
        assert_eq!(res.diffs[0].normalized_live, json!({}));
    }

    #[test]
    fn identical_after_normalization_is_unmodified() {
        let ignore = vec![IgnoreDifference {
            group: "apps".into(),
            kind: "Deployment".into(),
            name: None,
            namespace: None,
            json_pointers: vec!["/spec/replicas".into()],
        }];
        let n = Normalizer::new(&ignore, &HashMap::new()).unwrap();
        let target = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d"}, "spec": {"replicas": 1}}));
        let live = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d", "resourceVersion": "42"},
            "spec": {"replicas": 5}, "status": {"readyReplicas": 5}}));
        let res = NormalizingDiff
            .diff_array(&[Some(target)], &[Some(live)], &n)
            .unwrap();
        assert!(!res.diffs[0].modified);
    }

    #[test]
    fn diff_length_mismatch_fails_batch() {
        let n = Normalizer::default();
        assert!(NormalizingDiff.diff_array(&[None], &[], &n).is_err());
    }
}
