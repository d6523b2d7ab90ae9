//! Regatta health seam: per-kind derivation rules live outside this core;
//! the default assessor only knows worst-of aggregation and a few built-ins.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Result;
use regatta_core::{HealthStatus, HealthStatusCode, ResourceStatus, Unstructured};
use regatta_settings::ResourceOverride;

/// Aggregates application health from per-resource statuses and live objects.
/// `include` excludes objects (notably the application's own manifest) from
/// aggregation entirely.
pub trait HealthAssessor: Send + Sync {
    fn set_application_health(
        &self,
        resources: &mut [ResourceStatus],
        live_objs: &[Option<Unstructured>],
        overrides: &HashMap<String, ResourceOverride>,
        include: &dyn Fn(&Unstructured) -> bool,
    ) -> Result<HealthStatus>;
}

/// Default assessor: enrich each resource with a derived health status and
/// aggregate the worst among included, non-hook resources.
#[derive(Debug, Default)]
pub struct WorstOf;

impl HealthAssessor for WorstOf {
    fn set_application_health(
        &self,
        resources: &mut [ResourceStatus],
        live_objs: &[Option<Unstructured>],
        _overrides: &HashMap<String, ResourceOverride>,
        include: &dyn Fn(&Unstructured) -> bool,
    ) -> Result<HealthStatus> {
        let mut aggregate = HealthStatus { status: HealthStatusCode::Healthy, message: String::new() };
        for (i, res) in resources.iter_mut().enumerate() {
            let live = live_objs.get(i).and_then(|o| o.as_ref());
            if let Some(obj) = live {
                if !include(obj) {
                    continue;
                }
            }
            let health = match live {
                Some(obj) => assess(obj),
                None => HealthStatus { status: HealthStatusCode::Missing, message: String::new() },
            };
            if !res.hook && health.status.is_worse_than(aggregate.status) {
                aggregate = health.clone();
            }
            res.health = Some(health);
        }
        Ok(aggregate)
    }
}

fn assess(obj: &Unstructured) -> HealthStatus {
    let status = &obj.0["status"];
    let code = match (obj.group(), obj.kind()) {
        ("apps", "Deployment") | ("apps", "StatefulSet") => {
            let want = obj.0["spec"]["replicas"].as_i64().unwrap_or(1);
            let ready = status["readyReplicas"].as_i64().unwrap_or(0);
            if ready >= want {
                HealthStatusCode::Healthy
            } else {
                HealthStatusCode::Progressing
            }
        }
        ("", "Pod") => match status["phase"].as_str() {
            Some("Running") | Some("Succeeded") => HealthStatusCode::Healthy,
            Some("Pending") => HealthStatusCode::Progressing,
            Some("Failed") => HealthStatusCode::Degraded,
            _ => HealthStatusCode::Unknown,
        },
        ("batch", "Job") => {
            if status["failed"].as_i64().unwrap_or(0) > 0 {
                HealthStatusCode::Degraded
            } else if status["succeeded"].as_i64().unwrap_or(0) > 0 {
                HealthStatusCode::Healthy
            } else {
                HealthStatusCode::Progressing
            }
        }
        // Kinds without status semantics are healthy by existence.
        _ => HealthStatusCode::Healthy,
    };
    HealthStatus { status: code, message: String::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(kind: &str, name: &str, hook: bool) -> ResourceStatus {
        ResourceStatus {
            group: String::new(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: "ns".into(),
            name: name.into(),
            status: None,
            health: None,
            hook,
            requires_pruning: false,
        }
    }

    fn pod(name: &str, phase: &str) -> Unstructured {
        Unstructured::new(json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": name, "namespace": "ns"},
            "status": {"phase": phase}
        }))
    }

    #[test]
    fn aggregate_is_worst_of_included() {
        let mut resources = vec![res("Pod", "a", false), res("Pod", "b", false)];
        let lives = vec![Some(pod("a", "Running")), Some(pod("b", "Failed"))];
        let agg = WorstOf
            .set_application_health(&mut resources, &lives, &HashMap::new(), &|_| true)
            .unwrap();
        assert_eq!(agg.status, HealthStatusCode::Degraded);
        assert_eq!(resources[0].health.as_ref().unwrap().status, HealthStatusCode::Healthy);
        assert_eq!(resources[1].health.as_ref().unwrap().status, HealthStatusCode::Degraded);
    }

    #[test]
    fn excluded_objects_do_not_poison_aggregate() {
        let mut resources = vec![res("Pod", "self", false), res("Pod", "b", false)];
        let lives = vec![Some(pod("self", "Failed")), Some(pod("b", "Running"))];
        let agg = WorstOf
            .set_application_health(&mut resources, &lives, &HashMap::new(), &|o| o.name() != "self")
            .unwrap();
        assert_eq!(agg.status, HealthStatusCode::Healthy);
        // Excluded object gets no enrichment either.
        assert!(resources[0].health.is_none());
    }

    #[test]
    fn hooks_enriched_but_not_aggregated() {
        let mut resources = vec![res("Pod", "hook", true)];
        let lives = vec![Some(pod("hook", "Failed"))];
        let agg = WorstOf
            .set_application_health(&mut resources, &lives, &HashMap::new(), &|_| true)
            .unwrap();
        assert_eq!(agg.status, HealthStatusCode::Healthy);
        assert_eq!(resources[0].health.as_ref().unwrap().status, HealthStatusCode::Degraded);
    }

    #[test]
    fn missing_live_is_missing_health() {
        let mut resources = vec![res("ConfigMap", "cm", false)];
        let lives = vec![None];
        let agg = WorstOf
            .set_application_health(&mut resources, &lives, &HashMap::new(), &|_| true)
            .unwrap();
        assert_eq!(agg.status, HealthStatusCode::Missing);
    }
}
