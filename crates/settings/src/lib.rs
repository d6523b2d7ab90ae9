//! Regatta settings: synchronous configuration reads feeding a comparison
//! pass — per-kind overrides, resource exclusion filters, plugin/build config.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::Result;
use regatta_core::{wildcard_match, GroupKind, DEFAULT_APP_INSTANCE_LABEL_KEY};
use serde::{Deserialize, Serialize};

/// Per-kind settings override, keyed by `group/Kind` (or `Kind` for core).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverride {
    /// JSON pointers removed from both sides before diffing.
    pub ignore_differences: Vec<String>,
    /// Opaque health-rule payload consumed by the health assessor.
    pub health_rule: Option<String>,
}

/// One exclusion rule: any matching (group, kind) on a matching cluster is
/// dropped from the target set. `*` wildcards throughout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub api_groups: Vec<String>,
    pub kinds: Vec<String>,
    pub clusters: Vec<String>,
}

impl FilterRule {
    fn matches(&self, group: &str, kind: &str, cluster: &str) -> bool {
        fn any(patterns: &[String], value: &str) -> bool {
            patterns.is_empty() || patterns.iter().any(|p| wildcard_match(p, value))
        }
        any(&self.api_groups, group) && any(&self.kinds, kind) && any(&self.clusters, cluster)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesFilter {
    pub exclusions: Vec<FilterRule>,
}

impl ResourcesFilter {
    pub fn is_excluded_resource(&self, group: &str, kind: &str, cluster: &str) -> bool {
        self.exclusions.iter().any(|r| r.matches(group, kind, cluster))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigManagementPlugin {
    pub name: String,
    pub generate_command: String,
    pub args: Vec<String>,
}

/// Synchronous settings reads, assumed cheap. One failing read is fatal to a
/// comparison pass.
pub trait SettingsSource: Send + Sync {
    fn get_resource_overrides(&self) -> Result<HashMap<String, ResourceOverride>>;
    fn get_app_instance_label_key(&self) -> Result<String>;
    fn get_resources_filter(&self) -> Result<ResourcesFilter>;
    fn get_config_management_plugins(&self) -> Result<Vec<ConfigManagementPlugin>>;
    fn get_kustomize_build_options(&self) -> Result<String>;
}

/// Override lookup key for a group/kind, matching the overrides map layout.
pub fn override_key(gk: &GroupKind) -> String {
    if gk.group.is_empty() {
        gk.kind.clone()
    } else {
        format!("{}/{}", gk.group, gk.kind)
    }
}

/// Fixed in-memory settings, the default for tests and single-binary setups.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    pub overrides: HashMap<String, ResourceOverride>,
    pub app_instance_label_key: Option<String>,
    pub filter: ResourcesFilter,
    pub plugins: Vec<ConfigManagementPlugin>,
    pub kustomize_build_options: String,
}

impl SettingsSource for StaticSettings {
    fn get_resource_overrides(&self) -> Result<HashMap<String, ResourceOverride>> {
        Ok(self.overrides.clone())
    }

    fn get_app_instance_label_key(&self) -> Result<String> {
        Ok(self
            .app_instance_label_key
            .clone()
            .unwrap_or_else(|| DEFAULT_APP_INSTANCE_LABEL_KEY.to_string()))
    }

    fn get_resources_filter(&self) -> Result<ResourcesFilter> {
        Ok(self.filter.clone())
    }

    fn get_config_management_plugins(&self) -> Result<Vec<ConfigManagementPlugin>> {
        Ok(self.plugins.clone())
    }

    fn get_kustomize_build_options(&self) -> Result<String> {
        Ok(self.kustomize_build_options.clone())
    }
}
