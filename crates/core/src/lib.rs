//! Regatta core types: unstructured objects, resource identity, sync/health
//! statuses, conditions and the application/project data model.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation marking a resource as a lifecycle hook (comma-separated phases).
pub const ANNOTATION_HOOK: &str = "regatta.io/hook";
/// Annotation carrying comparison options (`IgnoreExtraneous`, `Ignore`).
pub const ANNOTATION_COMPARE_OPTIONS: &str = "regatta.io/compare-options";
/// Default label key naming the owning application on managed objects.
pub const DEFAULT_APP_INSTANCE_LABEL_KEY: &str = "regatta.io/instance";
/// API group of the Application resource itself.
pub const APPLICATION_GROUP: &str = "regatta.io";
/// Kind of the Application resource itself.
pub const APPLICATION_KIND: &str = "Application";

const HELM_HOOK_ANNOTATION: &str = "helm.sh/hook";

// ---------------- Unstructured objects ----------------

/// A semi-structured Kubernetes object: a thin wrapper over raw JSON with
/// typed accessors for the metadata the comparison pipeline cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Unstructured(pub Value);

impl Unstructured {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    fn str_at(&self, path: &[&str]) -> &str {
        let mut cur = &self.0;
        for p in path {
            match cur.get(p) {
                Some(v) => cur = v,
                None => return "",
            }
        }
        cur.as_str().unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"])
    }

    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    pub fn version(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((_, v)) => v,
            None => self.api_version(),
        }
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"])
    }

    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"])
    }

    /// Set the namespace; an empty value removes the field entirely.
    pub fn set_namespace(&mut self, namespace: &str) {
        let meta = self
            .0
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert(Value::Object(Default::default())));
        if let Some(Value::Object(meta)) = meta {
            if namespace.is_empty() {
                meta.remove("namespace");
            } else {
                meta.insert("namespace".into(), Value::String(namespace.to_string()));
            }
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group().to_string(), kind: self.kind().to_string() }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk {
            group: self.group().to_string(),
            version: self.version().to_string(),
            kind: self.kind().to_string(),
        }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            group: self.group().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }

    /// True when the comma-separated annotation at `key` carries `option`.
    pub fn has_annotation_option(&self, key: &str, option: &str) -> bool {
        self.annotation(key)
            .map(|v| v.split(',').any(|o| o.trim().eq_ignore_ascii_case(option)))
            .unwrap_or(false)
    }

    /// Owning application name recorded under the instance label, if any.
    pub fn app_instance_label(&self, label_key: &str) -> Option<&str> {
        self.label(label_key).filter(|v| !v.is_empty())
    }

    /// Whether this object's apply is governed by a deployment lifecycle
    /// phase. A helm hook that is only `crd-install` is unmanaged, not a hook.
    pub fn is_hook(&self) -> bool {
        self.annotation(ANNOTATION_HOOK)
            .map(|v| !v.trim().is_empty() && !v.split(',').all(|p| p.trim() == "none"))
            .unwrap_or(false)
            || self
                .annotation(HELM_HOOK_ANNOTATION)
                .map(|v| v.split(',').any(|h| !h.trim().is_empty() && h.trim() != "crd-install"))
                .unwrap_or(false)
    }

    /// Whether this object opted out of sync comparison altogether.
    pub fn ignored_from_comparison(&self) -> bool {
        self.has_annotation_option(ANNOTATION_COMPARE_OPTIONS, "Ignore")
            || self
                .annotation(HELM_HOOK_ANNOTATION)
                .map(|v| v.split(',').any(|h| h.trim() == "crd-install"))
                .unwrap_or(false)
    }
}

// ---------------- Identity ----------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

/// Resource identity excluding version: Group/Kind/Namespace/Name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.kind, self.namespace, self.name)
    }
}

// ---------------- Sync & health statuses ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Unknown,
    Synced,
    OutOfSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatusCode {
    Unknown,
    Progressing,
    Healthy,
    Suspended,
    Degraded,
    Missing,
}

impl HealthStatusCode {
    fn rank(self) -> u8 {
        match self {
            HealthStatusCode::Healthy => 0,
            HealthStatusCode::Suspended => 1,
            HealthStatusCode::Progressing => 2,
            HealthStatusCode::Missing => 3,
            HealthStatusCode::Degraded => 4,
            HealthStatusCode::Unknown => 5,
        }
    }

    /// Worst-of ordering used when aggregating per-resource health.
    pub fn is_worse_than(self, other: HealthStatusCode) -> bool {
        self.rank() > other.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthStatusCode,
    pub message: String,
}

impl HealthStatus {
    pub fn unknown() -> Self {
        Self { status: HealthStatusCode::Unknown, message: String::new() }
    }
}

// ---------------- Conditions ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionKind {
    ComparisonError,
    RepeatedResourceWarning,
    ExcludedResourceWarning,
    SharedResourceWarning,
    InvalidSpecError,
    SyncError,
}

/// The condition kinds owned (fully replaced each pass) by the comparison
/// pipeline. All other kinds are left untouched.
pub const OWNED_CONDITION_KINDS: [ConditionKind; 4] = [
    ConditionKind::ComparisonError,
    ConditionKind::RepeatedResourceWarning,
    ConditionKind::ExcludedResourceWarning,
    ConditionKind::SharedResourceWarning,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationCondition {
    pub kind: ConditionKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ApplicationCondition {
    pub fn new(kind: ConditionKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), timestamp: Utc::now() }
    }
}

// ---------------- Application source ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationSourceType {
    Directory,
    Helm,
    Kustomize,
    Plugin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmParameter {
    pub name: String,
    pub value: String,
}

/// The closed set of manifest tooling variants, each with its own option bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceTool {
    Directory { recurse: bool },
    Helm { value_files: Vec<String>, parameters: Vec<HelmParameter> },
    Kustomize { name_prefix: String, images: Vec<String> },
    Plugin { name: String, env: Vec<(String, String)> },
}

impl SourceTool {
    pub fn source_type(&self) -> ApplicationSourceType {
        match self {
            SourceTool::Directory { .. } => ApplicationSourceType::Directory,
            SourceTool::Helm { .. } => ApplicationSourceType::Helm,
            SourceTool::Kustomize { .. } => ApplicationSourceType::Kustomize,
            SourceTool::Plugin { .. } => ApplicationSourceType::Plugin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSource {
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
    pub tool: SourceTool,
}

impl Default for ApplicationSource {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            path: String::new(),
            target_revision: "HEAD".to_string(),
            tool: SourceTool::Directory { recurse: false },
        }
    }
}

// ---------------- Application ----------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Destination {
    pub server: String,
    pub namespace: String,
}

/// Per-resource rule removing JSON pointers from comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreDifference {
    pub group: String,
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub json_pointers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparedTo {
    pub source: ApplicationSource,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncStatusCode,
    pub compared_to: ComparedTo,
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// None means unset: hooks and ignored resources carry no sync verdict.
    pub status: Option<SyncStatusCode>,
    pub health: Option<HealthStatus>,
    pub hook: bool,
    pub requires_pruning: bool,
}

impl ResourceStatus {
    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionHistoryEntry {
    pub id: i64,
    pub revision: String,
    pub deployed_at: DateTime<Utc>,
    pub source: ApplicationSource,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub sync: Option<SyncStatus>,
    pub health: Option<HealthStatus>,
    /// Conditions keyed by kind; the pipeline replaces only the owned kinds.
    pub conditions: BTreeMap<ConditionKind, Vec<ApplicationCondition>>,
    pub history: Vec<RevisionHistoryEntry>,
}

impl ApplicationStatus {
    /// Replace the four pipeline-owned condition kinds with `new`, leaving
    /// every other kind untouched.
    pub fn set_owned_conditions(&mut self, new: Vec<ApplicationCondition>) {
        for kind in OWNED_CONDITION_KINDS {
            self.conditions.remove(&kind);
        }
        for c in new {
            debug_assert!(OWNED_CONDITION_KINDS.contains(&c.kind));
            self.conditions.entry(c.kind).or_default().push(c);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub source: ApplicationSource,
    pub destination: Destination,
    pub ignore_differences: Vec<IgnoreDifference>,
    pub revision_history_limit: Option<usize>,
}

impl Default for ApplicationSpec {
    fn default() -> Self {
        Self {
            source: ApplicationSource::default(),
            destination: Destination::default(),
            ignore_differences: Vec::new(),
            revision_history_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Control-plane namespace the Application object itself lives in.
    pub namespace: String,
    pub spec: ApplicationSpec,
    pub status: ApplicationStatus,
}

impl Application {
    pub fn revision_history_limit(&self) -> usize {
        self.spec.revision_history_limit.unwrap_or_else(|| {
            std::env::var("REGATTA_REVISION_HISTORY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10)
        })
    }

    /// True when `obj` is this application's own manifest. The application
    /// must not count toward (or poison) its own health.
    pub fn is_self_reference(&self, obj: &Unstructured) -> bool {
        obj.group() == APPLICATION_GROUP
            && obj.kind() == APPLICATION_KIND
            && obj.name() == self.name
            && obj.namespace() == self.namespace
    }
}

// ---------------- Project permissions ----------------

/// Group/Kind selector with `*` wildcards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKindSelector {
    pub group: String,
    pub kind: String,
}

impl GroupKindSelector {
    pub fn matches(&self, gk: &GroupKind) -> bool {
        wildcard_match(&self.group, &gk.group) && wildcard_match(&self.kind, &gk.kind)
    }
}

/// Destination rule with `*` wildcards on server and namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRule {
    pub server: String,
    pub namespace: String,
}

/// Project policy: which destinations and resource kinds an application may
/// manage. Cluster-scoped kinds are allow-listed, namespaced kinds deny-listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppProject {
    pub name: String,
    pub destinations: Vec<DestinationRule>,
    pub cluster_resource_allow: Vec<GroupKindSelector>,
    pub namespace_resource_deny: Vec<GroupKindSelector>,
}

impl AppProject {
    /// A permissive default project, handy for tests and single-tenant use.
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destinations: vec![DestinationRule { server: "*".into(), namespace: "*".into() }],
            cluster_resource_allow: vec![GroupKindSelector { group: "*".into(), kind: "*".into() }],
            namespace_resource_deny: Vec::new(),
        }
    }

    pub fn is_destination_permitted(&self, server: &str, namespace: &str) -> bool {
        self.destinations
            .iter()
            .any(|d| wildcard_match(&d.server, server) && wildcard_match(&d.namespace, namespace))
    }

    pub fn is_group_kind_permitted(&self, gk: &GroupKind, namespaced: bool) -> bool {
        if namespaced {
            !self.namespace_resource_deny.iter().any(|s| s.matches(gk))
        } else {
            self.cluster_resource_allow.iter().any(|s| s.matches(gk))
        }
    }

    pub fn is_live_resource_permitted(&self, obj: &Unstructured, server: &str) -> bool {
        let namespaced = !obj.namespace().is_empty();
        self.is_group_kind_permitted(&obj.group_kind(), namespaced)
            && if namespaced {
                self.is_destination_permitted(server, obj.namespace())
            } else {
                true
            }
    }
}

/// Single-`*` glob match: `*` alone matches anything, otherwise the pattern
/// splits into a required prefix and suffix.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
        None => pattern == value,
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
    fn gvk_accessors_split_api_version() {
        let o = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}}));
        assert_eq!(o.group(), "apps");
        assert_eq!(o.version(), "v1");
        assert_eq!(o.kind(), "Deployment");
        let core = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
    }

    #[test]
    fn set_namespace_empty_removes_field() {
        let mut o = obj(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "n", "namespace": "x"}}));
        o.set_namespace("");
        assert!(o.0["metadata"].get("namespace").is_none());
        o.set_namespace("ns1");
        assert_eq!(o.namespace(), "ns1");
    }

    #[test]
    fn annotation_options_are_comma_separated() {
        let o = obj(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c", "annotations": {ANNOTATION_COMPARE_OPTIONS: "IgnoreExtraneous, Ignore"}}
        }));
        assert!(o.has_annotation_option(ANNOTATION_COMPARE_OPTIONS, "IgnoreExtraneous"));
        assert!(o.has_annotation_option(ANNOTATION_COMPARE_OPTIONS, "Ignore"));
        assert!(!o.has_annotation_option(ANNOTATION_COMPARE_OPTIONS, "Prune"));
    }

    #[test]
    fn hook_detection_covers_native_and_helm() {
        let native = obj(json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "j", "annotations": {ANNOTATION_HOOK: "PreSync"}}}));
        assert!(native.is_hook());
        let helm = obj(json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "j", "annotations": {"helm.sh/hook": "pre-install"}}}));
        assert!(helm.is_hook());
        let plain = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        assert!(!plain.is_hook());
    }

    #[test]
    fn crd_install_is_ignored_not_a_hook() {
        let crd = obj(json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com", "annotations": {"helm.sh/hook": "crd-install"}}}));
        assert!(!crd.is_hook());
        assert!(crd.ignored_from_comparison());
        let mixed = obj(json!({"apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "j", "annotations": {"helm.sh/hook": "pre-install,crd-install"}}}));
        assert!(mixed.is_hook());
    }

    #[test]
    fn owned_conditions_replace_leaves_others() {
        let mut status = ApplicationStatus::default();
        status
            .conditions
            .entry(ConditionKind::InvalidSpecError)
            .or_default()
            .push(ApplicationCondition::new(ConditionKind::InvalidSpecError, "bad spec"));
        status.set_owned_conditions(vec![
            ApplicationCondition::new(ConditionKind::ComparisonError, "boom"),
            ApplicationCondition::new(ConditionKind::ComparisonError, "boom again"),
        ]);
        assert_eq!(status.conditions[&ConditionKind::ComparisonError].len(), 2);
        assert_eq!(status.conditions[&ConditionKind::InvalidSpecError].len(), 1);

        status.set_owned_conditions(Vec::new());
        assert!(!status.conditions.contains_key(&ConditionKind::ComparisonError));
        assert!(status.conditions.contains_key(&ConditionKind::InvalidSpecError));
    }

    #[test]
    fn project_permissions_split_by_scope() {
        let mut proj = AppProject::permissive("default");
        proj.cluster_resource_allow = vec![GroupKindSelector { group: "".into(), kind: "Namespace".into() }];
        proj.namespace_resource_deny = vec![GroupKindSelector { group: "*".into(), kind: "Secret".into() }];

        let ns_kind = GroupKind { group: "".into(), kind: "Namespace".into() };
        let crd_kind = GroupKind { group: "apiextensions.k8s.io".into(), kind: "CustomResourceDefinition".into() };
        assert!(proj.is_group_kind_permitted(&ns_kind, false));
        assert!(!proj.is_group_kind_permitted(&crd_kind, false));

        let secret = GroupKind { group: "".into(), kind: "Secret".into() };
        assert!(!proj.is_group_kind_permitted(&secret, true));
        let cm = GroupKind { group: "".into(), kind: "ConfigMap".into() };
        assert!(proj.is_group_kind_permitted(&cm, true));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("https://prod-*", "https://prod-east"));
        assert!(!wildcard_match("https://prod-*", "https://staging"));
        assert!(wildcard_match("*.k8s.io", "events.k8s.io"));
        assert!(!wildcard_match("exact", "other"));
    }

    #[test]
    fn health_worst_of_ordering() {
        use HealthStatusCode::*;
        assert!(Degraded.is_worse_than(Progressing));
        assert!(Missing.is_worse_than(Suspended));
        assert!(Unknown.is_worse_than(Degraded));
        assert!(!Healthy.is_worse_than(Suspended));
    }

    #[test]
    fn self_reference_matches_own_manifest() {
        let app = Application { name: "guestbook".into(), namespace: "regatta".into(), ..Default::default() };
        let own = obj(json!({"apiVersion": "regatta.io/v1alpha1", "kind": "Application",
            "metadata": {"name": "guestbook", "namespace": "regatta"}}));
        let other = obj(json!({"apiVersion": "regatta.io/v1alpha1", "kind": "Application",
            "metadata": {"name": "other", "namespace": "regatta"}}));
        assert!(app.is_self_reference(&own));
        assert!(!app.is_self_reference(&other));
    }
}
