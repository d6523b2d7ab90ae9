//! Regatta comparison core: compares an application's declared source state
//! to the observed live state and produces a structured verdict.

#![forbid(unsafe_code)]

pub mod reconcile;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use metrics::{counter, histogram};
use regatta_core::{
    AppProject, Application, ApplicationCondition, ApplicationSource, ApplicationSourceType,
    ComparedTo, ConditionKind, HealthStatus, ResourceStatus, SyncStatus, SyncStatusCode,
    Unstructured, ANNOTATION_COMPARE_OPTIONS,
};
use regatta_diff::{DiffEngine, DiffResult, DiffResultList, Normalizer};
use regatta_health::HealthAssessor;
use regatta_livestate::{LiveObjsByKey, LiveStateCache};
use regatta_persist::StatusStore;
use regatta_repo::{get_repo_objs, parse_manifests, AppDb, ManifestResponse, RenderService};
use regatta_settings::{ResourceOverride, ResourcesFilter, SettingsSource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use reconcile::{dedup_target_objects, filter_excluded, reconcile, ReconciliationResult};

// ---------------- Results ----------------

/// A target/live pair with its diff, after reconciliation.
/// Target and Live are never both absent.
#[derive(Debug, Clone)]
pub struct ManagedResource {
    pub target: Option<Unstructured>,
    pub live: Option<Unstructured>,
    pub diff: DiffResult,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub hook: bool,
}

/// Live sides of a managed-resource list, aligned by index.
pub fn live_objs(resources: &[ManagedResource]) -> Vec<Option<Unstructured>> {
    resources.iter().map(|r| r.live.clone()).collect()
}

/// The verdict of one comparison pass. Entirely transient; rebuilt every pass.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub sync_status: SyncStatus,
    pub health_status: HealthStatus,
    pub resources: Vec<ResourceStatus>,
    pub managed_resources: Vec<ManagedResource>,
    pub reconciliation: ReconciliationResult,
    pub source_type: Option<ApplicationSourceType>,
    /// Normalizer built for this pass; the sync engine reuses it when
    /// computing apply patches.
    pub normalizer: Normalizer,
    /// Duration of each comparison phase, for statistical purposes.
    pub timings: BTreeMap<String, Duration>,
}

// ---------------- Pass bookkeeping ----------------

/// Per-pass accumulator: conditions gathered so far plus whether an upstream
/// load failure forces Unknown verdicts.
#[derive(Debug, Default)]
struct PassState {
    conditions: Vec<ApplicationCondition>,
    degraded: bool,
}

impl PassState {
    fn warn(&mut self, kind: ConditionKind, message: impl Into<String>) {
        self.conditions.push(ApplicationCondition::new(kind, message));
    }

    fn error(&mut self, message: impl Into<String>) {
        self.conditions.push(ApplicationCondition::new(ConditionKind::ComparisonError, message));
    }

    /// Record a ComparisonError and mark the whole pass degraded.
    fn degrade(&mut self, message: impl Into<String>) {
        self.error(message);
        self.degraded = true;
    }
}

struct Timings {
    last: Instant,
    map: BTreeMap<String, Duration>,
}

impl Timings {
    fn start() -> Self {
        Self { last: Instant::now(), map: BTreeMap::new() }
    }

    fn checkpoint(&mut self, name: &str) {
        let now = Instant::now();
        self.map.insert(name.to_string(), now - self.last);
        self.last = now;
    }
}

// ---------------- Comparison settings ----------------

struct ComparisonSettings {
    app_label_key: String,
    overrides: HashMap<String, ResourceOverride>,
    normalizer: Normalizer,
    filter: ResourcesFilter,
}

// ---------------- Manager ----------------

/// Compares application declared state against live state. One pass runs
/// synchronously within a single logical task; passes for the same
/// application are externally serialized.
pub struct AppStateManager {
    settings: Arc<dyn SettingsSource>,
    db: Arc<dyn AppDb>,
    render: Arc<dyn RenderService>,
    live_state: Arc<dyn LiveStateCache>,
    diff_engine: Arc<dyn DiffEngine>,
    health: Arc<dyn HealthAssessor>,
    status_store: Arc<dyn StatusStore>,
}

impl AppStateManager {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        db: Arc<dyn AppDb>,
        render: Arc<dyn RenderService>,
        live_state: Arc<dyn LiveStateCache>,
        diff_engine: Arc<dyn DiffEngine>,
        health: Arc<dyn HealthAssessor>,
        status_store: Arc<dyn StatusStore>,
    ) -> Self {
        Self { settings, db, render, live_state, diff_engine, health, status_store }
    }

    fn comparison_settings(&self, app: &Application) -> Result<ComparisonSettings> {
        let overrides = self.settings.get_resource_overrides()?;
        let app_label_key = self.settings.get_app_instance_label_key()?;
        let normalizer = Normalizer::new(&app.spec.ignore_differences, &overrides)?;
        let filter = self.settings.get_resources_filter()?;
        Ok(ComparisonSettings { app_label_key, overrides, normalizer, filter })
    }

    /// Compare the application's declared state (at `revision`, from `source`)
    /// to the live cluster state. Settings-load failure short-circuits to a
    /// minimal Unknown result; every later failure degrades the pass but the
    /// pipeline proceeds.
    pub async fn compare_app_state(
        &self,
        app: &mut Application,
        project: &AppProject,
        revision: Option<&str>,
        source: ApplicationSource,
        no_cache: bool,
        local_manifests: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> ComparisonResult {
        let t0 = Instant::now();
        counter!("compare_total", 1u64);
        let mut ts = Timings::start();

        let compared_to = ComparedTo {
            source: source.clone(),
            destination: app.spec.destination.clone(),
        };

        let cmp = match self.comparison_settings(app) {
            Ok(c) => c,
            // Basic comparison settings could not be loaded: report an
            // Unknown verdict with no resource detail.
            Err(e) => {
                info!(app = %app.name, error = %e, "comparison settings unavailable");
                return ComparisonResult {
                    sync_status: SyncStatus {
                        status: SyncStatusCode::Unknown,
                        compared_to,
                        revision: None,
                    },
                    health_status: HealthStatus::unknown(),
                    resources: Vec::new(),
                    managed_resources: Vec::new(),
                    reconciliation: ReconciliationResult::default(),
                    source_type: None,
                    normalizer: Normalizer::default(),
                    timings: BTreeMap::new(),
                };
            }
        };
        ts.checkpoint("settings_ms");

        let server = app.spec.destination.server.clone();
        let dest_namespace = app.spec.destination.namespace.clone();
        info!(app = %app.name, cluster = %server, namespace = %dest_namespace, "comparing app state");

        // Best-effort loading of live and target state: present as much
        // information as possible even when a source fails.
        let mut pass = PassState::default();

        let (mut target_objs, manifest_info): (Vec<Unstructured>, Option<ManifestResponse>) =
            match local_manifests {
                Some(local) => match parse_manifests(local) {
                    Ok(objs) => (objs, None),
                    Err(e) => {
                        pass.degrade(e.to_string());
                        (Vec::new(), None)
                    }
                },
                None => {
                    let load = get_repo_objs(
                        self.db.as_ref(),
                        self.render.as_ref(),
                        self.settings.as_ref(),
                        self.live_state.as_ref(),
                        app,
                        &source,
                        &cmp.app_label_key,
                        revision,
                        no_cache,
                    );
                    match with_cancel(cancel, load).await {
                        Ok((objs, info)) => (objs, Some(info)),
                        Err(e) => {
                            pass.degrade(e.to_string());
                            (Vec::new(), None)
                        }
                    }
                }
            };
        ts.checkpoint("git_ms");

        match dedup_target_objects(self.live_state.as_ref(), &server, &dest_namespace, &target_objs)
        {
            Ok((deduped, conditions)) => {
                target_objs = deduped;
                pass.conditions.extend(conditions);
            }
            Err(e) => pass.degrade(e.to_string()),
        }

        let (target_objs, removed) = filter_excluded(target_objs, &cmp.filter, &server);
        for (_obj, reason) in removed {
            pass.warn(ConditionKind::ExcludedResourceWarning, reason);
        }
        ts.checkpoint("dedup_ms");

        let mut live_by_key: LiveObjsByKey =
            match with_cancel(cancel, self.live_state.get_managed_live_objs(app, &target_objs)).await {
                Ok(map) => map,
                Err(e) => {
                    pass.degrade(e.to_string());
                    Default::default()
                }
            };
        debug!(app = %app.name, live = live_by_key.len(), "retrieved live manifests");

        // Drop live resources the project does not permit on this destination.
        live_by_key.retain(|_k, v| match v {
            Some(obj) => project.is_live_resource_permitted(obj, &server),
            None => true,
        });

        for live_obj in live_by_key.values().flatten() {
            if let Some(instance) = live_obj.app_instance_label(&cmp.app_label_key) {
                if instance != app.name {
                    pass.warn(
                        ConditionKind::SharedResourceWarning,
                        format!(
                            "{}/{} is part of a different application: {}",
                            live_obj.kind(),
                            live_obj.name(),
                            instance
                        ),
                    );
                }
            }
        }

        let reconciliation = reconcile(target_objs, live_by_key);
        ts.checkpoint("live_ms");

        let diff_results = match self.diff_engine.diff_array(
            &reconciliation.target,
            &reconciliation.live,
            &cmp.normalizer,
        ) {
            Ok(list) => list,
            Err(e) => {
                pass.degrade(e.to_string());
                DiffResultList::default()
            }
        };
        ts.checkpoint("diff_ms");

        let (mut resources, managed_resources, mut sync_code) =
            self.classify(&reconciliation, &diff_results, project, &server, pass.degraded);

        if pass.degraded {
            sync_code = SyncStatusCode::Unknown;
        }
        let sync_status = SyncStatus {
            status: sync_code,
            compared_to,
            revision: manifest_info.as_ref().map(|m| m.revision.clone()),
        };
        ts.checkpoint("sync_ms");

        let lives = live_objs(&managed_resources);
        let health_status = match self.health.set_application_health(
            &mut resources,
            &lives,
            &cmp.overrides,
            &|obj| !app.is_self_reference(obj),
        ) {
            Ok(h) => h,
            Err(e) => {
                pass.error(e.to_string());
                HealthStatus::unknown()
            }
        };
        ts.checkpoint("health_ms");

        if pass.degraded {
            counter!("compare_degraded_total", 1u64);
        }
        app.status.set_owned_conditions(pass.conditions);

        histogram!("compare_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            app = %app.name,
            sync = ?sync_status.status,
            health = ?health_status.status,
            resources = resources.len(),
            degraded = pass.degraded,
            took_ms = %t0.elapsed().as_millis(),
            "app state compared"
        );

        ComparisonResult {
            sync_status,
            health_status,
            resources,
            managed_resources,
            reconciliation,
            source_type: manifest_info.map(|m| m.source_type),
            normalizer: cmp.normalizer,
            timings: ts.map,
        }
    }

    /// Per-pair sync verdict plus the running aggregate.
    fn classify(
        &self,
        reconciliation: &ReconciliationResult,
        diff_results: &DiffResultList,
        project: &AppProject,
        server: &str,
        degraded: bool,
    ) -> (Vec<ResourceStatus>, Vec<ManagedResource>, SyncStatusCode) {
        let mut sync_code = SyncStatusCode::Synced;
        let mut resources = Vec::with_capacity(reconciliation.target.len());
        let mut managed = Vec::with_capacity(reconciliation.target.len());

        for (i, target) in reconciliation.target.iter().enumerate() {
            let live = &reconciliation.live[i];
            let obj = match live.as_ref().or(target.as_ref()) {
                Some(o) => o,
                // Excluded by the reconciliation invariant.
                None => continue,
            };
            let gvk = obj.gvk();
            let hook = obj.is_hook();
            let requires_pruning = target.is_none() && live.is_some();
            let diff = diff_results.diffs.get(i).cloned().unwrap_or_else(DiffResult::empty);

            let mut status = None;
            if hook || obj.ignored_from_comparison() {
                // Hooks and ignored resources carry no sync status and do not
                // affect the aggregate.
            } else if diff.modified || target.is_none() || live.is_none() {
                // OutOfSync: sides differ, or one of them is absent.
                status = Some(SyncStatusCode::OutOfSync);
                let prune_ignored = requires_pruning
                    && obj.has_annotation_option(ANNOTATION_COMPARE_OPTIONS, "IgnoreExtraneous");
                if !prune_ignored {
                    sync_code = SyncStatusCode::OutOfSync;
                }
            } else {
                status = Some(SyncStatusCode::Synced);
            }

            // Resources the project does not permit get an Unknown verdict.
            let namespaced = self
                .live_state
                .is_namespaced(server, &gvk.group_kind())
                .unwrap_or(false);
            if !project.is_group_kind_permitted(&gvk.group_kind(), namespaced) {
                status = Some(SyncStatusCode::Unknown);
            }

            // Nothing confident can be said about a pass with missing data.
            if degraded {
                status = Some(SyncStatusCode::Unknown);
            }

            resources.push(ResourceStatus {
                group: gvk.group.clone(),
                version: gvk.version.clone(),
                kind: gvk.kind.clone(),
                namespace: obj.namespace().to_string(),
                name: obj.name().to_string(),
                status,
                health: None,
                hook,
                requires_pruning,
            });
            managed.push(ManagedResource {
                target: target.clone(),
                live: live.clone(),
                diff,
                group: gvk.group,
                version: gvk.version,
                kind: gvk.kind,
                namespace: obj.namespace().to_string(),
                name: obj.name().to_string(),
                hook,
            });
        }
        (resources, managed, sync_code)
    }

    /// Record the accepted revision in the application's bounded history and
    /// persist it as a partial status merge.
    pub fn persist_revision_history(
        &self,
        app: &mut Application,
        revision: &str,
        source: ApplicationSource,
    ) -> Result<()> {
        regatta_persist::persist_revision_history(app, revision, source, self.status_store.as_ref())
    }
}

/// Race a collaborator call against caller cancellation. Cancellation is a
/// plain error here; the orchestrator turns it into a degraded outcome.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("comparison cancelled")),
        r = fut => r,
    }
}
