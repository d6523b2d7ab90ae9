//! Regatta target manifest loading: resolves repo records, asks the external
//! render service for manifests and parses them into unstructured objects.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use regatta_core::{Application, ApplicationSource, ApplicationSourceType, Unstructured};
use regatta_livestate::LiveStateCache;
use regatta_settings::{ConfigManagementPlugin, SettingsSource};
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------- Repository records ----------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
}

/// Credential/repository records backing manifest rendering.
#[async_trait::async_trait]
pub trait AppDb: Send + Sync {
    async fn get_repository(&self, url: &str) -> Result<Repository>;
    async fn list_helm_repositories(&self) -> Result<Vec<Repository>>;
}

/// In-memory records: unknown URLs resolve to an anonymous repository.
#[derive(Debug, Clone, Default)]
pub struct StaticDb {
    pub repositories: Vec<Repository>,
    pub helm_repositories: Vec<Repository>,
}

#[async_trait::async_trait]
impl AppDb for StaticDb {
    async fn get_repository(&self, url: &str) -> Result<Repository> {
        Ok(self
            .repositories
            .iter()
            .find(|r| r.url == url)
            .cloned()
            .unwrap_or_else(|| Repository { url: url.to_string(), ..Default::default() }))
    }

    async fn list_helm_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.helm_repositories.clone())
    }
}

// ---------------- Render service ----------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestRequest {
    pub repo: Repository,
    pub helm_repos: Vec<Repository>,
    pub revision: String,
    pub no_cache: bool,
    pub app_label_key: String,
    pub app_label_value: String,
    pub namespace: String,
    pub source: Option<ApplicationSource>,
    pub plugins: Vec<ConfigManagementPlugin>,
    pub kustomize_build_options: String,
    pub kube_version: String,
    pub api_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub manifests: Vec<String>,
    /// Revision the render actually resolved (e.g. a sha for a branch name).
    pub revision: String,
    pub source_type: ApplicationSourceType,
}

/// External manifest rendering (templating/packaging engines). One blocking
/// call, its own failure domain.
#[async_trait::async_trait]
pub trait RenderService: Send + Sync {
    async fn generate_manifest(&self, req: ManifestRequest) -> Result<ManifestResponse>;
}

// ---------------- Parsing ----------------

/// Parse manifest texts (YAML or JSON) into unstructured objects. The first
/// malformed document aborts the whole batch; blank documents are skipped.
pub fn parse_manifests(manifests: &[String]) -> Result<Vec<Unstructured>> {
    let mut out = Vec::with_capacity(manifests.len());
    for (i, text) in manifests.iter().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        let val: serde_yaml::Value =
            serde_yaml::from_str(text).with_context(|| format!("parsing manifest {}", i))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting manifest {} to JSON", i))?;
        if !json.is_object() {
            return Err(anyhow!("manifest {} is not an object", i));
        }
        let obj = Unstructured::new(json);
        if obj.api_version().is_empty() || obj.kind().is_empty() {
            return Err(anyhow!("manifest {} missing apiVersion or kind", i));
        }
        out.push(obj);
    }
    Ok(out)
}

// ---------------- Target loader ----------------

/// Obtain the desired-state objects for an application from the render
/// service, resolving repo records, plugin list, build options and cluster
/// version info first.
#[allow(clippy::too_many_arguments)]
pub async fn get_repo_objs(
    db: &dyn AppDb,
    render: &dyn RenderService,
    settings: &dyn SettingsSource,
    live: &dyn LiveStateCache,
    app: &Application,
    source: &ApplicationSource,
    app_label_key: &str,
    revision: Option<&str>,
    no_cache: bool,
) -> Result<(Vec<Unstructured>, ManifestResponse)> {
    let t0 = Instant::now();
    let helm_repos = db.list_helm_repositories().await?;
    let helm_ms = t0.elapsed().as_millis() as u64;
    let repo = db.get_repository(&source.repo_url).await?;
    let repo_ms = t0.elapsed().as_millis() as u64;

    let revision = match revision {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => source.target_revision.clone(),
    };

    let plugins = settings.get_config_management_plugins()?;
    let build_options = settings.get_kustomize_build_options()?;
    let versions = live.get_versions_info(&app.spec.destination.server).await?;
    let version_ms = t0.elapsed().as_millis() as u64;

    let resp = render
        .generate_manifest(ManifestRequest {
            repo,
            helm_repos,
            revision,
            no_cache,
            app_label_key: app_label_key.to_string(),
            app_label_value: app.name.clone(),
            namespace: app.spec.destination.namespace.clone(),
            source: Some(source.clone()),
            plugins,
            kustomize_build_options: build_options,
            kube_version: versions.server_version,
            api_versions: versions.api_groups,
        })
        .await?;
    let render_ms = t0.elapsed().as_millis() as u64;

    let target_objs = parse_manifests(&resp.manifests)?;
    info!(
        app = %app.name,
        helm_ms, repo_ms, version_ms, render_ms,
        time_ms = %t0.elapsed().as_millis(),
        manifests = target_objs.len(),
        "target manifests loaded"
    );
    Ok((target_objs, resp))
}
