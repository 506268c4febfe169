//! A single Helm chart release and its deploy pipeline

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cluster::{ClusterApi, PodInfo};
use crate::environment::connections::{ChartConnection, ChartConnections, ConnectionKey};
use crate::environment::forward::{port_rules, ForwardHandle, ForwardStrategy};
use crate::error::{Error, Result};
use crate::installer::{InstallRequest, Installer};

/// Label used to enumerate instances of the same app to ease access
pub const APP_LABEL_KEY: &str = "app";
/// Additional label to enumerate app instances
pub const INSTANCE_LABEL_KEY: &str = "instance";
/// Label selecting all pods produced by one release
pub const RELEASE_LABEL_KEY: &str = "release";

/// Environment variable overriding where named charts are looked up.
pub const CHARTS_ROOT_ENV: &str = "CHARTBED_CHARTS_ROOT";

/// Everything a single chart needs to deploy, connect and run hooks.
#[derive(Clone)]
pub struct DeployContext {
    pub namespace: String,
    pub cluster: Arc<dyn ClusterApi>,
    pub installer: Arc<dyn Installer>,
    pub forwarder: Arc<dyn ForwardStrategy>,
    pub install_timeout: Duration,
}

/// Hook invoked before or after a chart deploy.
#[async_trait]
pub trait DeployHook: Send + Sync {
    async fn run(&self, ctx: &DeployContext) -> Result<()>;
}

/// Where the chart's files come from. The variants are mutually exclusive
/// and resolved to a filesystem path exactly once, at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartSource {
    /// Local chart directory or archive.
    Path(PathBuf),
    /// Remote chart archive, downloaded once into a local cache.
    Url(String),
    /// Named chart resolved from the charts root directory.
    Named(String),
}

/// A single Helm chart to be installed into a cluster.
#[derive(Clone, Serialize, Deserialize)]
pub struct HelmChart {
    pub release_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ChartSource>,
    /// Override values merged over the chart defaults.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,
    /// Wave index. Zero is reserved as unset/invalid.
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default, skip_serializing_if = "ChartConnections::is_empty")]
    pub chart_connections: ChartConnections,
    #[serde(skip)]
    pub before_hook: Option<Arc<dyn DeployHook>>,
    #[serde(skip)]
    pub after_hook: Option<Arc<dyn DeployHook>>,
    /// Filled by source resolution.
    #[serde(skip)]
    resolved_path: Option<PathBuf>,
}

impl fmt::Debug for HelmChart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelmChart")
            .field("release_name", &self.release_name)
            .field("source", &self.source)
            .field("index", &self.index)
            .field("auto_connect", &self.auto_connect)
            .field("chart_connections", &self.chart_connections)
            .finish()
    }
}

impl HelmChart {
    pub fn new(release_name: impl Into<String>, index: u32) -> Self {
        Self {
            release_name: release_name.into(),
            source: None,
            values: serde_json::Value::Null,
            index,
            auto_connect: false,
            chart_connections: ChartConnections::new(),
            before_hook: None,
            after_hook: None,
            resolved_path: None,
        }
    }

    pub fn with_source(mut self, source: ChartSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_values(mut self, values: serde_json::Value) -> Self {
        self.values = values;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Deploy this chart: resolve the source, run hooks, install, discover
    /// pods and record their connections, optionally auto-connect.
    ///
    /// Returns forwarding handles when auto-connect is on.
    pub(crate) async fn deploy(&mut self, ctx: &DeployContext) -> Result<Vec<ForwardHandle>> {
        let chart_path = self.resolve_source().await?;

        if let Some(hook) = self.before_hook.clone() {
            hook.run(ctx).await?;
        }

        tracing::info!(
            release = %self.release_name,
            namespace = %ctx.namespace,
            chart = %chart_path.display(),
            values = %self.values,
            "Installing Helm chart"
        );
        ctx.installer
            .install(&self.install_request(chart_path, ctx))
            .await?;

        self.enumerate_instances(ctx).await?;
        let pods = self.fetch_pods(ctx).await?;
        self.record_connections(&pods)?;

        let mut handles = Vec::new();
        if self.auto_connect {
            handles = self.connect(ctx).await?;
        }

        if let Some(hook) = self.after_hook.clone() {
            hook.run(ctx).await?;
        }
        Ok(handles)
    }

    /// Upgrade an already deployed release with the current values and
    /// re-discover its connections.
    pub(crate) async fn upgrade(&mut self, ctx: &DeployContext) -> Result<()> {
        let chart_path = self.resolve_source().await?;
        tracing::info!(
            release = %self.release_name,
            namespace = %ctx.namespace,
            "Upgrading Helm chart"
        );
        ctx.installer
            .upgrade(&self.install_request(chart_path, ctx))
            .await?;

        self.enumerate_instances(ctx).await?;
        let pods = self.fetch_pods(ctx).await?;
        self.record_connections(&pods)
    }

    /// Connect every discovered pod's named ports. Pods that are already
    /// connected are skipped, making this safe to re-run after a partial
    /// failure.
    pub(crate) async fn connect(&mut self, ctx: &DeployContext) -> Result<Vec<ForwardHandle>> {
        let mut handles = Vec::new();
        for (key, connection) in self.chart_connections.iter_mut() {
            if connection.is_connected() {
                tracing::info!(
                    pod = %connection.pod_name,
                    ports = ?connection.local_ports,
                    "Already connected"
                );
                continue;
            }
            tracing::debug!(key = %key, "Building port rules");
            let rules = port_rules(connection)?;
            if rules.is_empty() {
                continue;
            }
            let handle = ctx
                .forwarder
                .connect(&ctx.namespace, connection, &rules)
                .await?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Pods discovered for this chart whose names contain the substring.
    pub fn pods_by_name_substring(&self, substring: &str) -> Result<Vec<String>> {
        if self.chart_connections.is_empty() {
            return Err(Error::StateError(format!(
                "chart {} has no discovered pods",
                self.release_name
            )));
        }
        let mut pods: Vec<String> = self
            .chart_connections
            .iter()
            .map(|(_, c)| c.pod_name.clone())
            .filter(|name| name.contains(substring))
            .collect();
        pods.sort();
        pods.dedup();
        Ok(pods)
    }

    fn install_request(&self, chart: PathBuf, ctx: &DeployContext) -> InstallRequest {
        InstallRequest {
            release: self.release_name.clone(),
            chart,
            namespace: ctx.namespace.clone(),
            values: self.values.clone(),
            timeout: ctx.install_timeout,
        }
    }

    /// Resolve the chart source to a local path, downloading remote
    /// archives into the cache on first use.
    async fn resolve_source(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.resolved_path {
            return Ok(path.clone());
        }
        let resolved = match &self.source {
            Some(ChartSource::Path(path)) => {
                let absolute = std::path::absolute(path)?;
                if !absolute.exists() {
                    return Err(Error::NotFoundError(format!(
                        "chart path {} does not exist",
                        absolute.display()
                    )));
                }
                absolute
            }
            Some(ChartSource::Url(url)) => download_chart(url).await?,
            Some(ChartSource::Named(name)) => named_chart(name)?,
            None => named_chart(&self.release_name)?,
        };
        self.resolved_path = Some(resolved.clone());
        Ok(resolved)
    }

    /// Patch a deterministic `instance` ordinal onto every pod, per app
    /// label. Pods are ordered by IP before labeling so re-enumeration of
    /// an unchanged pod set yields identical ordinals.
    async fn enumerate_instances(&self, ctx: &DeployContext) -> Result<()> {
        let apps = self.unique_app_labels(ctx).await?;
        for app in apps {
            let selector = format!("{}={}", APP_LABEL_KEY, app);
            let mut pods = ctx.cluster.list_pods(&ctx.namespace, &selector).await?;
            pods.sort_by(|a, b| a.ip.cmp(&b.ip));
            for (i, pod) in pods.iter().enumerate() {
                ctx.cluster
                    .add_pod_label(
                        &ctx.namespace,
                        &pod.name,
                        INSTANCE_LABEL_KEY,
                        &i.to_string(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn unique_app_labels(&self, ctx: &DeployContext) -> Result<Vec<String>> {
        let pods = ctx
            .cluster
            .list_pods(&ctx.namespace, APP_LABEL_KEY)
            .await
            .map_err(|e| {
                Error::UpstreamError(format!(
                    "no pods with label '{}' found for enumeration: {}",
                    APP_LABEL_KEY, e
                ))
            })?;
        let mut apps = Vec::new();
        for pod in pods {
            if let Some(app) = pod.labels.get(APP_LABEL_KEY) {
                if !apps.contains(app) {
                    apps.push(app.clone());
                }
            }
        }
        tracing::info!(apps = ?apps, "Apps found");
        Ok(apps)
    }

    async fn fetch_pods(&self, ctx: &DeployContext) -> Result<Vec<PodInfo>> {
        let selector = format!("{}={}", RELEASE_LABEL_KEY, self.release_name);
        ctx.cluster.list_pods(&ctx.namespace, &selector).await
    }

    /// Record one ChartConnection per (app, instance, container), keyed by
    /// the enumeration labels patched during deploy.
    fn record_connections(&mut self, pods: &[PodInfo]) -> Result<()> {
        self.chart_connections.clear();
        for pod in pods {
            let app = match pod.labels.get(APP_LABEL_KEY) {
                Some(app) => app.clone(),
                None => {
                    tracing::warn!(pod = %pod.name, "App label not found");
                    String::new()
                }
            };
            let instance = pod
                .labels
                .get(INSTANCE_LABEL_KEY)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or_else(|| {
                    tracing::warn!(pod = %pod.name, "Instance label not found");
                    0
                });
            for container in &pod.containers {
                let remote_ports = container
                    .ports
                    .iter()
                    .map(|p| (p.name.clone(), p.number))
                    .collect();
                self.chart_connections.store(
                    ConnectionKey::new(app.clone(), instance, container.name.clone()),
                    ChartConnection {
                        pod_name: pod.name.clone(),
                        pod_ip: pod.ip.clone(),
                        forwarder_pid: 0,
                        remote_ports,
                        local_ports: Default::default(),
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Root directory for named charts.
fn charts_root() -> PathBuf {
    match std::env::var(CHARTS_ROOT_ENV) {
        Ok(root) => PathBuf::from(root),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR")).join("charts"),
    }
}

fn named_chart(name: &str) -> Result<PathBuf> {
    let path = charts_root().join(name);
    if !path.exists() {
        return Err(Error::NotFoundError(format!(
            "chart '{}' not found under {}",
            name,
            charts_root().display()
        )));
    }
    Ok(path)
}

/// Download a remote chart archive into the local cache, skipping the
/// download when it is already cached.
async fn download_chart(raw_url: &str) -> Result<PathBuf> {
    let url = Url::parse(raw_url)?;
    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::ValidationError(format!("chart URL '{}' has no file name", raw_url))
        })?
        .to_string();

    let cache_dir = std::env::temp_dir().join("chartbed-charts");
    tokio::fs::create_dir_all(&cache_dir).await?;
    let target = cache_dir.join(&file_name);
    if target.exists() {
        tracing::debug!(url = raw_url, path = %target.display(), "Chart already downloaded");
        return Ok(target);
    }

    tracing::info!(url = raw_url, "Downloading Helm chart");
    let response = reqwest::get(url).await.map_err(|e| {
        Error::UpstreamError(format!("failed to download chart {}: {}", raw_url, e))
    })?;
    if !response.status().is_success() {
        return Err(Error::UpstreamError(format!(
            "failed to download chart {}: HTTP {}",
            raw_url,
            response.status()
        )));
    }
    let bytes = response.bytes().await.map_err(|e| {
        Error::UpstreamError(format!("failed to read chart body {}: {}", raw_url, e))
    })?;
    tokio::fs::write(&target, &bytes).await?;
    Ok(target)
}
