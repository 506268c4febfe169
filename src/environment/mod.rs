//! Ephemeral Kubernetes environments deployed from Helm charts
//!
//! An [`Environment`] owns one namespace, a set of charts deployed into it
//! in dependency-ordered waves, the port forwards into its pods and any
//! chaos experiments running against it. A persisted [`Config`] is enough
//! to reattach to a running environment from another process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::Client;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::chaos;
use crate::chaos::Experiment;
use crate::cluster::{ClusterApi, KubeApi};
use crate::config::{Config, ConfigStore, FileStore, CONFIG_FILE_ENV};
use crate::environment::artifacts::Artifacts;
use crate::environment::chart::{DeployContext, HelmChart};
use crate::environment::connections::ChartConnections;
use crate::environment::forward::{
    kill_forwarder, ForwardHandle, ForwardStrategy, InProcessForwarder, KubectlForwarder,
};
use crate::error::{Error, Result};
use crate::installer::{HelmCli, Installer};
use crate::namegen::{NameGenerator, RandomNameGenerator};

pub mod artifacts;
pub mod chart;
pub mod connections;
pub mod forward;

/// One deployed (or deployable) test environment.
pub struct Environment {
    pub config: Config,
    cluster: Arc<dyn ClusterApi>,
    installer: Arc<dyn Installer>,
    store: Arc<dyn ConfigStore>,
    names: Arc<dyn NameGenerator>,
    forwarder: Arc<dyn ForwardStrategy>,
    artifacts: Option<Artifacts>,
    chaos: Option<chaos::Controller>,
    forwarders: Vec<ForwardHandle>,
}

impl Environment {
    /// Build an environment against the current kube context. The
    /// forwarding strategy follows `persistent_connection`: detached
    /// kubectl processes when set, in-process streams otherwise.
    pub async fn new(config: Config) -> Result<Self> {
        let client = Client::try_default().await?;
        let forwarder: Arc<dyn ForwardStrategy> = if config.persistent_connection {
            Arc::new(KubectlForwarder::default())
        } else {
            Arc::new(InProcessForwarder::new(
                client.clone(),
                config.forward_timeout,
            ))
        };
        Ok(Self::with_components(
            config,
            Arc::new(KubeApi::new(client)),
            Arc::new(HelmCli::default()),
            Arc::new(FileStore),
            Arc::new(RandomNameGenerator),
            forwarder,
        ))
    }

    /// Build an environment from explicit components. This is the seam
    /// used by tests and by callers with non-default installers.
    pub fn with_components(
        config: Config,
        cluster: Arc<dyn ClusterApi>,
        installer: Arc<dyn Installer>,
        store: Arc<dyn ConfigStore>,
        names: Arc<dyn NameGenerator>,
        forwarder: Arc<dyn ForwardStrategy>,
    ) -> Self {
        let mut env = Self {
            config,
            cluster,
            installer,
            store,
            names,
            forwarder,
            artifacts: None,
            chaos: None,
            forwarders: Vec::new(),
        };
        env.attach_namespace_components();
        env
    }

    /// Allocate the environment's namespace from the configured prefix.
    pub async fn init(&mut self) -> Result<()> {
        if self.config.namespace.is_some() {
            return Err(Error::StateError(
                "environment already has a namespace".into(),
            ));
        }
        let prefix = self
            .config
            .namespace_prefix
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::ValidationError("namespace_prefix cannot be empty".into()))?;
        let namespace = self.cluster.create_namespace(&prefix).await?;
        info!(namespace = %namespace, "Environment namespace created");
        self.config.namespace = Some(namespace);
        self.attach_namespace_components();
        self.sync_config()
    }

    /// The allocated namespace, failing if [`Environment::init`] has not
    /// run yet.
    pub fn namespace(&self) -> Result<&str> {
        self.config
            .namespace
            .as_deref()
            .ok_or_else(|| Error::StateError("environment has no namespace, call init first".into()))
    }

    /// Register a chart for deployment. The wave index must be non-zero
    /// and release names must be unique.
    pub fn add_chart(&mut self, chart: HelmChart) -> Result<()> {
        validate_chart(&chart)?;
        if self.config.charts.contains(&chart.release_name) {
            return Err(Error::ValidationError(format!(
                "chart {} is already registered",
                chart.release_name
            )));
        }
        self.config.charts.insert(chart);
        Ok(())
    }

    /// Discovered connections of one chart.
    pub fn connections(&self, release: &str) -> Result<&ChartConnections> {
        self.config.charts.connections(release)
    }

    /// Deploy every registered chart, wave by wave in ascending index
    /// order. Charts sharing an index deploy in parallel; a failure lets
    /// its wave siblings finish, then aborts before the next wave.
    pub async fn deploy_all(&mut self) -> Result<()> {
        // Charts can arrive through a loaded config as well as add_chart,
        // so the registration rules are re-checked here.
        for (_, chart) in self.config.charts.iter() {
            validate_chart(chart)?;
        }
        let ctx = self.deploy_context()?;
        for wave in self.config.charts.ordered_waves() {
            info!(charts = ?wave, "Deploying wave");
            let mut tasks = JoinSet::new();
            for release in wave {
                let mut deploying = self.config.charts.remove(&release).ok_or_else(|| {
                    Error::StateError(format!("chart {} vanished during deploy", release))
                })?;
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let result = deploying.deploy(&ctx).await;
                    (deploying, result)
                });
            }

            let mut first_error = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((chart, Ok(handles))) => {
                        self.config.charts.insert(chart);
                        self.forwarders.extend(handles);
                    }
                    Ok((chart, Err(e))) => {
                        warn!(release = %chart.release_name, error = %e, "Chart deploy failed");
                        self.config.charts.insert(chart);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        first_error.get_or_insert(Error::StateError(format!(
                            "deploy task panicked: {}",
                            e
                        )));
                    }
                }
            }
            if let Some(e) = first_error {
                self.sync_config()?;
                return Err(e);
            }
        }
        self.sync_config()
    }

    /// Deploy a single registered chart.
    pub async fn deploy(&mut self, release: &str) -> Result<()> {
        validate_chart(self.config.charts.get(release)?)?;
        let ctx = self.deploy_context()?;
        let handles = self.config.charts.get_mut(release)?.deploy(&ctx).await?;
        self.forwarders.extend(handles);
        self.sync_config()
    }

    /// Upgrade an already deployed chart with its current values.
    pub async fn upgrade(&mut self, release: &str) -> Result<()> {
        let ctx = self.deploy_context()?;
        self.config.charts.get_mut(release)?.upgrade(&ctx).await?;
        self.sync_config()
    }

    /// Forward the named ports of one chart's pods. Already connected
    /// pods are skipped.
    pub async fn connect(&mut self, release: &str) -> Result<()> {
        let ctx = self.deploy_context()?;
        let handles = self.config.charts.get_mut(release)?.connect(&ctx).await?;
        self.forwarders.extend(handles);
        self.sync_config()
    }

    /// Forward the named ports of every chart's pods.
    pub async fn connect_all(&mut self) -> Result<()> {
        let ctx = self.deploy_context()?;
        let releases = self.config.charts.release_names();
        for release in releases {
            let handles = self.config.charts.get_mut(&release)?.connect(&ctx).await?;
            self.forwarders.extend(handles);
        }
        self.sync_config()
    }

    /// Tear down every port forward, in-process and detached alike, and
    /// clear the recorded local ports.
    pub fn disconnect(&mut self) -> Result<()> {
        for handle in self.forwarders.drain(..) {
            handle.close();
        }
        for (_, chart) in self.config.charts.iter_mut() {
            for (_, connection) in chart.chart_connections.iter_mut() {
                if connection.forwarder_pid != 0 {
                    kill_forwarder(connection.forwarder_pid);
                }
                connection.forwarder_pid = 0;
                connection.local_ports.clear();
            }
        }
        self.sync_config()
    }

    /// Disconnect, uninstall every release concurrently, then delete the
    /// namespace. An already deleted namespace is not an error.
    pub async fn teardown(&mut self) -> Result<()> {
        self.disconnect()?;
        let namespace = self.namespace()?.to_string();

        let mut tasks = JoinSet::new();
        for release in self.config.charts.release_names() {
            let installer = self.installer.clone();
            let ns = namespace.clone();
            tasks.spawn(async move { installer.uninstall(&release, &ns).await });
        }
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::StateError(format!(
                        "uninstall task panicked: {}",
                        e
                    )));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        match self.cluster.delete_namespace(&namespace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(namespace = %namespace, "Namespace already deleted");
            }
            Err(e) => return Err(e),
        }
        info!(namespace = %namespace, "Environment torn down");

        self.config.namespace = None;
        self.artifacts = None;
        self.chaos = None;
        self.sync_config()
    }

    /// Read one field from a secret in the environment's namespace.
    pub async fn secret_field(&self, secret: &str, field: &str) -> Result<String> {
        self.cluster
            .secret_field(self.namespace()?, secret, field)
            .await
    }

    /// Add a `key=value` label to every pod matching the selector.
    pub async fn add_label(&self, selector: &str, label: &str) -> Result<()> {
        let (key, value) = label.split_once('=').ok_or_else(|| {
            Error::ValidationError(format!("label '{}' must be in key=value form", label))
        })?;
        let namespace = self.namespace()?;
        for pod in self.cluster.list_pods(namespace, selector).await? {
            self.cluster
                .add_pod_label(namespace, &pod.name, key, value)
                .await?;
        }
        Ok(())
    }

    /// Execute a command in the `pod_index`-th pod of a chart whose name
    /// contains `pod_substring`. Returns (stdout, stderr).
    pub async fn exec_in_pod(
        &self,
        release: &str,
        pod_substring: &str,
        pod_index: usize,
        container: &str,
        command: &[String],
    ) -> Result<(String, String)> {
        let chart = self.config.charts.get(release)?;
        let pods = chart.pods_by_name_substring(pod_substring)?;
        let pod = pods.get(pod_index).ok_or_else(|| {
            Error::NotFoundError(format!(
                "no pod at index {} matching '{}' in chart {}",
                pod_index, pod_substring, release
            ))
        })?;
        self.cluster
            .exec_in_pod(self.namespace()?, pod, container, command)
            .await
    }

    /// Copy a local file into a container. The destination must be in
    /// `namespace/pod:path` form.
    pub async fn copy_to_pod(&self, src: &Path, dest: &str, container: &str) -> Result<()> {
        let (namespace, pod, path) = parse_copy_destination(dest)?;
        self.cluster
            .copy_to_pod(namespace, pod, container, src, path)
            .await
    }

    /// Dump every container's logs under `<dir>/<namespace>/`.
    pub async fn dump_artifacts(&self, dir: &Path, test_name: &str) -> Result<PathBuf> {
        let artifacts = self
            .artifacts
            .as_ref()
            .ok_or_else(|| Error::StateError("environment has no namespace, call init first".into()))?;
        artifacts.dump_test_result(dir, test_name).await
    }

    /// Start a typed chaos experiment, tracked in-process. Returns the
    /// generated experiment name.
    pub async fn apply_chaos(&mut self, experiment: &dyn Experiment) -> Result<String> {
        self.controller_mut()?.run(experiment).await
    }

    /// Stop a tracked chaos experiment by name.
    pub async fn stop_chaos(&mut self, name: &str) -> Result<()> {
        self.controller_mut()?.stop(name).await
    }

    /// Stop every tracked chaos experiment.
    pub async fn clear_all_chaos(&mut self) -> Result<()> {
        self.controller_mut()?.stop_all().await
    }

    /// Start a chaos experiment from a YAML template and persist it in
    /// the config so another process can stop it.
    pub async fn apply_chaos_template(&mut self, path: &Path) -> Result<String> {
        let info = self.controller()?.run_template(path).await?;
        let name = info.name.clone();
        self.config.experiments.insert(name.clone(), info);
        self.sync_config()?;
        Ok(name)
    }

    /// Stop a persisted chaos experiment by name and drop it from the
    /// config.
    pub async fn stop_chaos_standalone(&mut self, name: &str) -> Result<()> {
        let info = self
            .config
            .experiments
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(format!("experiment {} not found", name)))?;
        self.controller()?.stop_standalone(&info).await?;
        self.config.experiments.remove(name);
        self.sync_config()
    }

    /// Stop every persisted chaos experiment.
    pub async fn clear_all_chaos_standalone(&mut self) -> Result<()> {
        let names: Vec<String> = self.config.experiments.keys().cloned().collect();
        for name in names {
            self.stop_chaos_standalone(&name).await?;
        }
        Ok(())
    }

    /// Write the config to disk when persistence is on. The file path is
    /// derived from the namespace on first sync.
    pub fn sync_config(&mut self) -> Result<()> {
        if !self.config.persistent {
            return Ok(());
        }
        if self.config.path.is_none() {
            match &self.config.namespace {
                Some(namespace) => {
                    self.config.path = Some(PathBuf::from(format!("{}.yaml", namespace)));
                }
                None => {
                    warn!("Persistent config has neither path nor namespace, skipping sync");
                    return Ok(());
                }
            }
        }
        self.store.save(&self.config)
    }

    /// Drop all runtime state from the config: discovered connections,
    /// experiments and the namespace itself.
    pub fn clear_config(&mut self) -> Result<()> {
        for (_, chart) in self.config.charts.iter_mut() {
            chart.chart_connections.clear();
        }
        self.config.experiments.clear();
        self.config.namespace = None;
        self.sync_config()
    }

    /// Drop only the recorded local ports and forwarder pids, keeping the
    /// rest of the discovery intact.
    pub fn clear_config_local_ports(&mut self) -> Result<()> {
        for (_, chart) in self.config.charts.iter_mut() {
            for (_, connection) in chart.chart_connections.iter_mut() {
                connection.local_ports.clear();
                connection.forwarder_pid = 0;
            }
        }
        self.sync_config()
    }

    fn deploy_context(&self) -> Result<DeployContext> {
        Ok(DeployContext {
            namespace: self.namespace()?.to_string(),
            cluster: self.cluster.clone(),
            installer: self.installer.clone(),
            forwarder: self.forwarder.clone(),
            install_timeout: self.config.install_timeout,
        })
    }

    fn attach_namespace_components(&mut self) {
        if let Some(namespace) = self.config.namespace.clone() {
            self.artifacts = Some(Artifacts::new(self.cluster.clone(), namespace.clone()));
            self.chaos = Some(chaos::Controller::new(
                self.cluster.clone(),
                namespace,
                self.names.clone(),
            ));
        }
    }

    fn controller(&self) -> Result<&chaos::Controller> {
        self.chaos
            .as_ref()
            .ok_or_else(|| Error::StateError("environment has no namespace, call init first".into()))
    }

    fn controller_mut(&mut self) -> Result<&mut chaos::Controller> {
        self.chaos
            .as_mut()
            .ok_or_else(|| Error::StateError("environment has no namespace, call init first".into()))
    }
}

/// Deploy a fresh environment from a config: allocate the namespace and
/// deploy every chart. On failure the namespace is left in place so the
/// synced config can be used to inspect or tear it down.
pub async fn deploy_environment(config: Config) -> Result<Environment> {
    let mut env = Environment::new(config).await?;
    env.init().await?;
    env.deploy_all().await?;
    Ok(env)
}

/// Attach to a running environment described by a config that already
/// carries a namespace.
pub async fn load_environment(config: Config) -> Result<Environment> {
    if config.namespace.is_none() {
        return Err(Error::ValidationError(
            "config has no namespace to attach to".into(),
        ));
    }
    Environment::new(config).await
}

/// Deploy or reattach, whichever the config calls for. When the
/// `CHARTBED_CONFIG_FILE` environment variable is set, the file it points
/// at wins over the passed config and persistence is forced on.
pub async fn deploy_or_load(config: Config) -> Result<Environment> {
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        let mut loaded = Config::load_file(Path::new(&path))?;
        loaded.persistent = true;
        return load_environment(loaded).await;
    }
    if config.namespace.is_some() {
        load_environment(config).await
    } else {
        deploy_environment(config).await
    }
}

fn validate_chart(chart: &HelmChart) -> Result<()> {
    if chart.release_name.is_empty() {
        return Err(Error::ValidationError(
            "chart release name cannot be empty".into(),
        ));
    }
    if chart.index == 0 {
        return Err(Error::ValidationError(format!(
            "chart {}: wave index cannot be zero",
            chart.release_name
        )));
    }
    Ok(())
}

fn parse_copy_destination(dest: &str) -> Result<(&str, &str, &str)> {
    let malformed = || {
        Error::ValidationError(format!(
            "destination '{}' must be in namespace/pod:path form",
            dest
        ))
    };
    let (ns_pod, path) = dest.split_once(':').ok_or_else(malformed)?;
    let (namespace, pod) = ns_pod.split_once('/').ok_or_else(malformed)?;
    if namespace.is_empty() || pod.is_empty() || path.is_empty() {
        return Err(malformed());
    }
    Ok((namespace, pod, path))
}
