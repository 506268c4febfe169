//! In-memory fakes for the environment's component seams

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chartbed::{
    ChartConnection, ClusterApi, Config, ConfigStore, ContainerInfo, ContainerPort, Environment,
    Error, ForwardHandle, ForwardStrategy, InstallRequest, Installer, NameGenerator, PodInfo,
    PortRule, Result,
};

/// Build a pod with one container exposing the given named ports.
pub fn pod(
    name: &str,
    ip: &str,
    labels: &[(&str, &str)],
    container: &str,
    ports: &[(&str, u16)],
) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        ip: ip.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        containers: vec![ContainerInfo {
            name: container.to_string(),
            ports: ports
                .iter()
                .map(|(n, p)| ContainerPort {
                    name: n.to_string(),
                    number: *p,
                })
                .collect(),
        }],
    }
}

/// A created custom resource, as recorded by [`FakeCluster`].
#[derive(Debug, Clone)]
pub struct CustomObject {
    pub namespace: String,
    pub plural: String,
    pub name: String,
    pub manifest: serde_json::Value,
}

#[derive(Default)]
pub struct FakeClusterState {
    pub namespaces: Vec<String>,
    pub pods: Vec<PodInfo>,
    /// secret name -> field -> value
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
    /// "pod/container" -> log text
    pub logs: BTreeMap<String, String>,
    pub custom_objects: Vec<CustomObject>,
    /// (pod, key, value) patches, in order
    pub label_patches: Vec<(String, String, String)>,
    /// (pod, container, command) exec calls
    pub exec_calls: Vec<(String, String, Vec<String>)>,
    /// (pod, container, dest) copy calls
    pub copy_calls: Vec<(String, String, String)>,
}

/// In-memory [`ClusterApi`] over a single mutable pod set.
#[derive(Default)]
pub struct FakeCluster {
    counter: AtomicU32,
    pub state: Mutex<FakeClusterState>,
}

impl FakeCluster {
    pub fn with_pods(pods: Vec<PodInfo>) -> Self {
        let cluster = Self::default();
        cluster.state.lock().unwrap().pods = pods;
        cluster
    }

    pub fn add_pods(&self, pods: Vec<PodInfo>) {
        self.state.lock().unwrap().pods.extend(pods);
    }

    fn matches(pod: &PodInfo, selector: &str) -> bool {
        if selector.is_empty() {
            return true;
        }
        match selector.split_once('=') {
            Some((key, value)) => pod.labels.get(key).map(String::as_str) == Some(value),
            None => pod.labels.contains_key(selector),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create_namespace(&self, prefix: &str) -> Result<String> {
        let name = format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst));
        self.state.lock().unwrap().namespaces.push(name.clone());
        Ok(name)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.namespaces.len();
        state.namespaces.retain(|n| n != name);
        if state.namespaces.len() == before {
            return Err(Error::NotFoundError(format!("namespace {} not found", name)));
        }
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|p| Self::matches(p, selector))
            .cloned()
            .collect())
    }

    async fn add_pod_label(
        &self,
        _namespace: &str,
        pod: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .label_patches
            .push((pod.to_string(), key.to_string(), value.to_string()));
        let target = state
            .pods
            .iter_mut()
            .find(|p| p.name == pod)
            .ok_or_else(|| Error::NotFoundError(format!("pod {} not found", pod)))?;
        target.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn secret_field(&self, _namespace: &str, secret: &str, field: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .secrets
            .get(secret)
            .and_then(|fields| fields.get(field))
            .cloned()
            .ok_or_else(|| Error::NotFoundError(format!("secret {}/{} not found", secret, field)))
    }

    async fn container_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .get(&format!("{}/{}", pod, container))
            .cloned()
            .unwrap_or_default())
    }

    async fn exec_in_pod(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(String, String)> {
        let mut state = self.state.lock().unwrap();
        state
            .exec_calls
            .push((pod.to_string(), container.to_string(), command.to_vec()));
        Ok(("ok".to_string(), String::new()))
    }

    async fn copy_to_pod(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        _src: &Path,
        dest: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .copy_calls
            .push((pod.to_string(), container.to_string(), dest.to_string()));
        Ok(())
    }

    async fn create_custom(
        &self,
        namespace: &str,
        _api_version: &str,
        _kind: &str,
        plural: &str,
        manifest: &serde_json::Value,
    ) -> Result<()> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.state.lock().unwrap().custom_objects.push(CustomObject {
            namespace: namespace.to_string(),
            plural: plural.to_string(),
            name,
            manifest: manifest.clone(),
        });
        Ok(())
    }

    async fn delete_custom(
        &self,
        _namespace: &str,
        _api_version: &str,
        plural: &str,
        name: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.custom_objects.len();
        state
            .custom_objects
            .retain(|o| !(o.plural == plural && o.name == name));
        if state.custom_objects.len() == before {
            return Err(Error::NotFoundError(format!(
                "{}/{} not found",
                plural, name
            )));
        }
        Ok(())
    }
}

/// Records install/upgrade/uninstall calls in completion order, optionally
/// failing one release's install.
#[derive(Default)]
pub struct RecordingInstaller {
    pub installs: Mutex<Vec<String>>,
    pub upgrades: Mutex<Vec<String>>,
    pub uninstalls: Mutex<Vec<String>>,
    pub fail_install_of: Mutex<Option<String>>,
}

impl RecordingInstaller {
    pub fn failing(release: &str) -> Self {
        let installer = Self::default();
        *installer.fail_install_of.lock().unwrap() = Some(release.to_string());
        installer
    }
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        if self.fail_install_of.lock().unwrap().as_deref() == Some(request.release.as_str()) {
            return Err(Error::UpstreamError(format!(
                "helm install {} failed",
                request.release
            )));
        }
        self.installs.lock().unwrap().push(request.release.clone());
        Ok(())
    }

    async fn upgrade(&self, request: &InstallRequest) -> Result<()> {
        self.upgrades.lock().unwrap().push(request.release.clone());
        Ok(())
    }

    async fn uninstall(&self, release: &str, _namespace: &str) -> Result<()> {
        self.uninstalls.lock().unwrap().push(release.to_string());
        Ok(())
    }
}

/// Assigns sequential fake local ports and records connected pods.
pub struct FakeForwarder {
    next_port: AtomicU16,
    pub connects: Mutex<Vec<String>>,
}

impl Default for FakeForwarder {
    fn default() -> Self {
        Self {
            next_port: AtomicU16::new(30000),
            connects: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ForwardStrategy for FakeForwarder {
    async fn connect(
        &self,
        _namespace: &str,
        connection: &mut ChartConnection,
        rules: &[PortRule],
    ) -> Result<ForwardHandle> {
        self.connects
            .lock()
            .unwrap()
            .push(connection.pod_name.clone());
        for rule in rules {
            let local = self.next_port.fetch_add(1, Ordering::SeqCst);
            connection.local_ports.insert(rule.name.clone(), local);
        }
        Ok(ForwardHandle::Detached { pid: -1 })
    }
}

/// Keeps every synced config in memory instead of on disk.
#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Vec<Config>>,
}

impl ConfigStore for MemoryStore {
    fn save(&self, config: &Config) -> Result<()> {
        self.saved.lock().unwrap().push(config.clone());
        Ok(())
    }

    fn load(&self, _path: &Path) -> Result<Config> {
        self.saved
            .lock()
            .unwrap()
            .last()
            .cloned()
            .ok_or_else(|| Error::NotFoundError("no config saved".into()))
    }
}

/// Deterministic name generation for assertions.
#[derive(Default)]
pub struct SequentialNames(AtomicU32);

impl NameGenerator for SequentialNames {
    fn generate(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// All the fakes backing one test environment.
pub struct TestHarness {
    pub cluster: Arc<FakeCluster>,
    pub installer: Arc<RecordingInstaller>,
    pub forwarder: Arc<FakeForwarder>,
    pub store: Arc<MemoryStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            cluster: Arc::new(FakeCluster::default()),
            installer: Arc::new(RecordingInstaller::default()),
            forwarder: Arc::new(FakeForwarder::default()),
            store: Arc::new(MemoryStore::default()),
        }
    }

    pub fn environment(&self, config: Config) -> Environment {
        Environment::with_components(
            config,
            self.cluster.clone(),
            self.installer.clone(),
            self.store.clone(),
            Arc::new(SequentialNames::default()),
            self.forwarder.clone(),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
