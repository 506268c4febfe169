//! Cluster API port
//!
//! Everything the environment needs from Kubernetes goes through
//! [`ClusterApi`], so the orchestrator and chaos controller can be driven
//! by an in-memory fake in tests. [`KubeApi`] is the production
//! implementation over a kube [`Client`].

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client, ResourceExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// One exposed container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    /// Port name from the container spec; empty when the port is unnamed.
    pub name: String,
    pub number: u16,
}

/// One container inside a discovered pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub ports: Vec<ContainerPort>,
}

/// Discovery record for one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub ip: String,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerInfo>,
}

/// Cluster operations consumed by the environment and chaos controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a namespace with generate-name semantics and return the
    /// allocated name.
    async fn create_namespace(&self, prefix: &str) -> Result<String>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// List pods matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>>;

    /// Add or replace a single label on a pod.
    async fn add_pod_label(
        &self,
        namespace: &str,
        pod: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Read one field from a secret.
    async fn secret_field(&self, namespace: &str, secret: &str, field: &str) -> Result<String>;

    /// Fetch the logs of one container.
    async fn container_logs(&self, namespace: &str, pod: &str, container: &str)
        -> Result<String>;

    /// Execute a command in a container, returning (stdout, stderr).
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(String, String)>;

    /// Stream a local file into a container path.
    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        src: &Path,
        dest: &str,
    ) -> Result<()>;

    /// Create a namespaced custom resource from a full manifest.
    async fn create_custom(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        plural: &str,
        manifest: &serde_json::Value,
    ) -> Result<()>;

    /// Delete a namespaced custom resource by name.
    async fn delete_custom(
        &self,
        namespace: &str,
        api_version: &str,
        plural: &str,
        name: &str,
    ) -> Result<()>;
}

/// Production [`ClusterApi`] backed by a kube client.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic_resource(api_version: &str, kind: &str, plural: &str) -> Result<ApiResource> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Ok(ApiResource {
            group,
            version,
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn create_namespace(&self, prefix: &str) -> Result<String> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                generate_name: Some(format!("{}-", prefix)),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = namespaces.create(&PostParams::default(), &ns).await?;
        created
            .metadata
            .name
            .ok_or_else(|| Error::UpstreamError("created namespace has no name".to_string()))
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;

        let mut infos = Vec::with_capacity(pods.items.len());
        for pod in pods.items {
            let name = pod.name_any();
            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default();
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            let containers = pod
                .spec
                .as_ref()
                .map(|spec| {
                    spec.containers
                        .iter()
                        .map(|c| ContainerInfo {
                            name: c.name.clone(),
                            ports: c
                                .ports
                                .as_deref()
                                .unwrap_or_default()
                                .iter()
                                .map(|p| ContainerPort {
                                    name: p.name.clone().unwrap_or_default(),
                                    number: p.container_port as u16,
                                })
                                .collect(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            infos.push(PodInfo {
                name,
                ip,
                labels,
                containers,
            });
        }
        Ok(infos)
    }

    async fn add_pod_label(
        &self,
        namespace: &str,
        pod: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut labels = serde_json::Map::new();
        labels.insert(key.to_string(), serde_json::json!(value));
        let patch = serde_json::json!({
            "metadata": { "labels": labels }
        });
        self.pods(namespace)
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::UpstreamError(format!(
                    "failed to patch label {}={} on pod {}: {}",
                    key, value, pod, e
                ))
            })?;
        Ok(())
    }

    async fn secret_field(&self, namespace: &str, secret: &str, field: &str) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let found = secrets.get(secret).await?;
        let data = found.data.unwrap_or_default();
        let bytes = data.get(field).ok_or_else(|| {
            Error::NotFoundError(format!("field '{}' not found in secret {}", field, secret))
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| {
            Error::ValidationError(format!(
                "field '{}' in secret {} is not valid UTF-8",
                field, secret
            ))
        })
    }

    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(pod, &params).await?)
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<(String, String)> {
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods(namespace).exec(pod, command, &params).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await?;
        }
        if let Some(mut reader) = attached.stderr() {
            reader.read_to_string(&mut stderr).await?;
        }
        attached
            .join()
            .await
            .map_err(|e| Error::UpstreamError(format!("exec in pod {} failed: {}", pod, e)))?;
        Ok((stdout, stderr))
    }

    async fn copy_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        src: &Path,
        dest: &str,
    ) -> Result<()> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", dest),
        ];
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(false)
            .stderr(true);
        let mut attached = self.pods(namespace).exec(pod, &command, &params).await?;

        let mut stdin = attached.stdin().ok_or_else(|| {
            Error::UpstreamError(format!("no stdin stream for exec in pod {}", pod))
        })?;
        let mut file = tokio::fs::File::open(src).await?;
        tokio::io::copy(&mut file, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);

        attached.join().await.map_err(|e| {
            Error::UpstreamError(format!("copy to pod {} at {} failed: {}", pod, dest, e))
        })?;
        Ok(())
    }

    async fn create_custom(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        plural: &str,
        manifest: &serde_json::Value,
    ) -> Result<()> {
        let resource = Self::dynamic_resource(api_version, kind, plural)?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let object: DynamicObject = serde_json::from_value(manifest.clone())?;
        api.create(&PostParams::default(), &object).await?;
        Ok(())
    }

    async fn delete_custom(
        &self,
        namespace: &str,
        api_version: &str,
        plural: &str,
        name: &str,
    ) -> Result<()> {
        // Kind is not part of the request path for deletes
        let resource = Self::dynamic_resource(api_version, plural, plural)?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
