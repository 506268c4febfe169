//! Chaos-mesh experiment lifecycle management

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::namegen::NameGenerator;

pub mod experiments;

pub use experiments::{
    CpuStress, Experiment, NetworkDelay, NetworkPartition, PodFailure, PodKill,
};

/// API group/version of every chaos-mesh custom resource.
pub const CHAOS_API_VERSION: &str = "chaos-mesh.org/v1alpha1";

/// Identity of a created experiment: the generated object name plus the
/// custom resource plural it lives under. Enough to delete it later from
/// any process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    pub resource: String,
}

/// Creates and deletes chaos-mesh experiments in one namespace.
///
/// Experiments started with [`Controller::run`] are tracked in-process and
/// cleaned up by [`Controller::stop_all`]. Standalone experiments from
/// [`Controller::run_template`] are the caller's to track, typically via
/// the persisted config.
pub struct Controller {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    names: Arc<dyn NameGenerator>,
    requests: BTreeMap<String, ExperimentInfo>,
}

impl Controller {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        names: Arc<dyn NameGenerator>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            names,
            requests: BTreeMap::new(),
        }
    }

    /// Start a typed experiment and track it for later cleanup. Returns
    /// the generated experiment name.
    pub async fn run(&mut self, experiment: &dyn Experiment) -> Result<String> {
        let name = self.names.generate(experiment.resource());
        let manifest = json!({
            "apiVersion": CHAOS_API_VERSION,
            "kind": experiment.kind(),
            "metadata": {
                "name": name,
                "namespace": self.namespace,
            },
            "spec": experiment.spec()?,
        });
        info!(
            kind = experiment.kind(),
            name = %name,
            namespace = %self.namespace,
            "Starting chaos experiment"
        );
        self.cluster
            .create_custom(
                &self.namespace,
                CHAOS_API_VERSION,
                experiment.kind(),
                experiment.resource(),
                &manifest,
            )
            .await?;
        self.requests.insert(
            name.clone(),
            ExperimentInfo {
                name: name.clone(),
                resource: experiment.resource().to_string(),
            },
        );
        Ok(name)
    }

    /// Start an experiment from a YAML template file. The template must
    /// carry a top-level `resource` field naming the custom resource
    /// plural; metadata is replaced with a generated name and the
    /// controller's namespace. The result is not tracked in-process.
    pub async fn run_template(&self, path: &Path) -> Result<ExperimentInfo> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut doc: serde_json::Value = serde_yaml::from_str(&raw)?;

        let resource = doc
            .get("resource")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "chaos template {} must have a 'resource' field",
                    path.display()
                ))
            })?
            .to_string();
        let kind = match doc.get("kind").and_then(|v| v.as_str()) {
            Some(kind) => kind.to_string(),
            None => kind_for_resource(&resource)?.to_string(),
        };

        let name = self.names.generate(&resource);
        let obj = doc.as_object_mut().ok_or_else(|| {
            Error::ValidationError(format!(
                "chaos template {} must be a mapping",
                path.display()
            ))
        })?;
        obj.remove("resource");
        obj.insert("apiVersion".to_string(), json!(CHAOS_API_VERSION));
        obj.insert("kind".to_string(), json!(kind));
        obj.insert(
            "metadata".to_string(),
            json!({ "name": name, "namespace": self.namespace }),
        );

        info!(
            kind = %kind,
            name = %name,
            template = %path.display(),
            "Starting chaos experiment from template"
        );
        self.cluster
            .create_custom(&self.namespace, CHAOS_API_VERSION, &kind, &resource, &doc)
            .await?;
        Ok(ExperimentInfo { name, resource })
    }

    /// Stop a tracked experiment by name.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let experiment = self
            .requests
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFoundError(format!("experiment {} not found", name)))?;
        self.delete(&experiment).await?;
        self.requests.remove(name);
        Ok(())
    }

    /// Stop an experiment the controller does not track, e.g. one loaded
    /// from a persisted config.
    pub async fn stop_standalone(&self, experiment: &ExperimentInfo) -> Result<()> {
        self.delete(experiment).await
    }

    /// Stop every tracked experiment.
    pub async fn stop_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.requests.keys().cloned().collect();
        for name in names {
            self.stop(&name).await?;
        }
        Ok(())
    }

    pub fn tracked(&self) -> impl Iterator<Item = &ExperimentInfo> {
        self.requests.values()
    }

    async fn delete(&self, experiment: &ExperimentInfo) -> Result<()> {
        info!(
            name = %experiment.name,
            resource = %experiment.resource,
            namespace = %self.namespace,
            "Stopping chaos experiment"
        );
        match self
            .cluster
            .delete_custom(
                &self.namespace,
                CHAOS_API_VERSION,
                &experiment.resource,
                &experiment.name,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::warn!(name = %experiment.name, "Experiment already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn kind_for_resource(resource: &str) -> Result<&'static str> {
    match resource {
        "podchaos" => Ok("PodChaos"),
        "networkchaos" => Ok("NetworkChaos"),
        "stresschaos" => Ok("StressChaos"),
        "iochaos" => Ok("IOChaos"),
        "timechaos" => Ok("TimeChaos"),
        "kernelchaos" => Ok("KernelChaos"),
        "httpchaos" => Ok("HTTPChaos"),
        other => Err(Error::ValidationError(format!(
            "unknown chaos resource '{}', set an explicit 'kind'",
            other
        ))),
    }
}
