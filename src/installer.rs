//! Chart installation engine port
//!
//! Installing a chart means materializing its objects in the cluster and
//! blocking until they report healthy. That engine is an external
//! collaborator: the production implementation drives the `helm` binary,
//! and tests substitute an in-memory recorder.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// One install or upgrade request against the engine.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub release: String,
    pub chart: PathBuf,
    pub namespace: String,
    /// Override values merged over the chart defaults.
    pub values: serde_json::Value,
    /// How long the engine may wait for the resulting pods to be healthy.
    pub timeout: Duration,
}

/// Installation engine operations.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<()>;
    async fn upgrade(&self, request: &InstallRequest) -> Result<()>;
    /// Uninstall a release. An already-absent release is success.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;
}

/// Installer that shells out to the `helm` binary.
///
/// `HELM_DRIVER` and `KUBECONFIG` are inherited by the child process, so
/// driver and cluster selection work exactly as they do for a user running
/// helm by hand.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("helm"),
        }
    }
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String], context: &str) -> Result<String> {
        tracing::debug!(helm = %self.binary.display(), args = ?args, "Running helm");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::UpstreamError(format!("failed to spawn helm ({}): {}", context, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::UpstreamError(format!(
                "helm {} failed: {}",
                context,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Write override values to a temp file helm can consume.
    fn values_file(values: &serde_json::Value) -> Result<Option<tempfile::NamedTempFile>> {
        if values.is_null() {
            return Ok(None);
        }
        let mut file = tempfile::NamedTempFile::new()?;
        let rendered = serde_yaml::to_string(values)?;
        file.write_all(rendered.as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }

    fn base_args(action: &str, request: &InstallRequest) -> Vec<String> {
        vec![
            action.to_string(),
            request.release.clone(),
            request.chart.display().to_string(),
            "--namespace".to_string(),
            request.namespace.clone(),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", request.timeout.as_secs()),
        ]
    }
}

#[async_trait]
impl Installer for HelmCli {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        let values = Self::values_file(&request.values)?;
        let mut args = Self::base_args("install", request);
        if let Some(ref file) = values {
            args.push("--values".to_string());
            args.push(file.path().display().to_string());
        }
        self.run(&args, &format!("install of release {}", request.release))
            .await?;
        tracing::info!(
            release = %request.release,
            namespace = %request.namespace,
            chart = %request.chart.display(),
            "Installed chart"
        );
        Ok(())
    }

    async fn upgrade(&self, request: &InstallRequest) -> Result<()> {
        let values = Self::values_file(&request.values)?;
        let mut args = Self::base_args("upgrade", request);
        if let Some(ref file) = values {
            args.push("--values".to_string());
            args.push(file.path().display().to_string());
        }
        self.run(&args, &format!("upgrade of release {}", request.release))
            .await?;
        tracing::info!(
            release = %request.release,
            namespace = %request.namespace,
            "Upgraded chart"
        );
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        match self
            .run(&args, &format!("uninstall of release {}", release))
            .await
        {
            Ok(_) => Ok(()),
            // If the release isn't installed, assume it never made it that far
            Err(Error::UpstreamError(msg)) if msg.contains("not found") => {
                tracing::warn!(release = %release, "Release not found during uninstall");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
