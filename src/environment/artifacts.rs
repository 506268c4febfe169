//! Dumping container logs after a test run

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::cluster::ClusterApi;
use crate::error::Result;

/// Collects container logs from every pod in the environment's namespace
/// into per-test artifact directories.
pub struct Artifacts {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

impl Artifacts {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Write one `<test>_<pod>_<container>.log` file per container under
    /// `<dir>/<namespace>/`. Returns the directory that was written.
    pub async fn dump_test_result(&self, dir: &Path, test_name: &str) -> Result<PathBuf> {
        let out_dir = dir.join(&self.namespace);
        tokio::fs::create_dir_all(&out_dir).await?;

        let pods = self.cluster.list_pods(&self.namespace, "").await?;
        for pod in pods {
            for container in &pod.containers {
                let logs = self
                    .cluster
                    .container_logs(&self.namespace, &pod.name, &container.name)
                    .await?;
                let file = out_dir.join(format!(
                    "{}_{}_{}.log",
                    sanitize(test_name),
                    pod.name,
                    container.name
                ));
                tokio::fs::write(&file, logs).await?;
            }
        }
        info!(dir = %out_dir.display(), "Test artifacts dumped");
        Ok(out_dir)
    }
}

/// Test names can contain path separators when tests are nested.
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\', ' '], "_")
}
