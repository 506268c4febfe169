//! Port forwarding strategies
//!
//! Two ways to expose a pod port locally, behind one trait so the
//! connect/disconnect contract stays uniform:
//!
//! - [`InProcessForwarder`] opens forward streams over the kube API
//!   transport inside background tasks. Local ports are OS-assigned, and
//!   the forwarding dies with the process.
//! - [`KubectlForwarder`] forks a detached `kubectl port-forward` process
//!   and records its PID, so forwarding survives the current process (the
//!   CLI "connect and hold" use case).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::environment::connections::ChartConnection;
use crate::error::{Error, Result};

/// Max local port value for detached forwarding
pub const MAX_PORT: u16 = 50000;
/// Min local port value for detached forwarding
pub const MIN_PORT: u16 = 20000;

/// One named remote port to forward. `local` 0 means OS-assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    pub name: String,
    pub remote: u16,
    pub local: u16,
}

/// Build forwarding rules from a connection's remote port map.
///
/// The addressing scheme requires port names, so an unnamed port fails
/// validation instead of being skipped.
pub fn port_rules(connection: &ChartConnection) -> Result<Vec<PortRule>> {
    let mut rules = Vec::with_capacity(connection.remote_ports.len());
    for (name, port) in &connection.remote_ports {
        if name.is_empty() {
            return Err(Error::ValidationError(format!(
                "port {} on pod {} must be named in the chart",
                port, connection.pod_name
            )));
        }
        rules.push(PortRule {
            name: name.clone(),
            remote: *port,
            local: 0,
        });
    }
    Ok(rules)
}

/// A live forwarding resource, closed by [`ForwardHandle::close`].
#[derive(Debug)]
pub enum ForwardHandle {
    /// Detached external process identified by PID.
    Detached { pid: i32 },
    /// In-process forward tasks, one per rule.
    Stream {
        pod_name: String,
        shutdown: Vec<oneshot::Sender<()>>,
        tasks: Vec<JoinHandle<()>>,
    },
}

impl ForwardHandle {
    /// Release whatever the strategy opened. Never fails: dead PIDs and
    /// already-finished tasks are tolerated.
    pub fn close(self) {
        match self {
            ForwardHandle::Detached { pid } => kill_forwarder(pid),
            ForwardHandle::Stream {
                pod_name, shutdown, ..
            } => {
                tracing::debug!(pod = %pod_name, "Stopping in-process forwards");
                for tx in shutdown {
                    let _ = tx.send(());
                }
            }
        }
    }
}

/// Kill a recorded forwarder process.
///
/// 0 means no process was ever started; -1 means the process was detached
/// by a previous run and must be left alone.
pub fn kill_forwarder(pid: i32) {
    if pid == 0 || pid == -1 {
        return;
    }
    tracing::debug!(pid = pid, "Killing forwarder process");
    match std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
    {
        Ok(_) => {}
        Err(e) => tracing::warn!(pid = pid, error = %e, "Failed to kill forwarder"),
    }
}

/// Strategy for establishing local access to one pod's ports.
#[async_trait]
pub trait ForwardStrategy: Send + Sync {
    /// Forward every rule for one pod, recording assigned local ports (and
    /// PID for detached mode) into the connection.
    async fn connect(
        &self,
        namespace: &str,
        connection: &mut ChartConnection,
        rules: &[PortRule],
    ) -> Result<ForwardHandle>;
}

/// In-process forwarding over the kube API transport.
pub struct InProcessForwarder {
    client: Client,
    ready_timeout: Duration,
}

impl InProcessForwarder {
    pub fn new(client: Client, ready_timeout: Duration) -> Self {
        Self {
            client,
            ready_timeout,
        }
    }
}

#[async_trait]
impl ForwardStrategy for InProcessForwarder {
    async fn connect(
        &self,
        namespace: &str,
        connection: &mut ChartConnection,
        rules: &[PortRule],
    ) -> Result<ForwardHandle> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_name = connection.pod_name.clone();

        // Probe the transport once so a broken or slow API server fails
        // here with a timeout instead of hanging the first connection.
        if let Some(rule) = rules.first() {
            let probe = tokio::time::timeout(
                self.ready_timeout,
                pods.portforward(&pod_name, &[rule.remote]),
            )
            .await
            .map_err(|_| {
                Error::TimeoutError(format!(
                    "port forward to pod {} not ready within {:?}",
                    pod_name, self.ready_timeout
                ))
            })?;
            drop(probe?);
        }

        let mut shutdown = Vec::with_capacity(rules.len());
        let mut tasks = Vec::with_capacity(rules.len());
        for rule in rules {
            // Bind port 0 and let the OS assign, avoiding races between
            // concurrent enumerations picking the same ephemeral port.
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let local_port = listener.local_addr()?.port();
            connection.local_ports.insert(rule.name.clone(), local_port);

            tracing::debug!(
                namespace = namespace,
                pod = %pod_name,
                port = %rule.name,
                local_port = local_port,
                remote_port = rule.remote,
                "Forwarding port"
            );

            let (tx, rx) = oneshot::channel();
            let task = tokio::spawn(run_listener(
                pods.clone(),
                pod_name.clone(),
                rule.remote,
                listener,
                rx,
            ));
            shutdown.push(tx);
            tasks.push(task);
        }

        Ok(ForwardHandle::Stream {
            pod_name,
            shutdown,
            tasks,
        })
    }
}

/// Accept loop for one forwarded port.
async fn run_listener(
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!(pod = %pod_name, "Port forward shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::trace!(client_addr = %addr, pod = %pod_name, "New forward connection");
                        let pods = pods.clone();
                        let pod_name = pod_name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = proxy_connection(pods, &pod_name, remote_port, stream).await {
                                tracing::warn!(pod = %pod_name, error = %e, "Forward connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(pod = %pod_name, error = %e, "Forward accept error");
                    }
                }
            }
        }
    }
}

/// Proxy a single local connection to the pod port.
async fn proxy_connection(
    pods: Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut local_stream: TcpStream,
) -> Result<()> {
    let mut forwarder = pods.portforward(pod_name, &[remote_port]).await?;
    let upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
        Error::UpstreamError(format!(
            "no stream for port {} on pod {}",
            remote_port, pod_name
        ))
    })?;

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_pod = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        upstream_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let pod_to_client = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_write.write_all(&buf[..n]).await?;
        }
        local_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let _ = tokio::try_join!(client_to_pod, pod_to_client);

    forwarder
        .join()
        .await
        .map_err(|e| Error::UpstreamError(format!("port forward join failed: {}", e)))?;
    Ok(())
}

/// Detached forwarding through a forked `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct KubectlForwarder {
    kubectl: PathBuf,
}

impl Default for KubectlForwarder {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
        }
    }
}

impl KubectlForwarder {
    pub fn new(kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }
}

#[async_trait]
impl ForwardStrategy for KubectlForwarder {
    async fn connect(
        &self,
        namespace: &str,
        connection: &mut ChartConnection,
        rules: &[PortRule],
    ) -> Result<ForwardHandle> {
        let mut args = vec![
            "-n".to_string(),
            namespace.to_string(),
            "port-forward".to_string(),
            format!("pods/{}", connection.pod_name),
        ];
        {
            let mut rng = rand::thread_rng();
            for rule in rules {
                let local = if rule.local == 0 {
                    rng.gen_range(MIN_PORT..MAX_PORT)
                } else {
                    rule.local
                };
                connection.local_ports.insert(rule.name.clone(), local);
                args.push(format!("{}:{}", local, rule.remote));
            }
        }

        tracing::debug!(
            pod = %connection.pod_name,
            args = ?args,
            "Forking kubectl port-forward"
        );
        let child = std::process::Command::new(&self.kubectl)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::UpstreamError(format!(
                    "failed to fork kubectl port-forward for pod {}: {}",
                    connection.pod_name, e
                ))
            })?;

        let pid = child.id() as i32;
        connection.forwarder_pid = pid;
        tracing::info!(
            pod = %connection.pod_name,
            pid = pid,
            ports = ?connection.local_ports,
            "Detached forwarder started"
        );
        Ok(ForwardHandle::Detached { pid })
    }
}
