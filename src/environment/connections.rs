//! Discovered pod connections and URL helpers
//!
//! Every container a chart produces is addressable by a composite
//! `(app, instance, container)` key. Instance ordinals are assigned at
//! deploy time by sorting same-app pods by IP, so the key space is stable
//! across repeated enumerations of an unchanged pod set.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::{Error, Result};

/// URL scheme to use when formatting connection details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ws,
    Wss,
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Composite identity of one discovered container's ports inside one pod.
///
/// Serialized as `app_instance_container` to keep persisted config files
/// readable and stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey {
    pub app: String,
    pub instance: u32,
    pub container: String,
}

impl ConnectionKey {
    pub fn new(app: impl Into<String>, instance: u32, container: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            instance,
            container: container.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.app, self.instance, self.container)
    }
}

impl FromStr for ConnectionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // App labels and container names are DNS-1123 values, so '_' only
        // appears as the separator.
        let mut parts = s.split('_');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(app), Some(instance), Some(container), None) => {
                let instance = instance.parse::<u32>().map_err(|_| {
                    Error::ValidationError(format!(
                        "connection key '{}' has a non-numeric instance ordinal",
                        s
                    ))
                })?;
                Ok(ConnectionKey::new(app, instance, container))
            }
            _ => Err(Error::ValidationError(format!(
                "connection key '{}' is not in 'app_instance_container' form",
                s
            ))),
        }
    }
}

impl Serialize for ConnectionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConnectionKey {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: Error| D::Error::custom(e.to_string()))
    }
}

/// Connection info for one container's exposed ports inside one pod.
///
/// `remote_ports` is fixed at deploy time from the container spec.
/// `local_ports` is populated by connect and cleared by disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartConnection {
    pub pod_name: String,
    pub pod_ip: String,
    /// PID of a detached forwarder process. 0 means none, -1 means the
    /// process was detached from a previous run and must not be killed.
    #[serde(default)]
    pub forwarder_pid: i32,
    #[serde(default)]
    pub remote_ports: BTreeMap<String, u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local_ports: BTreeMap<String, u16>,
}

impl ChartConnection {
    /// Whether forwarding is already established for this pod.
    pub fn is_connected(&self) -> bool {
        self.forwarder_pid != 0 || !self.local_ports.is_empty()
    }
}

/// All connections discovered for one chart, keyed by [`ConnectionKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChartConnections(BTreeMap<ConnectionKey, ChartConnection>);

impl ChartConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionKey, &ChartConnection)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnectionKey, &mut ChartConnection)> {
        self.0.iter_mut()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Insert a connection, failing on duplicate keys.
    ///
    /// Silently overwriting would hide two containers mapping to the same
    /// `(app, instance, container)` identity.
    pub fn store(&mut self, key: ConnectionKey, connection: ChartConnection) -> Result<()> {
        if self.0.contains_key(&key) {
            return Err(Error::ValidationError(format!(
                "chart connection key '{}' is already stored",
                key
            )));
        }
        self.0.insert(key, connection);
        Ok(())
    }

    /// Look up a single connection by its composite key.
    pub fn load(&self, app: &str, instance: u32, container: &str) -> Result<&ChartConnection> {
        let key = ConnectionKey::new(app, instance, container);
        self.0.get(&key).ok_or_else(|| {
            Error::NotFoundError(format!("chart connection '{}' doesn't exist", key))
        })
    }

    /// All connections exposing the given remote port number, ordered by pod IP.
    pub fn load_by_port(&self, port: u16) -> Result<Vec<&ChartConnection>> {
        let mut connections: Vec<&ChartConnection> = self
            .0
            .values()
            .filter(|c| c.remote_ports.values().any(|p| *p == port))
            .collect();
        if connections.is_empty() {
            return Err(Error::NotFoundError(format!(
                "no connections with remote port {} found",
                port
            )));
        }
        connections.sort_by(|a, b| a.pod_ip.cmp(&b.pod_ip));
        Ok(connections)
    }

    /// All connections exposing the given named remote port, ordered by pod IP.
    ///
    /// The ordering is what keeps remote and local URL lists index-aligned
    /// across independent calls.
    pub fn load_by_port_name(&self, port_name: &str) -> Result<Vec<&ChartConnection>> {
        let mut connections: Vec<&ChartConnection> = self
            .0
            .values()
            .filter(|c| c.remote_ports.contains_key(port_name))
            .collect();
        if connections.is_empty() {
            return Err(Error::NotFoundError(format!(
                "no connections with remote port '{}' found",
                port_name
            )));
        }
        connections.sort_by(|a, b| a.pod_ip.cmp(&b.pod_ip));
        Ok(connections)
    }

    /// Cluster-internal URLs for a named port, one per pod, ordered by pod IP.
    pub fn remote_urls_by_port(&self, port_name: &str, protocol: Protocol) -> Result<Vec<Url>> {
        let mut urls = Vec::new();
        for connection in self.load_by_port_name(port_name)? {
            // load_by_port_name guarantees the port name is present
            if let Some(remote_port) = connection.remote_ports.get(port_name) {
                urls.push(Url::parse(&format!(
                    "{}://{}:{}",
                    protocol.scheme(),
                    connection.pod_ip,
                    remote_port
                ))?);
            }
        }
        Ok(urls)
    }

    /// First cluster-internal URL for a named port.
    pub fn remote_url_by_port(&self, port_name: &str, protocol: Protocol) -> Result<Url> {
        let urls = self.remote_urls_by_port(port_name, protocol)?;
        urls.into_iter().next().ok_or_else(|| {
            Error::NotFoundError(format!("no remote URL for port '{}'", port_name))
        })
    }

    /// Forwarded localhost URLs for a named port, in the same pod order as
    /// [`ChartConnections::remote_urls_by_port`].
    pub fn local_urls_by_port(&self, port_name: &str, protocol: Protocol) -> Result<Vec<Url>> {
        let mut urls = Vec::new();
        for connection in self.load_by_port_name(port_name)? {
            let local_port = connection.local_ports.get(port_name).ok_or_else(|| {
                Error::StateError(format!(
                    "no local port for '{}' on pod {}, environment must not be connected",
                    port_name, connection.pod_name
                ))
            })?;
            urls.push(Url::parse(&format!(
                "{}://localhost:{}",
                protocol.scheme(),
                local_port
            ))?);
        }
        Ok(urls)
    }

    /// First forwarded localhost URL for a named port.
    pub fn local_url_by_port(&self, port_name: &str, protocol: Protocol) -> Result<Url> {
        let urls = self.local_urls_by_port(port_name, protocol)?;
        urls.into_iter().next().ok_or_else(|| {
            Error::NotFoundError(format!("no local URL for port '{}'", port_name))
        })
    }
}

impl<'a> IntoIterator for &'a ChartConnections {
    type Item = (&'a ConnectionKey, &'a ChartConnection);
    type IntoIter = std::collections::btree_map::Iter<'a, ConnectionKey, ChartConnection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
