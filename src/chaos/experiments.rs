//! Typed chaos-mesh experiment definitions

use std::time::Duration;

use serde_json::json;

use crate::error::Result;

/// A chaos-mesh experiment that can be rendered into a custom resource.
pub trait Experiment: Send + Sync {
    /// Custom resource kind, e.g. `PodChaos`.
    fn kind(&self) -> &'static str;
    /// Custom resource plural, e.g. `podchaos`.
    fn resource(&self) -> &'static str;
    /// The `spec` body of the manifest.
    fn spec(&self) -> Result<serde_json::Value>;
}

/// Pods matching the selector are present but unable to serve.
#[derive(Debug, Clone)]
pub struct PodFailure {
    pub label_key: String,
    pub label_value: String,
    pub duration: Duration,
}

impl Experiment for PodFailure {
    fn kind(&self) -> &'static str {
        "PodChaos"
    }

    fn resource(&self) -> &'static str {
        "podchaos"
    }

    fn spec(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "action": "pod-failure",
            "mode": "all",
            "duration": fmt_duration(self.duration),
            "selector": label_selector(&self.label_key, &self.label_value),
        }))
    }
}

/// Pods matching the selector are killed and left to the controller to
/// reschedule.
#[derive(Debug, Clone)]
pub struct PodKill {
    pub label_key: String,
    pub label_value: String,
}

impl Experiment for PodKill {
    fn kind(&self) -> &'static str {
        "PodChaos"
    }

    fn resource(&self) -> &'static str {
        "podchaos"
    }

    fn spec(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "action": "pod-kill",
            "mode": "one",
            "selector": label_selector(&self.label_key, &self.label_value),
        }))
    }
}

/// Injects latency on traffic leaving the selected pods.
#[derive(Debug, Clone)]
pub struct NetworkDelay {
    pub label_key: String,
    pub label_value: String,
    pub duration: Duration,
    pub latency: Duration,
    pub jitter: Duration,
    /// Correlation with the previous delay, in percent.
    pub correlation: u8,
}

impl Experiment for NetworkDelay {
    fn kind(&self) -> &'static str {
        "NetworkChaos"
    }

    fn resource(&self) -> &'static str {
        "networkchaos"
    }

    fn spec(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "action": "delay",
            "mode": "all",
            "duration": fmt_duration(self.duration),
            "selector": label_selector(&self.label_key, &self.label_value),
            "delay": {
                "latency": format!("{}ms", self.latency.as_millis()),
                "jitter": format!("{}ms", self.jitter.as_millis()),
                "correlation": self.correlation.to_string(),
            },
        }))
    }
}

/// Cuts traffic between two groups of pods.
#[derive(Debug, Clone)]
pub struct NetworkPartition {
    pub from_key: String,
    pub from_value: String,
    pub to_key: String,
    pub to_value: String,
    pub duration: Duration,
}

impl Experiment for NetworkPartition {
    fn kind(&self) -> &'static str {
        "NetworkChaos"
    }

    fn resource(&self) -> &'static str {
        "networkchaos"
    }

    fn spec(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "action": "partition",
            "mode": "all",
            "direction": "both",
            "duration": fmt_duration(self.duration),
            "selector": label_selector(&self.from_key, &self.from_value),
            "target": {
                "mode": "all",
                "selector": label_selector(&self.to_key, &self.to_value),
            },
        }))
    }
}

/// Burns CPU inside the selected pods.
#[derive(Debug, Clone)]
pub struct CpuStress {
    pub label_key: String,
    pub label_value: String,
    pub duration: Duration,
    pub workers: u32,
    /// Per-worker CPU load in percent.
    pub load: u32,
}

impl Experiment for CpuStress {
    fn kind(&self) -> &'static str {
        "StressChaos"
    }

    fn resource(&self) -> &'static str {
        "stresschaos"
    }

    fn spec(&self) -> Result<serde_json::Value> {
        Ok(json!({
            "mode": "all",
            "duration": fmt_duration(self.duration),
            "selector": label_selector(&self.label_key, &self.label_value),
            "stressors": {
                "cpu": {
                    "workers": self.workers,
                    "load": self.load,
                },
            },
        }))
    }
}

fn fmt_duration(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

fn label_selector(key: &str, value: &str) -> serde_json::Value {
    let mut labels = serde_json::Map::new();
    labels.insert(key.to_string(), json!(value));
    json!({ "labelSelectors": labels })
}
