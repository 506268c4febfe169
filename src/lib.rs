pub mod chaos;
pub mod cluster;
pub mod config;
pub mod environment;
pub mod error;
pub mod installer;
pub mod namegen;

pub use chaos::{
    CpuStress, Experiment, ExperimentInfo, NetworkDelay, NetworkPartition, PodFailure, PodKill,
    CHAOS_API_VERSION,
};
pub use cluster::{ClusterApi, ContainerInfo, ContainerPort, KubeApi, PodInfo};
pub use config::{Charts, Config, ConfigStore, FileStore, CONFIG_FILE_ENV};
pub use environment::artifacts::Artifacts;
pub use environment::chart::{
    ChartSource, DeployContext, DeployHook, HelmChart, APP_LABEL_KEY, INSTANCE_LABEL_KEY,
    RELEASE_LABEL_KEY,
};
pub use environment::connections::{
    ChartConnection, ChartConnections, ConnectionKey, Protocol,
};
pub use environment::forward::{
    ForwardHandle, ForwardStrategy, InProcessForwarder, KubectlForwarder, PortRule,
};
pub use environment::{deploy_environment, deploy_or_load, load_environment, Environment};
pub use error::{Error, Result};
pub use installer::{HelmCli, InstallRequest, Installer};
pub use namegen::{NameGenerator, RandomNameGenerator};
