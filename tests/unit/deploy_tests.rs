//! Wave-ordered deployment against fake components

use chartbed::{ChartSource, Config, Error, HelmChart};

use crate::common::{pod, RecordingInstaller, TestHarness};
use std::sync::Arc;

fn local_chart(release: &str, index: u32, dir: &std::path::Path) -> HelmChart {
    HelmChart::new(release, index).with_source(ChartSource::Path(dir.to_path_buf()))
}

fn seed_release_pods(harness: &TestHarness, release: &str, app: &str, ips: &[&str]) {
    for (i, ip) in ips.iter().enumerate() {
        harness.cluster.add_pods(vec![pod(
            &format!("{}-{}", app, i),
            ip,
            &[("app", app), ("release", release)],
            app,
            &[("access", 6688)],
        )]);
    }
}

#[tokio::test]
async fn test_deploy_all_runs_waves_in_index_order() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new();
    seed_release_pods(&harness, "geth", "geth", &["10.0.0.1"]);
    seed_release_pods(&harness, "mockserver", "mockserver", &["10.0.0.2"]);
    seed_release_pods(&harness, "chainlink", "chainlink-node", &["10.0.0.3"]);

    let mut env = harness.environment(Config::new("chartbed"));
    env.init().await.unwrap();
    env.add_chart(local_chart("geth", 1, dir.path())).unwrap();
    env.add_chart(local_chart("mockserver", 1, dir.path())).unwrap();
    env.add_chart(local_chart("chainlink", 2, dir.path())).unwrap();
    env.deploy_all().await.unwrap();

    let installs = harness.installer.installs.lock().unwrap().clone();
    assert_eq!(installs.len(), 3);
    // Wave 1 completes in either order, wave 2 strictly after it
    assert!(installs[..2].contains(&"geth".to_string()));
    assert!(installs[..2].contains(&"mockserver".to_string()));
    assert_eq!(installs[2], "chainlink");

    // Discovery keyed by (app, instance, container)
    let conn = env
        .connections("chainlink")
        .unwrap()
        .load("chainlink-node", 0, "chainlink-node")
        .unwrap();
    assert_eq!(conn.remote_ports.get("access"), Some(&6688));
}

#[tokio::test]
async fn test_deploy_failure_lets_siblings_finish_and_skips_later_waves() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = TestHarness::new();
    harness.installer = Arc::new(RecordingInstaller::failing("geth"));
    seed_release_pods(&harness, "mockserver", "mockserver", &["10.0.0.2"]);

    let mut env = harness.environment(Config::new("chartbed"));
    env.init().await.unwrap();
    env.add_chart(local_chart("geth", 1, dir.path())).unwrap();
    env.add_chart(local_chart("mockserver", 1, dir.path())).unwrap();
    env.add_chart(local_chart("chainlink", 2, dir.path())).unwrap();

    let err = env.deploy_all().await.unwrap_err();
    assert!(matches!(err, Error::UpstreamError(_)), "got {:?}", err);

    let installs = harness.installer.installs.lock().unwrap().clone();
    // The failing chart's wave sibling still installed, the next wave never ran
    assert_eq!(installs, vec!["mockserver".to_string()]);
    // All charts are back in the config for retry or teardown
    assert_eq!(env.config.charts.len(), 3);
}

#[tokio::test]
async fn test_instance_ordinals_follow_pod_ip_order() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new();
    // Seeded out of IP order on purpose
    seed_release_pods(&harness, "geth", "geth", &["10.0.0.9", "10.0.0.1"]);

    let mut env = harness.environment(Config::new("chartbed"));
    env.init().await.unwrap();
    env.add_chart(local_chart("geth", 1, dir.path())).unwrap();
    env.deploy_all().await.unwrap();

    let connections = env.connections("geth").unwrap();
    assert_eq!(connections.load("geth", 0, "geth").unwrap().pod_ip, "10.0.0.1");
    assert_eq!(connections.load("geth", 1, "geth").unwrap().pod_ip, "10.0.0.9");
}

#[tokio::test]
async fn test_add_chart_validation() {
    let harness = TestHarness::new();
    let mut env = harness.environment(Config::new("chartbed"));

    let err = env.add_chart(HelmChart::new("geth", 0)).unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)));

    env.add_chart(HelmChart::new("geth", 1)).unwrap();
    let err = env.add_chart(HelmChart::new("geth", 2)).unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)));

    let err = env.add_chart(HelmChart::new("", 1)).unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)));
}

#[tokio::test]
async fn test_upgrade_rediscovers_connections() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new();
    seed_release_pods(&harness, "geth", "geth", &["10.0.0.1"]);

    let mut env = harness.environment(Config::new("chartbed"));
    env.init().await.unwrap();
    env.add_chart(local_chart("geth", 1, dir.path())).unwrap();
    env.deploy_all().await.unwrap();

    // Pod replaced between deploy and upgrade
    harness.cluster.state.lock().unwrap().pods.clear();
    seed_release_pods(&harness, "geth", "geth", &["10.0.0.5"]);

    env.upgrade("geth").await.unwrap();
    assert_eq!(
        harness.installer.upgrades.lock().unwrap().as_slice(),
        ["geth".to_string()]
    );
    let conn = env.connections("geth").unwrap().load("geth", 0, "geth").unwrap();
    assert_eq!(conn.pod_ip, "10.0.0.5");
}

#[tokio::test]
async fn test_deploy_all_rejects_charts_loaded_with_zero_index() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new();

    // A config built by hand or loaded from disk never went through
    // add_chart, so deploy_all has to apply the same registration rules.
    let mut config = Config::new("chartbed");
    config.charts.insert(local_chart("geth", 0, dir.path()));

    let mut env = harness.environment(config);
    env.init().await.unwrap();

    let err = env.deploy_all().await.unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)), "got {:?}", err);
    assert!(harness.installer.installs.lock().unwrap().is_empty());
}

/// Blocks gated installs on a shared barrier so a test can prove two
/// same-wave charts are in flight at once.
struct BlockingInstaller {
    gated: Vec<String>,
    barrier: tokio::sync::Barrier,
    events: std::sync::Mutex<Vec<String>>,
}

impl BlockingInstaller {
    fn new(gated: &[&str]) -> Self {
        Self {
            gated: gated.iter().map(|r| r.to_string()).collect(),
            barrier: tokio::sync::Barrier::new(gated.len()),
            events: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl chartbed::Installer for BlockingInstaller {
    async fn install(&self, request: &chartbed::InstallRequest) -> chartbed::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} start", request.release));
        if self.gated.contains(&request.release) {
            // Only released once every gated sibling has started
            self.barrier.wait().await;
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("{} done", request.release));
        Ok(())
    }

    async fn upgrade(&self, _request: &chartbed::InstallRequest) -> chartbed::Result<()> {
        Ok(())
    }

    async fn uninstall(&self, _release: &str, _namespace: &str) -> chartbed::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_same_wave_charts_install_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(BlockingInstaller::new(&["geth", "mockserver"]));
    let mut env = chartbed::Environment::with_components(
        Config::new("chartbed"),
        Arc::new(crate::common::FakeCluster::default()),
        installer.clone(),
        Arc::new(crate::common::MemoryStore::default()),
        Arc::new(crate::common::SequentialNames::default()),
        Arc::new(crate::common::FakeForwarder::default()),
    );
    env.init().await.unwrap();
    env.add_chart(local_chart("geth", 1, dir.path())).unwrap();
    env.add_chart(local_chart("mockserver", 1, dir.path())).unwrap();

    // Would deadlock on the barrier if the wave ran one chart at a time
    tokio::time::timeout(std::time::Duration::from_secs(5), env.deploy_all())
        .await
        .unwrap()
        .unwrap();

    let events = installer.events.lock().unwrap().clone();
    assert!(events[0].ends_with("start"), "events: {:?}", events);
    assert!(events[1].ends_with("start"), "events: {:?}", events);
}

#[tokio::test]
async fn test_deploy_missing_chart_source_fails() {
    let harness = TestHarness::new();
    let mut env = harness.environment(Config::new("chartbed"));
    env.init().await.unwrap();
    env.add_chart(
        HelmChart::new("geth", 1)
            .with_source(ChartSource::Path("/nonexistent/chart".into())),
    )
    .unwrap();
    let err = env.deploy_all().await.unwrap_err();
    assert!(matches!(err, Error::NotFoundError(_)), "got {:?}", err);
}
