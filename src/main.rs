use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use chartbed::{deploy_environment, load_environment, Config, Environment};

#[derive(Parser)]
#[command(name = "chartbed", about = "Deploy and manage ephemeral Helm test environments", version)]
struct Cli {
    /// Environment config file (YAML or JSON)
    #[arg(short, long, global = true, default_value = "chartbed.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a new environment from the config file
    New,
    /// Forward the ports of every deployed chart
    Connect,
    /// Tear down all port forwards
    Disconnect,
    /// Uninstall all charts, delete the namespace and the config file
    Remove,
    /// Dump container logs from every pod in the environment
    Dump {
        /// Directory to write artifacts under
        #[arg(short, long, default_value = "artifacts")]
        dir: PathBuf,
        /// Name prefix for the dumped log files
        #[arg(short, long, default_value = "cli")]
        test_name: String,
    },
    /// Manage chaos-mesh experiments
    Chaos {
        #[command(subcommand)]
        command: ChaosCommand,
    },
}

#[derive(Subcommand)]
enum ChaosCommand {
    /// Apply an experiment from a YAML template
    Apply {
        /// Experiment template file
        template: PathBuf,
    },
    /// Stop one experiment by name
    Stop {
        /// Experiment name as printed by apply
        name: String,
    },
    /// Stop every experiment recorded in the config
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chartbed=info".parse()?)
                .add_directive("kube=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::New => {
            let mut config = Config::load_file(&cli.config)?;
            config.persistent = true;
            let env = deploy_environment(config).await?;
            info!(
                namespace = env.namespace()?,
                config = %cli.config.display(),
                "Environment deployed"
            );
        }
        Command::Connect => {
            let mut env = load(&cli.config).await?;
            env.connect_all().await?;
            info!("Environment connected");
        }
        Command::Disconnect => {
            let mut env = load(&cli.config).await?;
            env.disconnect()?;
            info!("Environment disconnected");
        }
        Command::Remove => {
            let mut env = load(&cli.config).await?;
            env.teardown().await?;
            std::fs::remove_file(&cli.config)?;
            info!(config = %cli.config.display(), "Environment removed");
        }
        Command::Dump { dir, test_name } => {
            let env = load(&cli.config).await?;
            let out = env.dump_artifacts(&dir, &test_name).await?;
            info!(dir = %out.display(), "Artifacts dumped");
        }
        Command::Chaos { command } => {
            let mut env = load(&cli.config).await?;
            match command {
                ChaosCommand::Apply { template } => {
                    let name = env.apply_chaos_template(&template).await?;
                    info!(name = %name, "Chaos experiment started");
                }
                ChaosCommand::Stop { name } => {
                    env.stop_chaos_standalone(&name).await?;
                    info!(name = %name, "Chaos experiment stopped");
                }
                ChaosCommand::Clear => {
                    env.clear_all_chaos_standalone().await?;
                    info!("All chaos experiments stopped");
                }
            }
        }
    }
    Ok(())
}

async fn load(path: &std::path::Path) -> chartbed::Result<Environment> {
    let mut config = Config::load_file(path)?;
    config.persistent = true;
    load_environment(config).await
}
