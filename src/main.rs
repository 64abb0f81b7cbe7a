use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use opensandbox::agent::{self, AgentConfig, TaskManager, server};
use opensandbox::controller;
use opensandbox::resources::{BatchSandbox, SandboxPool};

#[derive(Parser)]
#[command(name = "opensandbox")]
#[command(about = "Kubernetes-native sandbox pools with an in-pod task executor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sandbox pool controller
    Controller {
        /// Namespace to watch (all namespaces when unset)
        #[arg(short, long, env = "NAMESPACE")]
        namespace: Option<String>,
        #[command(flatten)]
        log: LogArgs,
    },
    /// Run the task executor agent
    Agent {
        /// Directory holding per-task state
        #[arg(long, env = "DATA_DIR", default_value = agent::DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
        /// Address the task API binds to
        #[arg(long, env = "LISTEN_ADDR", default_value = agent::DEFAULT_LISTEN_ADDR)]
        listen_addr: String,
        /// Execute tasks inside the main container's PID namespace
        #[arg(long, env = "ENABLE_SIDECAR_MODE")]
        enable_sidecar_mode: bool,
        /// Name of the container entered in sidecar mode
        #[arg(
            long,
            env = "MAIN_CONTAINER_NAME",
            default_value = agent::DEFAULT_MAIN_CONTAINER_NAME
        )]
        main_container_name: String,
        /// Interval between task reconcile passes (e.g. 500ms)
        #[arg(long, value_parser = parse_interval, default_value = "500ms")]
        reconcile_interval: Duration,
        #[command(flatten)]
        log: LogArgs,
    },
    /// Print the CustomResourceDefinition manifests as YAML
    Crd,
}

#[derive(Args)]
struct LogArgs {
    /// Write logs to rotating files in this directory instead of stderr
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Log file rotation cadence
    #[arg(long, value_enum, default_value = "daily")]
    log_rotation: LogRotation,
    /// Rotated log files kept before the oldest is pruned
    #[arg(long, default_value_t = 7)]
    log_max_files: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogRotation {
    Daily,
    Hourly,
    Never,
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    parse_duration::parse(raw).map_err(|e| e.to_string())
}

fn init_logging(args: &LogArgs) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(dir) = &args.log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let rotation = match args.log_rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix("opensandbox")
        .filename_suffix("log")
        .max_log_files(args.log_max_files)
        .build(dir)
        .context("initializing rolling log files")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller { namespace, log } => {
            let _guard = init_logging(&log)?;
            let client = kube::Client::try_default()
                .await
                .context("connecting to the Kubernetes API")?;
            controller::run(client, namespace.as_deref()).await?;
        }
        Commands::Agent {
            data_dir,
            listen_addr,
            enable_sidecar_mode,
            main_container_name,
            reconcile_interval,
            log,
        } => {
            let _guard = init_logging(&log)?;
            let config = AgentConfig {
                data_dir,
                listen_addr,
                enable_sidecar_mode,
                main_container_name,
                reconcile_interval,
            };
            run_agent(config).await?;
        }
        Commands::Crd => {
            print_crds()?;
        }
    }
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen_addr))?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    info!(
        data_dir = %config.data_dir.display(),
        listen_addr = %config.listen_addr,
        sidecar = config.enable_sidecar_mode,
        "starting task executor agent"
    );

    let manager = Arc::new(TaskManager::new(&config));
    manager.recover().await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received");
        signal_cancel.cancel();
    });

    let reconcile = tokio::spawn(
        manager
            .clone()
            .run(config.reconcile_interval, cancel.clone()),
    );
    server::run_server(addr, manager, cancel).await?;
    reconcile.await.ok();
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;
    let pool = serde_yaml::to_string(&SandboxPool::crd()).context("serializing SandboxPool CRD")?;
    let sandbox =
        serde_yaml::to_string(&BatchSandbox::crd()).context("serializing BatchSandbox CRD")?;
    print!("{pool}---\n{sandbox}");
    Ok(())
}
