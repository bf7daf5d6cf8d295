use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use permify_server::config::{Config, LogFormat};
use permify_server::{profiler, Container, MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Permission service: gRPC, invoker, HTTP gateway and profiler", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "PERMIFY_CONFIG_PATH")]
    config: Option<String>,

    /// Override the primary gRPC port
    #[arg(long)]
    grpc_port: Option<u16>,

    /// Override the HTTP gateway port
    #[arg(long)]
    http_port: Option<u16>,

    /// Override the invoker port
    #[arg(long)]
    invoker_port: Option<u16>,

    /// Override the log filter, e.g. `debug` or `permify_server=trace`
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = terminate => info!("received SIGTERM"),
        }
        trigger.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => {
            let _ = dotenvy::dotenv();
            Config::load(path)
        }
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = args.grpc_port {
        config.server.grpc.port = port;
    }
    if let Some(port) = args.http_port {
        config.server.http.port = port;
    }
    if let Some(port) = args.invoker_port {
        config.distributed.port = port;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    init_tracing(&config);
    if config.profiler.enabled {
        profiler::prometheus_handle();
    }

    let container = Container::in_memory(Arc::new(MemoryStore::new()));
    let local_invoker = Arc::clone(&container.invoker);

    info!(
        grpc_port = config.server.grpc.port,
        http_port = config.server.http.port,
        invoker_port = config.distributed.port,
        authn = config.authn.enabled,
        "starting permission service"
    );

    match container
        .run(shutdown_signal(), &config, local_invoker)
        .await
    {
        Ok(()) => {
            info!("permission service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "permission service exited with error");
            ExitCode::FAILURE
        }
    }
}
