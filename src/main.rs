mod collectors;
mod config;
mod error;
mod http;
mod metrics;
mod report;
mod scheduler;
mod session;
mod snapshot;
mod state;

use axum::serve;
use clap::Parser;
use collectors::inventory::SystemInventory;
use config::Config;
use metrics::Metrics;
use report::{HtmlReportRenderer, ReportStore};
use scheduler::Scheduler;
use session::SessionRecorder;
use snapshot::SnapshotAssembler;
use state::{AppState, LiveHub};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sysreportd")]
#[command(version)]
struct Cli {
    /// YAML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
    /// Overrides `reports.output_dir` from the config file.
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        session_secs = cfg.session.duration_secs,
        reports = %cfg.reports.output_dir.display(),
        "starting sysreportd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let reports = ReportStore::new(cfg.reports.output_dir.clone());
    let renderer = Arc::new(HtmlReportRenderer::new(reports.clone()));
    let recorder = Arc::new(Mutex::new(SessionRecorder::new(
        cfg.session_duration(),
        Box::new(SystemInventory::new()),
        renderer,
    )));
    let hub = Arc::new(LiveHub::new(cfg.live.channel_capacity));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let app_state = AppState {
            hub: hub.clone(),
            recorder: recorder.clone(),
            reports,
            metrics: metrics.clone(),
        };
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, %addr, "failed to bind HTTP listener");
                    return;
                }
            };
            info!(%addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let sampler_task = {
        let top_processes = cfg.sources.top_processes;
        let command_timeout = cfg.command_timeout();
        let period = cfg.tick_interval();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            // Adapter construction warms sysinfo caches and blocks briefly.
            let assembler = match tokio::task::spawn_blocking(move || {
                SnapshotAssembler::new(top_processes, command_timeout)
            })
            .await
            {
                Ok(assembler) => assembler,
                Err(err) => {
                    error!(error = %err, "failed to initialise sources");
                    return;
                }
            };
            Scheduler::new(assembler, period, hub, recorder, metrics)
                .run(shutdown)
                .await;
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = sampler_task.await;
    let _ = http_task.await;
}

fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = &cli.listen {
        cfg.listen = listen.clone();
    }
    if let Some(dir) = &cli.reports_dir {
        cfg.reports.output_dir = dir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_over_defaults() {
        let cli = Cli::parse_from([
            "sysreportd",
            "--listen",
            "127.0.0.1:9100",
            "--reports-dir",
            "/tmp/sysreport-out",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9100");
        assert_eq!(cfg.reports.output_dir, PathBuf::from("/tmp/sysreport-out"));
        assert_eq!(cfg.interval_secs, 1);
    }

    #[test]
    fn cli_listen_repairs_invalid_file_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sysreportd.yaml");
        std::fs::write(&path, "listen: \"bogus\"\ninterval_secs: 2\n").unwrap();
        let cli = Cli::parse_from([
            "sysreportd",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "127.0.0.1:9200",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9200");
        assert_eq!(cfg.interval_secs, 2);
    }

    #[test]
    fn invalid_override_fails_validation() {
        let cli = Cli::parse_from(["sysreportd", "--listen", "not-an-address"]);
        assert!(matches!(
            load_config(&cli),
            Err(config::ConfigError::Validation(_))
        ));
    }
}
