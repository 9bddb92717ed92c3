//! Overmesh node daemon.
//!
//! Runs a single overlay participant from a YAML config file. Exit
//! codes: 0 on success (including `--test`), 1 for configuration
//! problems, 2 for runtime failures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use overmesh_core::config::{Config, Settings};
use overmesh_core::control::{load_pki, Control};
use overmesh_net::mock_tun;

/// Overmesh - certificate-based encrypted overlay mesh
#[derive(Parser)]
#[command(name = "overmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit
    #[arg(long)]
    test: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set up logging");
        return ExitCode::from(2);
    }

    let settings = match Settings::load(&cli.config) {
        Ok(s) => s,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.test {
        // validate the PKI material too, then get out of the way
        if let Err(e) = load_pki(&settings) {
            error!("configuration error: {}", e);
            return ExitCode::from(1);
        }
        info!("configuration ok");
        return ExitCode::SUCCESS;
    }

    match run(settings, cli.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("runtime failure: {:#}", e);
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn run(settings: Settings, config_path: PathBuf) -> anyhow::Result<()> {
    if !settings.tun.disabled {
        // Overlay device drivers are supplied by the embedding process;
        // the standalone daemon serves lighthouse and relay roles.
        anyhow::bail!(
            "tun.disabled must be true for the standalone daemon; \
             embed overmesh-core with a platform device to carry traffic"
        );
    }

    // A disabled device still needs a routable overlay network for the
    // host map; take it from our certificate.
    let (cert_state, _) = load_pki(&settings)
        .map_err(|e| anyhow::anyhow!("pki: {}", e))?;
    let cidr = cert_state
        .cert
        .overlay_net()
        .map_err(|e| anyhow::anyhow!("certificate: {}", e))?;
    let (tun, _tun_handle) = mock_tun(cidr);

    let config = Arc::new(Config::new(settings, Some(config_path)));
    let control = Control::boot(config.clone(), tun)
        .map_err(|e| anyhow::anyhow!("startup: {}", e))?;
    control.start();

    #[cfg(unix)]
    {
        let reload_config = config.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(s) => s,
                Err(_) => return,
            };
            while hup.recv().await.is_some() {
                if let Err(e) = reload_config.reload() {
                    error!("reload failed: {}", e);
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    control.stop().await;
    Ok(())
}
