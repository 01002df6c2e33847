//! MME daemon
//!
//! Runs the EMM layer against channel-backed collaborators. Outbound
//! requests are logged until a transport picks them up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use mmed::{Inbound, Mme, MmeConfig, Outbound, Peers};

/// MME - EPS mobility management
#[derive(Parser, Debug)]
#[command(name = "mmed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC Mobility Management Entity")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/mme/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,
}

/// MME application state
pub struct MmeApp {
    running: Arc<AtomicBool>,
    mme: Option<Mme>,
    inbound_tx: Option<mpsc::UnboundedSender<Inbound>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl MmeApp {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            mme: None,
            inbound_tx: None,
            inbound_rx: None,
            outbound_rx: None,
        }
    }

    /// Load the configuration and build the EMM layer
    pub fn init(&mut self, config_path: &str) -> Result<()> {
        log::info!("Initializing MME...");

        let config = MmeConfig::load(config_path)
            .with_context(|| format!("Failed to load configuration from {}", config_path))?;
        log::debug!("Configuration loaded: {:?}", config);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (peers, _sessions) = Peers::channel(outbound_tx);

        self.mme = Some(Mme::new(config, peers).context("Failed to build the EMM layer")?);
        self.inbound_tx = Some(inbound_tx);
        self.inbound_rx = Some(inbound_rx);
        self.outbound_rx = Some(outbound_rx);

        log::info!("MME initialized successfully");
        Ok(())
    }

    /// Sender for lower-layer and collaborator events
    pub fn inbound(&self) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.inbound_tx.clone()
    }

    /// Run until stopped
    pub async fn run(&mut self) -> Result<()> {
        let mme = self
            .mme
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("MME not initialized"))?;
        let inbound_rx = self
            .inbound_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("MME already running"))?;

        if let Some(mut outbound_rx) = self.outbound_rx.take() {
            tokio::spawn(async move {
                while let Some(request) = outbound_rx.recv().await {
                    log::debug!("Outbound: {:?}", request);
                }
            });
        }

        log::info!("MME running...");
        mme.run(inbound_rx, Arc::clone(&self.running)).await;
        log::info!("MME main loop exited");
        Ok(())
    }

    pub fn shutdown(&mut self) {
        log::info!("Shutting down MME...");
        if let Some(mme) = self.mme.take() {
            log::debug!("{} EMM contexts dropped", mme.ue_count());
        }
        self.inbound_tx = None;
        log::info!("MME shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Default for MmeApp {
    fn default() -> Self {
        Self::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let write_style = if args.no_color {
        env_logger::WriteStyle::Never
    } else {
        env_logger::WriteStyle::Auto
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .write_style(write_style)
        .format_timestamp_millis()
        .init();

    log::info!("MME v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);

    let mut app = MmeApp::new();

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to install the shutdown handler")?;

    app.init(&args.config).context("MME initialization failed")?;
    app.run().await?;
    app.shutdown();

    log::info!("MME terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mme_app_creation() {
        let app = MmeApp::new();
        assert!(app.running.load(Ordering::SeqCst));
        assert!(app.inbound().is_none());
    }

    #[test]
    fn test_mme_app_stop() {
        let app = MmeApp::new();
        app.stop();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mme_app_running_flag() {
        let app = MmeApp::new();
        let flag = app.running_flag();
        assert!(flag.load(Ordering::SeqCst));
        app.stop();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mme_app_init_with_missing_config() {
        let mut app = MmeApp::new();
        app.init("/nonexistent/mme.yaml").unwrap();
        assert!(app.inbound().is_some());
        app.shutdown();
        assert!(app.inbound().is_none());
    }

    #[test]
    fn test_mme_app_init_reports_config_path() {
        let path = std::env::temp_dir().join(format!("mmed-broken-{}.yaml", std::process::id()));
        std::fs::write(&path, "mme: [unclosed").unwrap();
        let path = path.to_string_lossy().into_owned();

        let mut app = MmeApp::new();
        let err = app.init(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(&path));
        assert!(app.inbound().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_mme_app_run_stops() {
        let mut app = MmeApp::new();
        app.init("/nonexistent/mme.yaml").unwrap();
        app.stop();
        app.run().await.unwrap();
        app.shutdown();
    }
}
