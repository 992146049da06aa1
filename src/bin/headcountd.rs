//! headcountd - people-counting upload service
//!
//! This daemon:
//! 1. Loads configuration (file, environment, flags)
//! 2. Opens the detection database and loads the detection model
//! 3. Serves the HTTP API until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use headcount::api::ApiServer;
use headcount::config::ServerConfig;
use headcount::DetectionService;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "HEADCOUNT_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long)]
    addr: Option<String>,
    /// ONNX model path, overrides the config file.
    #[arg(long)]
    model: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServerConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }
    if let Some(model) = args.model {
        config.detector.model_path = model;
    }
    config.validate()?;

    let service = match DetectionService::from_config(&config) {
        Ok(service) => Arc::new(service),
        Err(err) => {
            log::error!("startup failed: {}", err);
            return Err(anyhow::anyhow!("startup failed: {}", err));
        }
    };

    let api_handle = ApiServer::new(config.api.clone(), service).spawn()?;
    log::info!("headcount api listening on {}", api_handle.addr);
    log::info!(
        "database {}, uploads in {}",
        config.db_path,
        config.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("headcountd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
