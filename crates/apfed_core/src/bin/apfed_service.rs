/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use apfed_core::config::FederationConfig;
use apfed_core::keys::default_data_dir;
use apfed_core::runtime;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn load_config(text: &str) -> Result<FederationConfig> {
    serde_json::from_str(text).context("decode FederationConfig")
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("APFED_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(default_data_dir()?.join("config.json"))
}

/// Starts the engine and restarts it whenever the config file changes.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .try_init()
        .ok();

    let cfg_path = parse_config_path()?;
    info!("apfed service starting");
    info!("config: {}", cfg_path.display());

    let mut handle: Option<u64> = None;
    let mut last_hash: Option<u64> = None;
    let mut last_failed_hash: Option<u64> = None;
    let mut missing_logged = false;
    let mut first = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if !first {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("shutdown requested");
                    break;
                }
                _ = sleep(Duration::from_secs(2)) => {}
            }
        }
        first = false;

        let text = match std::fs::read_to_string(&cfg_path) {
            Ok(t) => t,
            Err(e) => {
                if !missing_logged {
                    warn!("config missing: {} ({e})", cfg_path.display());
                    missing_logged = true;
                }
                continue;
            }
        };
        missing_logged = false;

        let hash = hash_text(&text);
        if last_hash == Some(hash) || last_failed_hash == Some(hash) {
            continue;
        }

        match load_config(&text) {
            Ok(cfg) => {
                if let Some(h) = handle.take() {
                    if let Err(e) = runtime::stop(h) {
                        warn!("failed to stop previous engine: {e:#}");
                    }
                    // Let the old listener release its port.
                    sleep(Duration::from_millis(500)).await;
                }
                match runtime::start(cfg) {
                    Ok(h) => {
                        handle = Some(h);
                        last_hash = Some(hash);
                        last_failed_hash = None;
                        info!("engine started (handle={h})");
                    }
                    Err(e) => {
                        error!("failed to start engine: {e:#}");
                        last_failed_hash = Some(hash);
                    }
                }
            }
            Err(e) => {
                warn!("invalid config: {e:#}");
                last_failed_hash = Some(hash);
            }
        }
    }

    if let Some(h) = handle.take() {
        if let Err(e) = runtime::stop(h) {
            warn!("failed to stop engine: {e:#}");
        }
    }
    Ok(())
}
