/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use lurkbot_core::runtime::{self, BotConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<BotConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LURKBOT_CONFIG").ok());
    let Some(path) = path else {
        return Ok(BotConfig::default());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read config file: {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config file: {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg = load_config()?;
    let handle = runtime::start(cfg).await?;

    let mut notifications = handle.subscribe_notifications();
    tokio::spawn(async move {
        while let Ok(event) = notifications.recv().await {
            info!(
                topic_id = event.topic_id,
                title = %event.title,
                url = %event.url,
                "reply posted"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
