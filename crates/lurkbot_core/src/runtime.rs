/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Service wiring: configuration, task spawning, shutdown.

use crate::browse::{BrowseConfig, BrowseRunner};
use crate::client::{ForumApi, HttpForumClient, PageSource};
use crate::instance::new_instance_id;
use crate::lease::{Duty, DutyLease, OWNER_TTL_MS};
use crate::monitor::{MonitorConfig, MonitorLoop};
use crate::notify::{Notifier, NotifyLimits, ReplyNotification};
use crate::state::StatePatch;
use crate::store::StateStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// User-facing configuration; every field optional, defaults applied at
/// startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub data_dir: Option<PathBuf>,
    pub base_url: Option<String>,
    pub listing_url: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub templates: Option<Vec<String>>,
    pub monitor_enabled: Option<bool>,
    /// Start the browse duty at launch.
    pub browse_enabled: Option<bool>,
    pub owner_ttl_ms: Option<i64>,
    pub target_count: Option<i64>,
    pub day_offset_minutes: Option<i32>,
    pub check_interval_ms: Option<i64>,
    /// Session CSRF token used by the headless page source when posting.
    pub csrf_token: Option<String>,
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LURKBOT_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::ProjectDirs::from("org", "lurkbot", "lurkbot")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".lurkbot"))
}

/// Minimal `PageSource` for running without a browser session: location is
/// tracked in memory, scrolling is a no-op, link harvesting defers to the
/// listing API, and the CSRF token comes from configuration.
pub struct HeadlessPage {
    api: Arc<dyn ForumApi>,
    url: std::sync::Mutex<String>,
    csrf_token: Option<String>,
}

impl HeadlessPage {
    pub fn new(api: Arc<dyn ForumApi>, csrf_token: Option<String>) -> Self {
        Self {
            api,
            url: std::sync::Mutex::new("/".to_string()),
            csrf_token,
        }
    }
}

#[async_trait]
impl PageSource for HeadlessPage {
    async fn collect_topic_links(&self) -> Result<Vec<String>> {
        let resp = self.api.fetch_latest("/latest").await;
        let topics = resp
            .data
            .and_then(|p| p.topic_list)
            .map(|l| l.topics)
            .unwrap_or_default();
        Ok(topics.iter().map(|t| t.url()).collect())
    }

    async fn scroll_once(&self) -> Result<()> {
        Ok(())
    }

    async fn avatar_src(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn csrf_token(&self) -> Result<Option<String>> {
        Ok(self.csrf_token.clone())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        *self.url.lock().unwrap_or_else(|e| e.into_inner()) = url.to_string();
        Ok(())
    }
}

pub struct RuntimeHandle {
    store: StateStore,
    notifier: Arc<Notifier>,
    runner: Arc<BrowseRunner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub instance_id: String,
}

impl RuntimeHandle {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Programmatic control of the browse duty
    /// (`start`/`restart`/`stop`).
    pub fn browse(&self) -> &BrowseRunner {
        &self.runner
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ReplyNotification> {
        self.notifier.subscribe()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Start the full service with the built-in headless page source.
pub async fn start(cfg: BotConfig) -> Result<RuntimeHandle> {
    let base_url = cfg
        .base_url
        .clone()
        .context("base_url is required in configuration")?;
    let api: Arc<dyn ForumApi> = Arc::new(HttpForumClient::new(&base_url)?);
    let page: Arc<dyn PageSource> =
        Arc::new(HeadlessPage::new(api.clone(), cfg.csrf_token.clone()));
    start_with(cfg, api, page).await
}

/// Start with caller-supplied collaborators (a real browser bridge, or
/// stubs in tests).
pub async fn start_with(
    cfg: BotConfig,
    api: Arc<dyn ForumApi>,
    page: Arc<dyn PageSource>,
) -> Result<RuntimeHandle> {
    let data_dir = cfg.data_dir.clone().unwrap_or_else(default_data_dir);
    let store = StateStore::open(data_dir.join("state.db"))?;
    let instance_id = new_instance_id();
    let ttl_ms = cfg.owner_ttl_ms.unwrap_or(OWNER_TTL_MS);
    info!(%instance_id, data_dir = %data_dir.display(), "lurkbot starting");

    let day_offset = cfg
        .day_offset_minutes
        .unwrap_or_else(crate::rules::local_offset_minutes);
    let notifier = Arc::new(Notifier::new(NotifyLimits::default(), day_offset));

    let mut monitor_cfg = MonitorConfig {
        day_offset_minutes: day_offset,
        ..Default::default()
    };
    if let Some(url) = cfg.listing_url.clone() {
        monitor_cfg.listing_url = url;
    }
    if let Some(keywords) = cfg.keywords.clone() {
        monitor_cfg.keywords = keywords;
    }
    if let Some(tags) = cfg.tags.clone() {
        monitor_cfg.tags = tags;
    }
    if let Some(templates) = cfg.templates.clone() {
        monitor_cfg.templates = templates;
    }
    if let Some(interval) = cfg.check_interval_ms {
        monitor_cfg.check_interval_ms = interval.max(1000);
    }
    let mut browse_cfg = BrowseConfig::default();
    if let Some(url) = cfg.listing_url.clone() {
        browse_cfg.listing_url = url;
    }

    if let Some(enabled) = cfg.monitor_enabled {
        store
            .patch(&StatePatch {
                monitor_enabled: Some(enabled),
                ..Default::default()
            })
            .await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let browse_lease = DutyLease::new(
        store.clone(),
        Duty::Browse,
        instance_id.clone(),
        ttl_ms,
    );
    let monitor_lease = DutyLease::new(
        store.clone(),
        Duty::Monitor,
        instance_id.clone(),
        ttl_ms,
    );

    let runner = Arc::new(BrowseRunner::new(
        store.clone(),
        api.clone(),
        page.clone(),
        browse_lease.clone(),
        browse_cfg,
    ));
    tasks.push(tokio::spawn({
        let runner = runner.clone();
        let shutdown = shutdown_rx.clone();
        async move { runner.run(shutdown).await }
    }));
    if cfg.browse_enabled == Some(true) {
        let runner = runner.clone();
        let target_count = cfg.target_count;
        tokio::spawn(async move {
            match runner.start(target_count).await {
                Ok(true) => {}
                Ok(false) => warn!("browse duty already owned by another instance"),
                Err(e) => warn!("browse start failed: {e:#}"),
            }
        });
    }

    let monitor = Arc::new(MonitorLoop::new(
        store.clone(),
        api,
        page,
        monitor_lease.clone(),
        notifier.clone(),
        monitor_cfg,
    ));
    let nudge = monitor.nudge_handle();
    tasks.push(tokio::spawn({
        let monitor = monitor.clone();
        let shutdown = shutdown_rx.clone();
        async move { monitor.run(shutdown).await }
    }));

    // React to monitor_enabled flips written by other instances.
    tasks.push(tokio::spawn({
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut changes = store.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if change.keys.iter().any(|k| k == "monitor_enabled") {
                                nudge.notify_one();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }));

    tasks.push(tokio::spawn(lease_keeper(
        browse_lease,
        store.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(lease_keeper(
        monitor_lease,
        store.clone(),
        shutdown_rx.clone(),
    )));

    Ok(RuntimeHandle {
        store,
        notifier,
        runner,
        shutdown_tx,
        tasks,
        instance_id,
    })
}

/// Keeps a heartbeat task alive whenever this instance holds the duty's
/// lease while the duty is enabled.
async fn lease_keeper(lease: DutyLease, store: StateStore, mut shutdown: watch::Receiver<bool>) {
    let mut changes = store.subscribe();
    let mut heartbeat: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = changes.recv() => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(2000)) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let state = match store.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!("lease keeper state read failed: {e:#}");
                continue;
            }
        };
        let should_run = lease.duty().enabled(&state) && lease.is_self(&state);
        let running = heartbeat.as_ref().is_some_and(|h| !h.is_finished());
        if should_run && !running {
            heartbeat = Some(lease.spawn_heartbeat(shutdown.clone()));
        }
    }
    if let Some(h) = heartbeat {
        h.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_with_all_fields_optional() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.base_url.is_none());

        let cfg: BotConfig = serde_json::from_str(
            r#"{"base_url":"https://forum.example.com","monitor_enabled":true,
                "keywords":["抽奖"],"target_count":200}"#,
        )
        .unwrap();
        assert_eq!(cfg.base_url.as_deref(), Some("https://forum.example.com"));
        assert_eq!(cfg.monitor_enabled, Some(true));
        assert_eq!(cfg.target_count, Some(200));
    }

    #[test]
    fn data_dir_env_override() {
        let dir = default_data_dir();
        assert!(!dir.as_os_str().is_empty());
    }
}
