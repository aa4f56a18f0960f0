/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The monitor duty: periodically scan the latest listing for topics that
//! match the configured keywords or tags, reply once to each, and remember
//! what was replied to. Each tick is lease-guarded and re-reads persisted
//! state around every suspension point.

use crate::client::{ForumApi, PageSource};
use crate::history::{self, ReplyItem, REPLY_HISTORY, REPLY_ITEMS_MAX};
use crate::lease::DutyLease;
use crate::notify::Notifier;
use crate::rules::{
    self, build_reply_text, classify_reply_failure, is_topic_from_today, match_title_keywords,
    match_topic_tags, topic_delay_ms, ReplyFailureKind,
};
use crate::schedule::{compute_next_fetch_at, should_abort_scan, BatchLimits};
use crate::state::{now_ms, PersistedState, StatePatch};
use crate::store::StateStore;
use anyhow::Result;
use lurkbot_protocol::{TopicStub, UserAction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub listing_url: String,
    pub check_interval_ms: i64,
    pub max_pages: u32,
    pub sync_interval_ms: i64,
    pub sync_max_pages: u32,
    pub user_actions_page_size: usize,
    pub topic_delay_min_ms: u64,
    pub topic_delay_max_ms: u64,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub templates: Vec<String>,
    /// UTC offset used for the "posted today" day comparison.
    pub day_offset_minutes: i32,
    pub limits: BatchLimits,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            listing_url: "/latest".to_string(),
            check_interval_ms: 30_000,
            max_pages: 2,
            sync_interval_ms: 10 * 60 * 1000,
            sync_max_pages: 2,
            user_actions_page_size: 30,
            topic_delay_min_ms: 600,
            topic_delay_max_ms: 1200,
            keywords: owned(rules::KEYWORD_DEFAULTS),
            tags: owned(rules::TAG_DEFAULTS),
            templates: owned(rules::REPLY_TEMPLATES),
            day_offset_minutes: rules::local_offset_minutes(),
            limits: BatchLimits::default(),
        }
    }
}

pub struct MonitorLoop {
    store: StateStore,
    api: Arc<dyn ForumApi>,
    page: Arc<dyn PageSource>,
    lease: DutyLease,
    notifier: Arc<Notifier>,
    cfg: MonitorConfig,
    nudge: Arc<Notify>,
}

impl MonitorLoop {
    pub fn new(
        store: StateStore,
        api: Arc<dyn ForumApi>,
        page: Arc<dyn PageSource>,
        lease: DutyLease,
        notifier: Arc<Notifier>,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            store,
            api,
            page,
            lease,
            notifier,
            cfg,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Wake the loop out of its inter-tick sleep (used when another
    /// instance flips `monitor_enabled`).
    pub fn nudge_handle(&self) -> Arc<Notify> {
        self.nudge.clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.seed_reply_items().await {
            warn!("reply item seed failed: {e:#}");
        }
        loop {
            if let Err(e) = self.tick().await {
                warn!("monitor tick failed: {e:#}");
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.nudge.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(
                    self.cfg.check_interval_ms.max(1000) as u64,
                )) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        if let Err(e) = self.lease.release(StatePatch::default()).await {
            warn!("monitor release on shutdown failed: {e:#}");
        }
    }

    /// One scheduling round: claim, check, reschedule.
    pub async fn tick(&self) -> Result<()> {
        let state = self.store.load().await?;
        let now = now_ms();
        if !state.monitor_enabled {
            if self.lease.is_self(&state) {
                self.lease.release(StatePatch::default()).await?;
            }
            return Ok(());
        }
        if self.lease.is_active(&state, now) && !self.lease.is_self(&state) {
            return Ok(());
        }
        if now < state.monitor_next_check_at_ms {
            return Ok(());
        }
        if !self.lease.claim().await? {
            return Ok(());
        }
        self.store
            .patch(&StatePatch {
                monitor_running: Some(true),
                monitor_last_check_at_ms: Some(now),
                ..Default::default()
            })
            .await?;

        let status = self.run_check().await.unwrap_or_else(|e| {
            warn!("monitor check failed: {e:#}");
            0
        });

        let state = self.store.load().await?;
        let now = now_ms();
        let mut patch = StatePatch {
            monitor_running: Some(false),
            ..Default::default()
        };
        if status == 429 {
            let sched =
                compute_next_fetch_at(now, 429, state.monitor_backoff_count, &self.cfg.limits);
            debug!(
                next_check_at = sched.next_fetch_at_ms,
                "monitor backing off after rate limit"
            );
            patch.monitor_next_check_at_ms = Some(sched.next_fetch_at_ms);
            patch.monitor_backoff_count = Some(sched.backoff_count);
        } else if status != 200 {
            // Transient failure: sit out one interval, no escalation.
            patch.monitor_next_check_at_ms = Some(now + self.cfg.check_interval_ms);
            patch.monitor_backoff_count = Some(0);
        } else {
            patch.monitor_next_check_at_ms = Some(0);
            patch.monitor_backoff_count = Some(0);
        }
        self.store.patch(&patch).await?;
        Ok(())
    }

    /// Still enabled, still ours?
    async fn check_guard(&self) -> Result<Option<PersistedState>> {
        let state = self.store.load().await?;
        if !state.monitor_enabled || !self.lease.is_self(&state) {
            debug!("monitor check superseded");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// The actual scan. Returns the scan's overall HTTP status for the
    /// scheduler (200 = clean pass).
    async fn run_check(&self) -> Result<u16> {
        let Some(state) = self.check_guard().await? else {
            return Ok(200);
        };
        let now = now_ms();

        // Ledger upkeep before any decision reads them.
        let pruned = history::prune(&state.monitor_reply_history, &REPLY_HISTORY, now);
        let pruned_items = history::prune_items(
            &state.monitor_reply_items,
            REPLY_HISTORY.ttl_ms,
            REPLY_ITEMS_MAX,
            now,
        );
        if pruned.len() != state.monitor_reply_history.len()
            || pruned_items.len() != state.monitor_reply_items.len()
        {
            self.store
                .patch(&StatePatch {
                    monitor_reply_history: Some(pruned),
                    monitor_reply_items: Some(pruned_items),
                    ..Default::default()
                })
                .await?;
        }

        // No usable identity, no scan.
        let (user_id, username, probe_status) = self.current_user_info(&state).await?;
        let user_status = rules::user_probe_status(user_id, username.as_deref(), probe_status);
        if user_status != 200 {
            debug!(user_status, "identity probe failed, aborting check");
            return Ok(user_status);
        }

        if let Some(name) = username.as_deref() {
            if now.saturating_sub(state.monitor_reply_sync_at_ms) >= self.cfg.sync_interval_ms {
                let status = self.sync_reply_history(name).await?;
                if should_abort_scan(status) {
                    return Ok(status);
                }
            }
        }

        // Listing scan.
        let mut url = self.cfg.listing_url.clone();
        for _page in 0..self.cfg.max_pages {
            let resp = self.api.fetch_latest(&url).await;
            if !resp.ok() {
                return Ok(resp.status);
            }
            let Some(list) = resp.data.and_then(|p| p.topic_list) else {
                return Ok(200);
            };
            for topic in &list.topics {
                let Some(state) = self.check_guard().await? else {
                    return Ok(200);
                };
                if !self.is_candidate(topic, &state) {
                    continue;
                }
                let status = self.handle_topic(topic, user_id).await?;
                if should_abort_scan(status) {
                    return Ok(status);
                }
                tokio::time::sleep(Duration::from_millis(topic_delay_ms(
                    self.cfg.topic_delay_min_ms,
                    self.cfg.topic_delay_max_ms,
                )))
                .await;
            }
            match list.more_topics_url.filter(|u| !u.trim().is_empty()) {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(200)
    }

    fn is_candidate(&self, topic: &TopicStub, state: &PersistedState) -> bool {
        let created = topic.created_at.as_deref().unwrap_or_default();
        if !is_topic_from_today(created, now_ms(), self.cfg.day_offset_minutes) {
            return false;
        }
        let title = topic.title.as_deref().unwrap_or_default();
        if !match_title_keywords(title, &self.cfg.keywords)
            && !match_topic_tags(&topic.tags, &self.cfg.tags)
        {
            return false;
        }
        !history::id_set(&state.monitor_reply_history).contains(&topic.id)
    }

    /// Full per-topic pipeline: detail fetch, already-posted short-circuit,
    /// postability gate, compose, post, classify. Returns the status the
    /// scan loop keys off.
    async fn handle_topic(&self, topic: &TopicStub, user_id: Option<i64>) -> Result<u16> {
        let detail = self.api.fetch_topic_detail(topic.id).await;
        if !detail.ok() {
            return Ok(detail.status);
        }
        let Some(detail) = detail.data else {
            return Ok(0);
        };
        // The listing's created_at can disagree with the thread's; trust
        // the thread.
        if let Some(created) = detail.created_at.as_deref() {
            if !is_topic_from_today(created, now_ms(), self.cfg.day_offset_minutes) {
                return Ok(200);
            }
        }
        if detail.viewer_has_posted(user_id) {
            debug!(topic_id = topic.id, "already posted, recording without reply");
            self.record_reply(topic, None, false).await?;
            return Ok(200);
        }
        if !detail.posting_allowed() {
            debug!(topic_id = topic.id, "posting not allowed, skipping");
            return Ok(200);
        }

        let Some(csrf) = self.page.csrf_token().await?.filter(|t| !t.is_empty()) else {
            warn!(topic_id = topic.id, "no csrf token available, skipping reply");
            return Ok(200);
        };
        let text = build_reply_text(&self.cfg.templates);
        let outcome = self.api.post_reply(topic.id, &text, &csrf).await;
        if outcome.ok {
            self.record_reply(topic, None, true).await?;
            return Ok(200);
        }

        let failure = classify_reply_failure(outcome.status, outcome.payload.as_ref());
        match failure.kind {
            ReplyFailureKind::RateLimited => {
                warn!(topic_id = topic.id, "reply rate limited");
                Ok(429)
            }
            ReplyFailureKind::AlreadyReplied | ReplyFailureKind::Duplicate => {
                debug!(topic_id = topic.id, ?failure.kind, "server says done, recording");
                self.record_reply(topic, None, false).await?;
                Ok(200)
            }
            ReplyFailureKind::Rejected => {
                warn!(
                    topic_id = topic.id,
                    reasons = ?failure.reasons,
                    "reply rejected, skipping topic"
                );
                Ok(200)
            }
            ReplyFailureKind::Failed => Ok(outcome.status),
        }
    }

    /// Record a topic in the reply ledger and display items; `announce`
    /// additionally pushes a throttled notification.
    async fn record_reply(
        &self,
        topic: &TopicStub,
        post_number: Option<i64>,
        announce: bool,
    ) -> Result<()> {
        let state = self.store.load().await?;
        let now = now_ms();
        let title = topic.title.clone().unwrap_or_default();
        let url = topic.url();
        let item = ReplyItem {
            id: topic.id,
            title: title.clone(),
            url: url.clone(),
            post_number,
            ts_ms: now,
        };
        self.store
            .patch(&StatePatch {
                monitor_reply_history: Some(history::add(
                    &state.monitor_reply_history,
                    topic.id,
                    None,
                    &REPLY_HISTORY,
                    now,
                )),
                monitor_reply_items: Some(history::add_item(
                    &state.monitor_reply_items,
                    item,
                    REPLY_HISTORY.ttl_ms,
                    REPLY_ITEMS_MAX,
                    now,
                )),
                ..Default::default()
            })
            .await?;
        if announce {
            self.notifier.notify_reply(topic.id, &title, &url);
        }
        Ok(())
    }

    /// Resolve the viewer's identity: persisted cache first, then the page
    /// avatar, then the session endpoint. Whatever is learned gets cached.
    /// The status is the session fetch's when that was the only source.
    async fn current_user_info(
        &self,
        state: &PersistedState,
    ) -> Result<(Option<i64>, Option<String>, u16)> {
        if state.monitor_user_id.is_some() || state.monitor_username.is_some() {
            return Ok((state.monitor_user_id, state.monitor_username.clone(), 200));
        }
        if let Some(src) = self.page.avatar_src().await? {
            if let Some(name) = rules::parse_username_from_avatar_src(&src) {
                self.store
                    .patch(&StatePatch {
                        monitor_username: Some(Some(name.clone())),
                        ..Default::default()
                    })
                    .await?;
                return Ok((None, Some(name), 200));
            }
        }
        let resp = self.api.fetch_current_user().await;
        let Some(envelope) = resp.data else {
            return Ok((None, None, resp.status));
        };
        let user_id = envelope.user_id();
        let username = envelope.username();
        if user_id.is_some() || username.is_some() {
            self.store
                .patch(&StatePatch {
                    monitor_user_id: Some(user_id),
                    monitor_username: Some(username.clone()),
                    ..Default::default()
                })
                .await?;
        }
        Ok((user_id, username, resp.status))
    }

    /// Pull the viewer's recent reply feed into the ledgers, honoring the
    /// feed's own timestamps. Returns the last page's status.
    async fn sync_reply_history(&self, username: &str) -> Result<u16> {
        let mut offset = 0u32;
        let mut last_status = 200u16;
        for _page in 0..self.cfg.sync_max_pages {
            let resp = self.api.fetch_user_actions(username, offset).await;
            last_status = resp.status;
            if !resp.ok() {
                return Ok(last_status);
            }
            let actions = resp.data.map(|p| p.user_actions).unwrap_or_default();
            if actions.is_empty() {
                break;
            }
            let count = actions.len();
            self.absorb_actions(&actions).await?;
            if count < self.cfg.user_actions_page_size {
                break;
            }
            offset += count as u32;
        }
        self.store
            .patch(&StatePatch {
                monitor_reply_sync_at_ms: Some(now_ms()),
                ..Default::default()
            })
            .await?;
        Ok(last_status)
    }

    async fn absorb_actions(&self, actions: &[UserAction]) -> Result<()> {
        let state = self.store.load().await?;
        let now = now_ms();
        let mut ledger = state.monitor_reply_history.clone();
        let mut items = state.monitor_reply_items.clone();
        for action in actions {
            let Some(topic_id) = action.topic_id else {
                continue;
            };
            let ts = action
                .created_at
                .as_deref()
                .and_then(rules::parse_created_at_ms);
            ledger = history::add(&ledger, topic_id, ts, &REPLY_HISTORY, now);
            let url = match action.slug.as_deref().map(str::trim) {
                Some(slug) if !slug.is_empty() => format!("/t/{slug}/{topic_id}"),
                _ => format!("/t/{topic_id}"),
            };
            let item = ReplyItem {
                id: topic_id,
                title: action.title.clone().unwrap_or_default(),
                url,
                post_number: action.post_number,
                ts_ms: ts.unwrap_or(now),
            };
            items = history::add_item(&items, item, REPLY_HISTORY.ttl_ms, REPLY_ITEMS_MAX, now);
        }
        self.store
            .patch(&StatePatch {
                monitor_reply_history: Some(ledger),
                monitor_reply_items: Some(items),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// One-time seed at startup: an empty display ledger gets one
    /// user-actions sync.
    async fn seed_reply_items(&self) -> Result<()> {
        let state = self.store.load().await?;
        if !state.monitor_reply_items.is_empty() {
            return Ok(());
        }
        let (_, username, _) = self.current_user_info(&state).await?;
        if let Some(name) = username {
            info!("seeding reply items from user activity");
            self.sync_reply_history(&name).await?;
        }
        Ok(())
    }
}
