/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The browse duty: build a queue of unvisited topic URLs, then walk it
//! one topic at a time with randomized pacing. Every step re-reads the
//! store and re-validates `running`, lease ownership and the `run_id`
//! generation before acting, so a stale continuation dies at its next
//! suspension point.

use crate::client::{ForumApi, PageSource};
use crate::history::{self, VISIT_HISTORY};
use crate::lease::DutyLease;
use crate::schedule::{
    compute_batch_plan, compute_fill_plan, compute_next_fetch_at, should_fetch_more, BatchLimits,
};
use crate::state::{
    now_ms, restart_patch, sanitize_target_count, start_patch, PersistedState, StatePatch,
};
use crate::store::StateStore;
use anyhow::Result;
use rand::{thread_rng, Rng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BrowseConfig {
    /// Listing URL the queue build starts from when no cursor is saved.
    pub listing_url: String,
    pub limits: BatchLimits,
    /// Dwell range on each visited topic.
    pub pace_min_ms: u64,
    pub pace_max_ms: u64,
    /// Chance of a scroll gesture during a visit.
    pub scroll_probability: f64,
    pub scroll_settle_ms: u64,
    /// No-growth collection rounds before the page fallback gives up.
    pub stagnation_threshold: u32,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            listing_url: "/latest".to_string(),
            limits: BatchLimits::default(),
            pace_min_ms: 3000,
            pace_max_ms: 8000,
            scroll_probability: 0.7,
            scroll_settle_ms: 1200,
            stagnation_threshold: 6,
        }
    }
}

/// What the runner should do next, decided from fresh state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Navigate(String),
    ProcessStep,
    Stop,
}

pub fn next_action(state: &PersistedState, current_url: &str) -> Action {
    if !state.running {
        return Action::Stop;
    }
    let Some(target) = state.queue.get(state.index) else {
        return Action::Stop;
    };
    if current_url.ends_with(target.as_str()) {
        Action::ProcessStep
    } else {
        Action::Navigate(target.clone())
    }
}

/// Topic id from a queue URL: the last numeric path segment of
/// `/t/<slug>/<id>` or `/t/<id>`.
pub fn parse_topic_id(url: &str) -> Option<i64> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/')
        .find(|seg| !seg.is_empty())
        .and_then(|seg| seg.parse::<i64>().ok())
}

pub struct BrowseRunner {
    store: StateStore,
    api: Arc<dyn ForumApi>,
    page: Arc<dyn PageSource>,
    lease: DutyLease,
    cfg: BrowseConfig,
    stepping: AtomicBool,
}

impl BrowseRunner {
    pub fn new(
        store: StateStore,
        api: Arc<dyn ForumApi>,
        page: Arc<dyn PageSource>,
        lease: DutyLease,
        cfg: BrowseConfig,
    ) -> Self {
        Self {
            store,
            api,
            page,
            lease,
            cfg,
            stepping: AtomicBool::new(false),
        }
    }

    /// Start (or resume) browsing. Keeps an existing queue; builds one when
    /// empty. Returns false when another instance actively owns the duty.
    pub async fn start(&self, target_count: Option<i64>) -> Result<bool> {
        if !self.lease.claim().await? {
            return Ok(false);
        }
        let state = self.store.load().await?;
        let mut patch = start_patch(&state);
        patch.target_count = Some(sanitize_target_count(target_count));
        let state = self.store.patch(&patch).await?;
        info!(run_id = state.run_id, queued = state.remaining(), "browse started");
        if state.remaining() == 0 {
            self.build_queue(state.run_id, true).await?;
        }
        Ok(true)
    }

    /// Discard the queue and rebuild from scratch.
    pub async fn restart(&self, target_count: Option<i64>) -> Result<bool> {
        if !self.lease.claim().await? {
            return Ok(false);
        }
        let state = self.store.load().await?;
        let mut patch = restart_patch(&state);
        patch.target_count = Some(sanitize_target_count(target_count));
        let state = self.store.patch(&patch).await?;
        info!(run_id = state.run_id, "browse restarted");
        self.build_queue(state.run_id, true).await?;
        Ok(true)
    }

    /// Stop browsing and release the lease. The queue and cursor survive so
    /// a later start resumes where this one left off.
    pub async fn stop(&self) -> Result<()> {
        self.lease.release(StatePatch::default()).await?;
        info!("browse stopped");
        Ok(())
    }

    /// Fresh state iff this continuation is still the live generation:
    /// running, same `run_id`, lease still ours.
    async fn run_guard(&self, run_id: u64) -> Result<Option<PersistedState>> {
        let state = self.store.load().await?;
        if !state.running || state.run_id != run_id || !self.lease.is_self(&state) {
            debug!(run_id, "browse continuation superseded");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Build the queue from the listing API, falling back to page scraping
    /// when the API yields nothing. `await_cooldown` makes an exhausted-
    /// queue rebuild wait out the fetch cooldown instead of giving up.
    pub async fn build_queue(&self, run_id: u64, await_cooldown: bool) -> Result<()> {
        let Some(state) = self.run_guard(run_id).await? else {
            return Ok(());
        };
        let wait = state.next_fetch_at_ms.saturating_sub(now_ms());
        if wait > 0 {
            if !await_cooldown {
                return Ok(());
            }
            debug!(wait_ms = wait, "queue build waiting for fetch cooldown");
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }
        let Some(state) = self.run_guard(run_id).await? else {
            return Ok(());
        };

        self.store
            .patch(&StatePatch {
                queue_building: Some(true),
                fetching: Some(true),
                ..Default::default()
            })
            .await?;
        let built = self.fetch_into_queue(run_id, &state, true).await;
        let mut done = StatePatch {
            queue_building: Some(false),
            fetching: Some(false),
            ..Default::default()
        };
        let added = match built {
            Ok(n) => n,
            Err(e) => {
                self.store.patch(&done).await?;
                return Err(e);
            }
        };
        if added == 0 {
            if let Some(state) = self.run_guard(run_id).await? {
                if state.remaining() == 0 {
                    match self.collect_from_page(&state).await {
                        Ok(queue) if !queue.is_empty() => {
                            info!(count = queue.len(), "queue built from page fallback");
                            done.queue = Some(queue);
                            done.index = Some(0);
                        }
                        Ok(_) => warn!("queue build found no new topics"),
                        Err(e) => warn!("page fallback failed: {e:#}"),
                    }
                }
            }
        }
        self.store.patch(&done).await?;
        Ok(())
    }

    /// Paginate the listing into the queue, committing each page's
    /// queue/cursor/schedule patch as it lands. Returns how many URLs were
    /// added.
    async fn fetch_into_queue(
        &self,
        run_id: u64,
        initial: &PersistedState,
        fill_to_target: bool,
    ) -> Result<usize> {
        let limits = self.cfg.limits;
        let mut url = initial
            .next_api_url
            .clone()
            .unwrap_or_else(|| self.cfg.listing_url.clone());
        let mut pages_fetched = 0u32;
        let mut added = 0usize;

        loop {
            let Some(state) = self.run_guard(run_id).await? else {
                return Ok(added);
            };
            let visited = history::id_set(&state.history);
            let mut queued: HashSet<String> = state.queue.iter().cloned().collect();
            let mut queue = state.queue.clone();
            let target = state.target_count as usize;

            let resp = self.api.fetch_latest(&url).await;
            let now = now_ms();
            let sched = compute_next_fetch_at(now, resp.status, state.backoff_count, &limits);
            let mut patch = StatePatch {
                last_fetch_at_ms: Some(now),
                next_fetch_at_ms: Some(sched.next_fetch_at_ms),
                backoff_count: Some(sched.backoff_count),
                ..Default::default()
            };

            let list = resp
                .data
                .as_ref()
                .and_then(|p| p.topic_list.as_ref());
            let mut next_url: Option<String> = None;
            if let Some(list) = list {
                for topic in &list.topics {
                    if queue.len() >= target {
                        break;
                    }
                    if visited.contains(&topic.id) {
                        continue;
                    }
                    let topic_url = topic.url();
                    if queued.insert(topic_url.clone()) {
                        queue.push(topic_url);
                        added += 1;
                    }
                }
                next_url = list
                    .more_topics_url
                    .clone()
                    .filter(|u| !u.trim().is_empty());
                patch.queue = Some(queue.clone());
                patch.next_api_url = Some(next_url.clone());
            }
            self.store.patch(&patch).await?;

            if !resp.ok() {
                debug!(status = resp.status, "listing fetch failed, build stops");
                return Ok(added);
            }
            let plan = compute_batch_plan(limits.batch_size, limits.max_pages, pages_fetched, added);
            pages_fetched = plan.next_pages_fetched;
            let keep_going = if fill_to_target {
                compute_fill_plan(
                    queue.len(),
                    target,
                    pages_fetched,
                    limits.max_pages,
                    next_url.as_deref(),
                    resp.status,
                )
            } else {
                plan.should_continue && next_url.is_some()
            };
            if !keep_going {
                return Ok(added);
            }
            url = next_url.unwrap_or_default();
        }
    }

    /// DOM fallback: harvest links from the rendered listing, scrolling to
    /// load more, until the target is reached or growth stalls.
    async fn collect_from_page(&self, state: &PersistedState) -> Result<Vec<String>> {
        let visited = history::id_set(&state.history);
        let target = state.target_count as usize;
        let mut queue: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stagnant = 0u32;

        while queue.len() < target && stagnant < self.cfg.stagnation_threshold {
            let before = queue.len();
            for link in self.page.collect_topic_links().await? {
                if queue.len() >= target {
                    break;
                }
                let known_visited = parse_topic_id(&link).is_some_and(|id| visited.contains(&id));
                if !known_visited && seen.insert(link.clone()) {
                    queue.push(link);
                }
            }
            if queue.len() == before {
                stagnant += 1;
            } else {
                stagnant = 0;
            }
            self.page.scroll_once().await?;
            tokio::time::sleep(Duration::from_millis(self.cfg.scroll_settle_ms)).await;
        }
        Ok(queue)
    }

    /// One visit step. A step arriving while one is in flight is dropped.
    pub async fn step(&self) -> Result<()> {
        if self.stepping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.step_inner().await;
        self.stepping.store(false, Ordering::Release);
        result
    }

    async fn step_inner(&self) -> Result<()> {
        let state = self.store.load().await?;
        if !state.running || !self.lease.is_self(&state) {
            return Ok(());
        }
        let run_id = state.run_id;

        if state.index >= state.target_count as usize {
            info!(index = state.index, "target count reached, browse stopping");
            self.lease.release(StatePatch::default()).await?;
            return Ok(());
        }
        if state.remaining() == 0 {
            // Exhausted below target: rebuild (waiting out the cooldown),
            // stop for good if still empty.
            self.build_queue(run_id, true).await?;
            if let Some(state) = self.run_guard(run_id).await? {
                if state.remaining() == 0 {
                    info!("queue exhausted, browse stopping");
                    self.lease.release(StatePatch::default()).await?;
                }
            }
            return Ok(());
        }

        let current = self.page.current_url().await?;
        match next_action(&state, &current) {
            Action::Stop => Ok(()),
            Action::Navigate(url) => {
                debug!(%url, "navigating to next topic");
                self.page.navigate(&url).await
            }
            Action::ProcessStep => self.process_visit(run_id).await,
        }
    }

    async fn process_visit(&self, run_id: u64) -> Result<()> {
        self.pace().await;
        if self.run_guard(run_id).await?.is_none() {
            return Ok(());
        }

        if thread_rng().gen_bool(self.cfg.scroll_probability.clamp(0.0, 1.0)) {
            self.page.scroll_once().await?;
            tokio::time::sleep(Duration::from_millis(self.cfg.scroll_settle_ms)).await;
            if self.run_guard(run_id).await?.is_none() {
                return Ok(());
            }
        }

        // Record the visit and advance. State is re-read inside the guard,
        // so the history merge applies to the latest ledger.
        let Some(state) = self.run_guard(run_id).await? else {
            return Ok(());
        };
        let mut patch = StatePatch {
            index: Some(state.index.saturating_add(1)),
            ..Default::default()
        };
        if let Some(id) = state.queue.get(state.index).and_then(|u| parse_topic_id(u)) {
            patch.history = Some(history::add(&state.history, id, None, &VISIT_HISTORY, now_ms()));
        }
        let state = self.store.patch(&patch).await?;
        debug!(index = state.index, remaining = state.remaining(), "visit recorded");

        if should_fetch_more(
            state.remaining(),
            self.cfg.limits.low_water,
            state.fetching,
            now_ms(),
            state.next_fetch_at_ms,
        ) {
            self.top_up(run_id).await?;
        }
        Ok(())
    }

    /// Low-water top-up: append one batch without resetting the cursor.
    async fn top_up(&self, run_id: u64) -> Result<()> {
        let Some(state) = self.run_guard(run_id).await? else {
            return Ok(());
        };
        self.store
            .patch(&StatePatch {
                fetching: Some(true),
                ..Default::default()
            })
            .await?;
        let result = self.fetch_into_queue(run_id, &state, false).await;
        self.store
            .patch(&StatePatch {
                fetching: Some(false),
                ..Default::default()
            })
            .await?;
        let added = result?;
        debug!(added, "queue topped up");
        Ok(())
    }

    async fn pace(&self) {
        let max = self.cfg.pace_max_ms.max(self.cfg.pace_min_ms);
        if max == 0 {
            return;
        }
        let ms = thread_rng().gen_range(self.cfg.pace_min_ms..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Drive loop: step whenever this instance owns an active run. Other
    /// instances sit in this loop too but never act without the lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = changes.recv() => {}
                _ = tokio::time::sleep(Duration::from_millis(1000)) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let state = match self.store.load().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("browse state read failed: {e:#}");
                    continue;
                }
            };
            if !state.running || !self.lease.is_self(&state) {
                continue;
            }
            if let Err(e) = self.step().await {
                warn!("browse step failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiResponse;
    use crate::lease::{Duty, OWNER_TTL_MS};
    use async_trait::async_trait;
    use lurkbot_protocol::{
        CurrentUserEnvelope, LatestPage, TopicDetail, TopicList, TopicStub, UserActionsPage,
    };
    use std::sync::Mutex;
    use tempfile::TempDir;

    pub(crate) struct StubApi {
        pub latest_pages: Mutex<Vec<ApiResponse<LatestPage>>>,
        pub latest_calls: Mutex<Vec<String>>,
    }

    impl StubApi {
        pub fn new(pages: Vec<ApiResponse<LatestPage>>) -> Self {
            Self {
                latest_pages: Mutex::new(pages),
                latest_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ForumApi for StubApi {
        async fn fetch_latest(&self, url: &str) -> ApiResponse<LatestPage> {
            self.latest_calls.lock().unwrap().push(url.to_string());
            let mut pages = self.latest_pages.lock().unwrap();
            if pages.is_empty() {
                ApiResponse {
                    status: 200,
                    data: Some(LatestPage::default()),
                }
            } else {
                pages.remove(0)
            }
        }

        async fn fetch_topic_detail(&self, _topic_id: i64) -> ApiResponse<TopicDetail> {
            ApiResponse::failed()
        }

        async fn fetch_current_user(&self) -> ApiResponse<CurrentUserEnvelope> {
            ApiResponse::failed()
        }

        async fn fetch_user_actions(&self, _u: &str, _o: u32) -> ApiResponse<UserActionsPage> {
            ApiResponse::failed()
        }

        async fn post_reply(
            &self,
            _topic_id: i64,
            _raw: &str,
            _csrf: &str,
        ) -> crate::client::PostOutcome {
            crate::client::PostOutcome {
                ok: false,
                status: 0,
                payload: None,
            }
        }
    }

    pub(crate) struct StubPage {
        pub url: Mutex<String>,
        pub links: Mutex<Vec<Vec<String>>>,
    }

    impl StubPage {
        pub fn at(url: &str) -> Self {
            Self {
                url: Mutex::new(url.to_string()),
                links: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for StubPage {
        async fn collect_topic_links(&self) -> Result<Vec<String>> {
            let mut rounds = self.links.lock().unwrap();
            if rounds.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(rounds.remove(0))
            }
        }

        async fn scroll_once(&self) -> Result<()> {
            Ok(())
        }

        async fn avatar_src(&self) -> Result<Option<String>> {
            Ok(None)
        }

        async fn csrf_token(&self) -> Result<Option<String>> {
            Ok(Some("csrf".to_string()))
        }

        async fn current_url(&self) -> Result<String> {
            Ok(self.url.lock().unwrap().clone())
        }

        async fn navigate(&self, url: &str) -> Result<()> {
            *self.url.lock().unwrap() = url.to_string();
            Ok(())
        }
    }

    fn page_of(ids: std::ops::Range<i64>, more: Option<&str>) -> ApiResponse<LatestPage> {
        ApiResponse {
            status: 200,
            data: Some(LatestPage {
                topic_list: Some(TopicList {
                    topics: ids
                        .map(|id| TopicStub {
                            id,
                            slug: Some(format!("topic-{id}")),
                            ..Default::default()
                        })
                        .collect(),
                    more_topics_url: more.map(str::to_string),
                }),
            }),
        }
    }

    fn quick_cfg() -> BrowseConfig {
        BrowseConfig {
            pace_min_ms: 0,
            pace_max_ms: 0,
            scroll_probability: 0.0,
            scroll_settle_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn next_action_decision_table() {
        let mut state = PersistedState {
            running: true,
            queue: vec!["/t/a/1".into(), "/t/b/2".into()],
            index: 0,
            ..Default::default()
        };
        assert_eq!(
            next_action(&state, "https://forum.example.com/t/other/9"),
            Action::Navigate("/t/a/1".into())
        );
        assert_eq!(
            next_action(&state, "https://forum.example.com/t/a/1"),
            Action::ProcessStep
        );
        state.index = 2;
        assert_eq!(next_action(&state, "anywhere"), Action::Stop);
        state.index = 0;
        state.running = false;
        assert_eq!(next_action(&state, "anywhere"), Action::Stop);
    }

    #[test]
    fn topic_id_parsing() {
        assert_eq!(parse_topic_id("/t/hello-world/123"), Some(123));
        assert_eq!(parse_topic_id("/t/456"), Some(456));
        assert_eq!(parse_topic_id("/t/hello/123?page=2"), Some(123));
        assert_eq!(parse_topic_id("/t/hello-world/"), None);
        assert_eq!(parse_topic_id("/about"), None);
    }

    async fn runner_with(
        tmp: &TempDir,
        api: Arc<StubApi>,
        page: Arc<StubPage>,
    ) -> (StateStore, BrowseRunner) {
        let store = StateStore::open(tmp.path().join("state.db")).unwrap();
        let lease = DutyLease::new(store.clone(), Duty::Browse, "me".into(), OWNER_TTL_MS);
        let runner = BrowseRunner::new(store.clone(), api, page, lease, quick_cfg());
        (store, runner)
    }

    #[tokio::test]
    async fn start_builds_queue_and_dedupes_visited() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(StubApi::new(vec![page_of(1..31, None)]));
        let page = Arc::new(StubPage::at("https://forum.example.com/"));
        let (store, runner) = runner_with(&tmp, api.clone(), page).await;

        // Topic 5 was already visited.
        store
            .patch(&StatePatch {
                history: Some(vec![crate::history::HistoryEntry {
                    id: 5,
                    ts_ms: now_ms(),
                }]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(runner.start(None).await.unwrap());
        let state = store.load().await.unwrap();
        assert!(state.running);
        assert_eq!(state.queue.len(), 29);
        assert!(!state.queue.iter().any(|u| u.ends_with("/5")));
        assert!(!state.queue_building && !state.fetching);
        assert_eq!(state.owner_id.as_deref(), Some("me"));
    }

    // The low-water top-up: visiting near the end of the queue appends a
    // fresh batch without disturbing the cursor.
    #[tokio::test]
    async fn step_advances_and_tops_up_below_watermark() {
        let tmp = TempDir::new().unwrap();
        let queue: Vec<String> = (1..=150).map(|i| format!("/t/topic-{i}/{i}")).collect();
        let api = Arc::new(StubApi::new(vec![page_of(200..260, None)]));
        let page = Arc::new(StubPage::at("https://forum.example.com/t/topic-149/149"));
        let (store, runner) = runner_with(&tmp, api.clone(), page).await;

        store
            .patch(&StatePatch {
                running: Some(true),
                run_id: Some(1),
                owner_id: Some(Some("me".into())),
                owner_heartbeat_ms: Some(now_ms()),
                queue: Some(queue),
                index: Some(148),
                ..Default::default()
            })
            .await
            .unwrap();

        runner.step().await.unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.index, 149);
        assert!(crate::history::id_set(&state.history).contains(&149));
        assert!(state.queue.len() > 150, "top-up should append");
        assert!(!state.fetching);
        assert_eq!(api.latest_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_navigates_when_not_on_target() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(StubApi::new(Vec::new()));
        let page = Arc::new(StubPage::at("https://forum.example.com/"));
        let (store, runner) = runner_with(&tmp, api, page.clone()).await;

        store
            .patch(&StatePatch {
                running: Some(true),
                owner_id: Some(Some("me".into())),
                owner_heartbeat_ms: Some(now_ms()),
                queue: Some(vec!["/t/first/10".into()]),
                // Far-future cooldown so exhaustion handling can't kick in.
                next_fetch_at_ms: Some(now_ms() + 600_000),
                ..Default::default()
            })
            .await
            .unwrap();

        runner.step().await.unwrap();
        assert_eq!(*page.url.lock().unwrap(), "/t/first/10");
        // Nothing advanced; the visit happens once the page is there.
        assert_eq!(store.load().await.unwrap().index, 0);
    }

    #[tokio::test]
    async fn foreign_owner_blocks_start() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(StubApi::new(Vec::new()));
        let page = Arc::new(StubPage::at("x"));
        let (store, runner) = runner_with(&tmp, api, page).await;

        store
            .patch(&StatePatch {
                owner_id: Some(Some("other".into())),
                owner_heartbeat_ms: Some(now_ms()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!runner.start(None).await.unwrap());
    }

    #[tokio::test]
    async fn fallback_collects_until_stagnant() {
        let tmp = TempDir::new().unwrap();
        // API yields nothing; the page yields two rounds of links then
        // stalls.
        let api = Arc::new(StubApi::new(vec![ApiResponse {
            status: 200,
            data: Some(LatestPage::default()),
        }]));
        let page = Arc::new(StubPage::at("https://forum.example.com/"));
        *page.links.lock().unwrap() = vec![
            vec!["/t/a/1".into(), "/t/b/2".into()],
            vec!["/t/b/2".into(), "/t/c/3".into()],
        ];
        let (store, runner) = runner_with(&tmp, api, page).await;

        assert!(runner.start(None).await.unwrap());
        let state = store.load().await.unwrap();
        assert_eq!(state.queue, vec!["/t/a/1", "/t/b/2", "/t/c/3"]);
        assert_eq!(state.index, 0);
    }

    // Reaching the target count ends the run even when the page could
    // still supply fresh links.
    #[tokio::test]
    async fn step_stops_at_target_count_instead_of_rebuilding() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(StubApi::new(vec![page_of(100..110, None)]));
        let page = Arc::new(StubPage::at("https://forum.example.com/t/b/2"));
        *page.links.lock().unwrap() = vec![vec!["/t/c/3".into()]];
        let (store, runner) = runner_with(&tmp, api.clone(), page).await;

        store
            .patch(&StatePatch {
                running: Some(true),
                owner_id: Some(Some("me".into())),
                owner_heartbeat_ms: Some(now_ms()),
                queue: Some(vec!["/t/a/1".into(), "/t/b/2".into()]),
                index: Some(2),
                target_count: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        runner.step().await.unwrap();
        let state = store.load().await.unwrap();
        assert!(!state.running, "run should stop at target_count");
        assert_eq!(state.owner_id, None);
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.index, 2);
        assert!(api.latest_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_resets_cursor_and_queue() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(StubApi::new(vec![page_of(50..60, None)]));
        let page = Arc::new(StubPage::at("x"));
        let (store, runner) = runner_with(&tmp, api, page).await;

        store
            .patch(&StatePatch {
                queue: Some(vec!["/t/old/1".into()]),
                index: Some(1),
                run_id: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(runner.restart(Some(5)).await.unwrap());
        let state = store.load().await.unwrap();
        assert_eq!(state.run_id, 5);
        assert_eq!(state.index, 0);
        assert_eq!(state.target_count, 5);
        assert_eq!(state.queue.len(), 5);
        assert!(!state.queue.contains(&"/t/old/1".to_string()));
    }
}
