/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Soft mutual exclusion over the shared store: claim / heartbeat /
//! release / TTL expiry.
//!
//! The claim is a read-then-write race: two instances can both observe an
//! inactive lease and both write. Every heartbeat tick and consequential
//! action re-checks ownership against a fresh read, so ownership converges
//! within one TTL window. Exactly-once is NOT guaranteed at claim time.
//! Stale leases recover passively via the TTL comparison.

use crate::state::{now_ms, PersistedState, StatePatch};
use crate::store::StateStore;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const OWNER_TTL_MS: i64 = 15_000;
const HEARTBEAT_FLOOR_MS: i64 = 2000;

/// One of the two long-running responsibilities, each with its own lease
/// field pair in the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    Browse,
    Monitor,
}

impl Duty {
    pub fn owner<'a>(&self, state: &'a PersistedState) -> (Option<&'a str>, i64) {
        match self {
            Duty::Browse => (state.owner_id.as_deref(), state.owner_heartbeat_ms),
            Duty::Monitor => (
                state.monitor_owner_id.as_deref(),
                state.monitor_owner_heartbeat_ms,
            ),
        }
    }

    /// Whether the duty is switched on at all (not whether it is mid-run).
    pub fn enabled(&self, state: &PersistedState) -> bool {
        match self {
            Duty::Browse => state.running,
            Duty::Monitor => state.monitor_enabled,
        }
    }

    fn claim_patch(&self, instance_id: &str, now: i64) -> StatePatch {
        match self {
            Duty::Browse => StatePatch {
                owner_id: Some(Some(instance_id.to_string())),
                owner_heartbeat_ms: Some(now),
                ..Default::default()
            },
            Duty::Monitor => StatePatch {
                monitor_owner_id: Some(Some(instance_id.to_string())),
                monitor_owner_heartbeat_ms: Some(now),
                ..Default::default()
            },
        }
    }

    fn clear_lease(&self, patch: &mut StatePatch) {
        match self {
            Duty::Browse => {
                patch.owner_id = Some(None);
                patch.owner_heartbeat_ms = Some(0);
            }
            Duty::Monitor => {
                patch.monitor_owner_id = Some(None);
                patch.monitor_owner_heartbeat_ms = Some(0);
            }
        }
    }

    /// In-progress flags that must never dangle past the duty's lifetime.
    fn clear_flags(&self, patch: &mut StatePatch) {
        match self {
            Duty::Browse => {
                patch.running = Some(false);
                patch.queue_building = Some(false);
                patch.fetching = Some(false);
            }
            Duty::Monitor => {
                patch.monitor_running = Some(false);
            }
        }
    }
}

/// True iff the lease has a holder with a sufficiently fresh heartbeat.
pub fn is_owner_active(owner_id: Option<&str>, heartbeat_ms: i64, now: i64, ttl_ms: i64) -> bool {
    match owner_id {
        Some(id) if !id.is_empty() => now.saturating_sub(heartbeat_ms) <= ttl_ms,
        _ => false,
    }
}

/// Reconcile transient browse flags left behind by a crashed owner: when
/// the browse lease is stale, `fetching`/`queue_building` must drop back to
/// false. Returns an empty patch when the owner is still active.
pub fn stale_flag_patch(state: &PersistedState, now: i64, ttl_ms: i64) -> StatePatch {
    if is_owner_active(state.owner_id.as_deref(), state.owner_heartbeat_ms, now, ttl_ms) {
        return StatePatch::default();
    }
    let mut patch = StatePatch::default();
    if state.fetching {
        patch.fetching = Some(false);
    }
    if state.queue_building {
        patch.queue_building = Some(false);
    }
    patch
}

/// Handle for one duty's lease, bound to one instance.
#[derive(Clone)]
pub struct DutyLease {
    store: StateStore,
    duty: Duty,
    instance_id: String,
    ttl_ms: i64,
}

impl DutyLease {
    pub fn new(store: StateStore, duty: Duty, instance_id: String, ttl_ms: i64) -> Self {
        Self {
            store,
            duty,
            instance_id,
            ttl_ms,
        }
    }

    pub fn duty(&self) -> Duty {
        self.duty
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_self(&self, state: &PersistedState) -> bool {
        self.duty.owner(state).0 == Some(self.instance_id.as_str())
    }

    pub fn is_active(&self, state: &PersistedState, now: i64) -> bool {
        let (owner, hb) = self.duty.owner(state);
        is_owner_active(owner, hb, now, self.ttl_ms)
    }

    /// Attempt to take the lease. Fails without writing when another
    /// instance holds it actively; otherwise writes self as owner. The
    /// caller must still re-check ownership before consequential actions.
    pub async fn claim(&self) -> Result<bool> {
        let state = self.store.load().await?;
        let now = now_ms();
        if self.is_active(&state, now) && !self.is_self(&state) {
            return Ok(false);
        }
        self.store
            .patch(&self.duty.claim_patch(&self.instance_id, now))
            .await?;
        Ok(true)
    }

    /// Release the lease. Never clears another instance's lease, but always
    /// clears the duty's in-progress flags; those must not dangle regardless
    /// of who owns the lease.
    pub async fn release(&self, mut extra: StatePatch) -> Result<()> {
        let state = self.store.load().await?;
        self.duty.clear_flags(&mut extra);
        if self.is_self(&state) {
            self.duty.clear_lease(&mut extra);
        }
        self.store.patch(&extra).await?;
        Ok(())
    }

    /// Manual escape hatch for a stuck lease: unconditionally clears lease
    /// and duty flags, bypassing the ownership check.
    pub async fn force_takeover(&self) -> Result<()> {
        let mut patch = StatePatch::default();
        self.duty.clear_lease(&mut patch);
        self.duty.clear_flags(&mut patch);
        self.store.patch(&patch).await?;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(HEARTBEAT_FLOOR_MS.max(self.ttl_ms / 2) as u64)
    }

    /// Spawn the renewal task. A tick that finds the duty disabled or the
    /// lease held by someone else stops the whole task.
    pub fn spawn_heartbeat(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let lease = self.clone();
        tokio::spawn(async move {
            let mut shutdown = shutdown;
            let mut tick = tokio::time::interval(lease.heartbeat_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let state = match lease.store.load().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("heartbeat state read failed: {e:#}");
                        continue;
                    }
                };
                if !lease.duty.enabled(&state) || !lease.is_self(&state) {
                    debug!(duty = ?lease.duty, "heartbeat stopping: lease lost or duty disabled");
                    break;
                }
                let patch = lease.duty.claim_patch(&lease.instance_id, now_ms());
                if let Err(e) = lease.store.patch(&patch).await {
                    warn!("heartbeat renew failed: {e:#}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn owner_active_boundaries() {
        let now = 100_000;
        assert!(is_owner_active(Some("a"), now - 4999, now, 5000));
        assert!(is_owner_active(Some("a"), now - 5000, now, 5000));
        assert!(!is_owner_active(Some("a"), now - 5001, now, 5000));
        assert!(!is_owner_active(None, now, now, 5000));
        assert!(!is_owner_active(Some(""), now, now, 5000));
    }

    #[test]
    fn stale_flags_reconcile_only_when_owner_stale() {
        let now = 100_000;
        let mut state = PersistedState {
            owner_id: Some("a".into()),
            owner_heartbeat_ms: now - 1000,
            fetching: true,
            queue_building: true,
            ..Default::default()
        };
        assert!(stale_flag_patch(&state, now, 15_000).is_empty());

        state.owner_heartbeat_ms = now - 20_000;
        let patch = stale_flag_patch(&state, now, 15_000);
        assert_eq!(patch.fetching, Some(false));
        assert_eq!(patch.queue_building, Some(false));
    }

    // Two instances race for the browse lease; the loser only wins after
    // the winner's heartbeat goes stale.
    #[tokio::test]
    async fn claim_conflict_and_ttl_recovery() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path().join("state.db")).unwrap();
        let a = DutyLease::new(store.clone(), Duty::Browse, "a".into(), OWNER_TTL_MS);
        let b = DutyLease::new(store.clone(), Duty::Browse, "b".into(), OWNER_TTL_MS);

        assert!(a.claim().await.unwrap());
        assert!(!b.claim().await.unwrap());
        // Re-claiming one's own lease refreshes it.
        assert!(a.claim().await.unwrap());

        // A's tab dies without releasing: simulate by aging the heartbeat
        // past the TTL.
        store
            .patch(&StatePatch {
                owner_heartbeat_ms: Some(now_ms() - OWNER_TTL_MS - 1000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(b.claim().await.unwrap());
        let state = store.load().await.unwrap();
        assert_eq!(state.owner_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn release_never_clears_foreign_lease_but_clears_flags() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path().join("state.db")).unwrap();
        store
            .patch(&StatePatch {
                monitor_owner_id: Some(Some("other".into())),
                monitor_owner_heartbeat_ms: Some(now_ms()),
                monitor_running: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let me = DutyLease::new(store.clone(), Duty::Monitor, "me".into(), OWNER_TTL_MS);
        me.release(StatePatch::default()).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.monitor_owner_id.as_deref(), Some("other"));
        assert!(!state.monitor_running);
    }

    #[tokio::test]
    async fn force_takeover_clears_unconditionally() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path().join("state.db")).unwrap();
        store
            .patch(&StatePatch {
                owner_id: Some(Some("other".into())),
                owner_heartbeat_ms: Some(now_ms()),
                running: Some(true),
                queue_building: Some(true),
                fetching: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let me = DutyLease::new(store.clone(), Duty::Browse, "me".into(), OWNER_TTL_MS);
        me.force_takeover().await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.owner_id, None);
        assert!(!state.running && !state.queue_building && !state.fetching);
    }
}
