/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The shared persisted record and the patches instances apply to it.
//!
//! There is exactly one logical record per installation; every instance
//! holds a local mirror and writes partial patches (merge, not replace).
//! All writes must stay re-derivable from a fresh read: nothing here
//! encodes a delta that could be lost to a concurrent writer.

use crate::history::{HistoryEntry, ReplyItem};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TARGET_COUNT: u32 = 1000;
pub const MIN_TARGET_COUNT: u32 = 1;
pub const MAX_TARGET_COUNT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedState {
    // Browse-duty lease.
    pub owner_id: Option<String>,
    pub owner_heartbeat_ms: i64,

    // Monitor-duty lease (independent, same protocol).
    pub monitor_owner_id: Option<String>,
    pub monitor_owner_heartbeat_ms: i64,

    // Browse duty.
    pub running: bool,
    pub run_id: u64,
    pub queue: Vec<String>,
    pub index: usize,
    pub queue_building: bool,
    pub fetching: bool,
    pub target_count: u32,
    pub history: Vec<HistoryEntry>,

    // Browse fetch scheduler.
    pub next_api_url: Option<String>,
    pub last_fetch_at_ms: i64,
    pub next_fetch_at_ms: i64,
    pub backoff_count: u32,

    // Monitor duty.
    pub monitor_enabled: bool,
    pub monitor_running: bool,
    pub monitor_next_check_at_ms: i64,
    pub monitor_last_check_at_ms: i64,
    pub monitor_backoff_count: u32,
    pub monitor_reply_history: Vec<HistoryEntry>,
    pub monitor_reply_items: Vec<ReplyItem>,
    pub monitor_reply_sync_at_ms: i64,
    pub monitor_user_id: Option<i64>,
    pub monitor_username: Option<String>,

    // UI-only, kept because other instances observe it.
    pub panel_collapsed: bool,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            owner_id: None,
            owner_heartbeat_ms: 0,
            monitor_owner_id: None,
            monitor_owner_heartbeat_ms: 0,
            running: false,
            run_id: 0,
            queue: Vec::new(),
            index: 0,
            queue_building: false,
            fetching: false,
            target_count: DEFAULT_TARGET_COUNT,
            history: Vec::new(),
            next_api_url: None,
            last_fetch_at_ms: 0,
            next_fetch_at_ms: 0,
            backoff_count: 0,
            monitor_enabled: false,
            monitor_running: false,
            monitor_next_check_at_ms: 0,
            monitor_last_check_at_ms: 0,
            monitor_backoff_count: 0,
            monitor_reply_history: Vec::new(),
            monitor_reply_items: Vec::new(),
            monitor_reply_sync_at_ms: 0,
            monitor_user_id: None,
            monitor_username: None,
            panel_collapsed: false,
        }
    }
}

impl PersistedState {
    /// Queue entries not yet visited. `index` may transiently overshoot
    /// the queue length.
    pub fn remaining(&self) -> usize {
        self.queue.len().saturating_sub(self.index)
    }
}

/// A partial update. `None` fields are left untouched by the store;
/// double-`Option` fields distinguish "leave alone" from "clear to null".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_heartbeat_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_owner_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_owner_heartbeat_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_building: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetching: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_api_url: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetch_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fetch_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_next_check_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_last_check_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_backoff_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_reply_history: Option<Vec<HistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_reply_items: Option<Vec<ReplyItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_reply_sync_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_user_id: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_username: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_collapsed: Option<bool>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        matches!(serde_json::to_value(self), Ok(serde_json::Value::Object(m)) if m.is_empty())
    }
}

pub fn next_run_id(current: u64) -> u64 {
    current.saturating_add(1)
}

/// Patch applied when the browse duty is (re)started without resetting the
/// queue. The `run_id` bump invalidates any continuation still in flight
/// from the previous generation.
pub fn start_patch(state: &PersistedState) -> StatePatch {
    StatePatch {
        running: Some(true),
        run_id: Some(next_run_id(state.run_id)),
        ..Default::default()
    }
}

/// Full restart: empty queue, cursor to zero, queue build pending.
pub fn restart_patch(state: &PersistedState) -> StatePatch {
    StatePatch {
        running: Some(true),
        queue: Some(Vec::new()),
        index: Some(0),
        queue_building: Some(true),
        run_id: Some(next_run_id(state.run_id)),
        ..Default::default()
    }
}

/// Clamp a requested target count into the allowed range; non-parseable
/// input falls back to the default.
pub fn sanitize_target_count(raw: Option<i64>) -> u32 {
    match raw {
        None => DEFAULT_TARGET_COUNT,
        Some(v) if v < MIN_TARGET_COUNT as i64 => MIN_TARGET_COUNT,
        Some(v) if v > MAX_TARGET_COUNT as i64 => MAX_TARGET_COUNT,
        Some(v) => v as u32,
    }
}

pub fn sanitize_panel_collapsed(value: Option<bool>, default_collapsed: bool) -> bool {
    value.unwrap_or(default_collapsed)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
