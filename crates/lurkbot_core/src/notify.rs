/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Reply notifications, throttled per process lifetime. The window is NOT
//! persisted: the budget bounds spam per instance, not globally.

use crate::state::now_ms;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info};

const TITLE_MAX_CHARS: usize = 120;
const NOTIFY_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct NotifyLimits {
    pub window_ms: i64,
    pub max_per_window: usize,
}

impl Default for NotifyLimits {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            max_per_window: 3,
        }
    }
}

/// Sliding-window gate: returns whether this notification may go out plus
/// the updated timestamp list to carry forward.
pub fn compute_notify_throttle(
    timestamps: &[i64],
    now_ms: i64,
    limits: &NotifyLimits,
) -> (bool, Vec<i64>) {
    let mut recent: Vec<i64> = timestamps
        .iter()
        .copied()
        .filter(|ts| now_ms.saturating_sub(*ts) <= limits.window_ms)
        .collect();
    if recent.len() >= limits.max_per_window {
        recent.truncate(limits.max_per_window);
        return (false, recent);
    }
    recent.insert(0, now_ms);
    (true, recent)
}

#[derive(Debug, Clone)]
pub struct ReplyNotification {
    pub topic_id: i64,
    pub title: String,
    pub url: String,
    pub time_label: String,
    pub ts_ms: i64,
}

const TIME_LABEL_FORMAT: &[FormatItem<'static>] =
    format_description!("[month]-[day] [hour]:[minute]");

pub fn format_reply_time(ts_ms: i64, offset_minutes: i32) -> String {
    let shifted = ts_ms.saturating_add(offset_minutes as i64 * 60_000);
    OffsetDateTime::from_unix_timestamp(shifted.div_euclid(1000))
        .ok()
        .and_then(|dt| dt.format(TIME_LABEL_FORMAT).ok())
        .unwrap_or_default()
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() <= TITLE_MAX_CHARS {
        return title.to_string();
    }
    title.chars().take(TITLE_MAX_CHARS).collect()
}

/// Fan-out point for successful replies. A full channel drops the oldest
/// event.
pub struct Notifier {
    tx: broadcast::Sender<ReplyNotification>,
    limits: NotifyLimits,
    recent: std::sync::Mutex<Vec<i64>>,
    offset_minutes: i32,
}

impl Notifier {
    pub fn new(limits: NotifyLimits, offset_minutes: i32) -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self {
            tx,
            limits,
            recent: std::sync::Mutex::new(Vec::new()),
            offset_minutes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplyNotification> {
        self.tx.subscribe()
    }

    /// Emit a reply notification unless the window budget is spent.
    /// Returns whether it went out.
    pub fn notify_reply(&self, topic_id: i64, title: &str, url: &str) -> bool {
        let now = now_ms();
        let allowed = {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            let (allowed, updated) = compute_notify_throttle(&recent, now, &self.limits);
            *recent = updated;
            allowed
        };
        if !allowed {
            debug!(topic_id, "reply notification suppressed by throttle");
            return false;
        }
        let event = ReplyNotification {
            topic_id,
            title: truncate_title(title),
            url: url.to_string(),
            time_label: format_reply_time(now, self.offset_minutes),
            ts_ms: now,
        };
        info!(topic_id, title = %event.title, "replied to topic");
        let _ = self.tx.send(event);
        true
    }
}
