/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Bounded, TTL-pruned ledgers of already-processed topic ids. Dedupe is
//! most-recent-wins: re-adding an id moves it to the front with a fresh
//! timestamp unless the caller supplies an explicit one.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: i64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub ttl_ms: i64,
    pub max_entries: usize,
}

/// Visited-topic ledger bounds.
pub const VISIT_HISTORY: HistoryLimits = HistoryLimits {
    ttl_ms: 30 * 24 * 60 * 60 * 1000,
    max_entries: 3000,
};

/// Replied-topic ledger bounds.
pub const REPLY_HISTORY: HistoryLimits = HistoryLimits {
    ttl_ms: 90 * 24 * 60 * 60 * 1000,
    max_entries: 3000,
};

/// Cap for the display-oriented reply records.
pub const REPLY_ITEMS_MAX: usize = 30;

/// Drop expired entries, sort most-recent-first, truncate to the cap.
pub fn prune(entries: &[HistoryEntry], limits: &HistoryLimits, now_ms: i64) -> Vec<HistoryEntry> {
    let mut kept: Vec<HistoryEntry> = entries
        .iter()
        .copied()
        .filter(|e| now_ms.saturating_sub(e.ts_ms) <= limits.ttl_ms)
        .collect();
    kept.sort_by(|a, b| b.ts_ms.cmp(&a.ts_ms));
    kept.truncate(limits.max_entries);
    kept
}

/// Prepend `{id, ts}`, dropping any previous entry with the same id, then
/// prune. `ts_ms = None` stamps the entry with `now_ms`; an explicit value
/// is used when seeding from an external feed that reports historic times.
pub fn add(
    entries: &[HistoryEntry],
    id: i64,
    ts_ms: Option<i64>,
    limits: &HistoryLimits,
    now_ms: i64,
) -> Vec<HistoryEntry> {
    let ts = ts_ms.unwrap_or(now_ms);
    let mut next = Vec::with_capacity(entries.len() + 1);
    next.push(HistoryEntry { id, ts_ms: ts });
    next.extend(entries.iter().copied().filter(|e| e.id != id));
    prune(&next, limits, now_ms)
}

/// Id set for O(1) membership checks during candidate filtering.
pub fn id_set(entries: &[HistoryEntry]) -> HashSet<i64> {
    entries.iter().map(|e| e.id).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyItem {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub post_number: Option<i64>,
    pub ts_ms: i64,
}

pub fn prune_items(items: &[ReplyItem], ttl_ms: i64, max_items: usize, now_ms: i64) -> Vec<ReplyItem> {
    let mut kept: Vec<ReplyItem> = items
        .iter()
        .filter(|e| now_ms.saturating_sub(e.ts_ms) <= ttl_ms)
        .cloned()
        .collect();
    kept.sort_by(|a, b| b.ts_ms.cmp(&a.ts_ms));
    kept.truncate(max_items);
    kept
}

pub fn add_item(items: &[ReplyItem], item: ReplyItem, ttl_ms: i64, max_items: usize, now_ms: i64) -> Vec<ReplyItem> {
    let id = item.id;
    let mut next = Vec::with_capacity(items.len() + 1);
    next.push(item);
    next.extend(items.iter().filter(|e| e.id != id).cloned());
    prune_items(&next, ttl_ms, max_items, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, ts_ms: i64) -> HistoryEntry {
        HistoryEntry { id, ts_ms }
    }

    #[test]
    fn prune_drops_expired_sorts_and_caps() {
        let now = 20_000;
        let limits = HistoryLimits {
            ttl_ms: 30_000,
            max_entries: 2,
        };
        let entries = vec![entry(2, now - 40_000), entry(1, now - 1000), entry(3, now - 500)];
        let pruned = prune(&entries, &limits, now);
        assert_eq!(pruned.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 1]);
        assert!(pruned.iter().all(|e| now - e.ts_ms <= limits.ttl_ms));
    }

    #[test]
    fn add_prepends_and_dedupes_most_recent_wins() {
        let limits = HistoryLimits {
            ttl_ms: 30_000,
            max_entries: 5,
        };
        let t1 = 1000;
        let t2 = 2000;
        let t3 = 3000;
        let base = vec![entry(1, t1), entry(2, t2)];
        let added = add(&base, 5, None, &limits, t3);
        assert_eq!(added.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 2, 1]);
        assert_eq!(added[0].ts_ms, t3);

        // Re-adding an existing id leaves no duplicate and refreshes ts.
        let readded = add(&added, 1, None, &limits, t3 + 1000);
        assert_eq!(readded.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 5, 2]);
        assert_eq!(readded[0].ts_ms, t3 + 1000);
    }

    #[test]
    fn add_honors_explicit_timestamp() {
        let limits = HistoryLimits {
            ttl_ms: 30_000,
            max_entries: 5,
        };
        let now = 10_000;
        let added = add(&[], 7, Some(now - 2000), &limits, now);
        assert_eq!(added[0].ts_ms, now - 2000);
    }

    #[test]
    fn add_respects_cap() {
        let limits = HistoryLimits {
            ttl_ms: 100_000,
            max_entries: 2,
        };
        let base = vec![entry(1, 1000), entry(2, 2000)];
        let added = add(&base, 3, None, &limits, 3000);
        assert_eq!(added.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn id_set_membership() {
        let set = id_set(&[entry(1, 10), entry(9, 20)]);
        assert!(set.contains(&1));
        assert!(set.contains(&9));
        assert!(!set.contains(&2));
    }

    #[test]
    fn reply_items_dedupe_and_cap() {
        let ttl = REPLY_HISTORY.ttl_ms;
        let now = 50_000;
        let mk = |id: i64, ts_ms: i64| ReplyItem {
            id,
            title: format!("topic {id}"),
            url: format!("/t/{id}"),
            post_number: None,
            ts_ms,
        };
        let mut items = Vec::new();
        for i in 0..40 {
            items = add_item(&items, mk(i, now - i), ttl, REPLY_ITEMS_MAX, now);
        }
        assert_eq!(items.len(), REPLY_ITEMS_MAX);

        let replaced = add_item(&items, mk(0, now + 1), ttl, REPLY_ITEMS_MAX, now + 1);
        assert_eq!(replaced[0].id, 0);
        assert_eq!(replaced.iter().filter(|e| e.id == 0).count(), 1);
    }
}
