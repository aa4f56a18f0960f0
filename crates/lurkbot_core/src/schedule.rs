/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Rate-adaptive fetch scheduling.
//!
//! Only an explicit rate-limit signal (429) escalates the delay. Every
//! other outcome resets the backoff counter and yields a short randomized
//! retry delay.

use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub batch_size: usize,
    pub low_water: usize,
    pub max_pages: u32,
    pub jitter_min_ms: i64,
    pub jitter_max_ms: i64,
    pub backoff_base_ms: i64,
    pub backoff_max_ms: i64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            batch_size: 150,
            low_water: 30,
            max_pages: 3,
            jitter_min_ms: 2000,
            jitter_max_ms: 5000,
            backoff_base_ms: 30_000,
            backoff_max_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSchedule {
    pub next_fetch_at_ms: i64,
    pub backoff_count: u32,
}

/// Compute when the next fetch becomes eligible given the last response
/// status. Status 0 means network failure / timeout.
pub fn compute_next_fetch_at(
    now: i64,
    status: u16,
    backoff_count: u32,
    limits: &BatchLimits,
) -> FetchSchedule {
    if status == 429 {
        let pow = backoff_count.min(20);
        let delay = limits
            .backoff_base_ms
            .saturating_mul(1i64 << pow)
            .min(limits.backoff_max_ms);
        return FetchSchedule {
            next_fetch_at_ms: now.saturating_add(delay),
            backoff_count: backoff_count.saturating_add(1),
        };
    }
    let delay = thread_rng().gen_range(limits.jitter_min_ms..=limits.jitter_max_ms);
    FetchSchedule {
        next_fetch_at_ms: now.saturating_add(delay),
        backoff_count: 0,
    }
}

/// Top up only when the remaining queue drops below the low-water mark,
/// never while a fetch is in flight, and only once the cooldown elapsed.
pub fn should_fetch_more(
    remaining: usize,
    low_water: usize,
    fetching: bool,
    now: i64,
    next_fetch_at_ms: i64,
) -> bool {
    if fetching {
        return false;
    }
    if remaining >= low_water {
        return false;
    }
    now >= next_fetch_at_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub should_continue: bool,
    pub next_pages_fetched: u32,
}

/// Keep paginating only while both the item budget and the page budget
/// have room.
pub fn compute_batch_plan(
    batch_size: usize,
    max_pages: u32,
    pages_fetched: u32,
    fetched_count: usize,
) -> BatchPlan {
    BatchPlan {
        should_continue: fetched_count < batch_size && pages_fetched < max_pages,
        next_pages_fetched: pages_fetched.saturating_add(1),
    }
}

/// "Top off to full target" variant: also requires the last page to have
/// succeeded and a next-page cursor to exist.
pub fn compute_fill_plan(
    queue_length: usize,
    target_count: usize,
    pages_fetched: u32,
    max_pages: u32,
    next_url: Option<&str>,
    status: u16,
) -> bool {
    queue_length < target_count
        && pages_fetched < max_pages
        && status == 200
        && next_url.is_some_and(|u| !u.is_empty())
}

/// Statuses that terminate the current scan loop early.
pub fn should_abort_scan(status: u16) -> bool {
    status == 429 || status == 0 || status >= 500
}
