/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Candidate matching and reply-outcome classification for the monitor
//! duty.

use lurkbot_protocol::{PostErrorBody, TagRef};
use rand::{thread_rng, Rng};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Default title keywords (lottery-style giveaways on the target forum).
pub const KEYWORD_DEFAULTS: &[&str] = &[
    "抽奖", "福利", "抽", "开奖", "抽取", "抽中", "赠送", "送福利", "随机", "中奖",
];

/// Default required tags.
pub const TAG_DEFAULTS: &[&str] = &["抽奖"];

/// Default reply template pool.
pub const REPLY_TEMPLATES: &[&str] = &[
    "参与一下，谢谢",
    "感谢大佬",
    "来参与一下",
    "感谢福利分享",
    "求中求中",
    "来试试手气",
    "参与支持一下",
    "来啦来啦",
];

const MIN_REPLY_CHARS: usize = 4;
const REPLY_PAD: &str = "参与";

pub fn normalize_keywords(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn match_title_keywords(title: &str, keywords: &[String]) -> bool {
    normalize_keywords(keywords)
        .iter()
        .any(|k| title.contains(k.as_str()))
}

/// Tag match: case-insensitive against both tag names and slugs. An empty
/// required list matches nothing (a rule with no tags is inert, not
/// match-all).
pub fn match_topic_tags(tags: &[TagRef], required: &[String]) -> bool {
    let wanted: Vec<String> = required
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if wanted.is_empty() {
        return false;
    }
    let present: Vec<String> = tags.iter().flat_map(|t| t.values()).collect();
    wanted.iter().any(|w| present.iter().any(|p| p == w))
}

/// Pick a template at random, skipping degenerate entries.
pub fn pick_reply_template(templates: &[String]) -> Option<String> {
    let usable: Vec<&String> = templates
        .iter()
        .filter(|t| t.trim().chars().count() >= MIN_REPLY_CHARS)
        .collect();
    if usable.is_empty() {
        return None;
    }
    let idx = thread_rng().gen_range(0..usable.len());
    Some(usable[idx].trim().to_string())
}

/// Compose the reply body; short picks get padded up to the forum's
/// minimum post length.
pub fn build_reply_text(templates: &[String]) -> String {
    let mut text = pick_reply_template(templates).unwrap_or_default();
    if text.chars().count() < MIN_REPLY_CHARS {
        text.push_str(REPLY_PAD);
    }
    text
}

pub fn topic_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    let max = max_ms.max(min_ms);
    thread_rng().gen_range(min_ms..=max)
}

fn day_key(ts_ms: i64, offset_minutes: i32) -> Option<(i32, u8, u8)> {
    let shifted = ts_ms.saturating_add(offset_minutes as i64 * 60_000);
    let dt = OffsetDateTime::from_unix_timestamp(shifted.div_euclid(1000)).ok()?;
    Some((dt.year(), dt.month() as u8, dt.day()))
}

pub fn parse_created_at_ms(created_at: &str) -> Option<i64> {
    let raw = created_at.trim();
    if raw.is_empty() {
        return None;
    }
    let dt = OffsetDateTime::parse(raw, &Rfc3339).ok()?;
    Some((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Local-day comparison; the caller supplies the UTC offset.
pub fn is_topic_from_today(created_at: &str, now_ms: i64, offset_minutes: i32) -> bool {
    let Some(created_ms) = parse_created_at_ms(created_at) else {
        return false;
    };
    day_key(created_ms, offset_minutes) == day_key(now_ms, offset_minutes)
}

pub fn local_offset_minutes() -> i32 {
    time::UtcOffset::current_local_offset()
        .map(|o| o.whole_minutes() as i32)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFailureKind {
    /// Abort the current tick's loop and back off.
    RateLimited,
    /// The forum says we already posted here: an idempotent success.
    AlreadyReplied,
    /// Duplicate-content rejection: also treated as already-done.
    Duplicate,
    /// Structured rejection with no retry value: log, skip for good.
    Rejected,
    /// Anything else; the status propagates upward for backoff scheduling.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReplyFailure {
    pub kind: ReplyFailureKind,
    pub mark_as_replied: bool,
    pub reasons: Vec<String>,
}

const RATE_KEYWORDS: &[&str] = &[
    "too many", "too fast", "rate limit", "slow down", "请稍后", "太快", "频率", "429",
];
const ALREADY_KEYWORDS: &[&str] = &[
    "already replied", "already posted", "你已经回复", "已经回复", "已回复",
];
const DUPLICATE_KEYWORDS: &[&str] = &[
    "similar to what you posted", "duplicate", "重复", "相似", "same as",
];

/// Best-effort classification of a failed post attempt. Unknown 422
/// bodies classify as `Rejected` (skip, never retry).
pub fn classify_reply_failure(status: u16, payload: Option<&PostErrorBody>) -> ReplyFailure {
    let reasons = payload.map(PostErrorBody::reasons).unwrap_or_default();
    let joined = reasons.join(" ").to_lowercase();
    let contains = |keys: &[&str]| keys.iter().any(|k| joined.contains(k));

    if status == 429 || contains(RATE_KEYWORDS) {
        return ReplyFailure {
            kind: ReplyFailureKind::RateLimited,
            mark_as_replied: false,
            reasons,
        };
    }
    if status != 422 {
        return ReplyFailure {
            kind: ReplyFailureKind::Failed,
            mark_as_replied: false,
            reasons,
        };
    }
    if contains(ALREADY_KEYWORDS) {
        return ReplyFailure {
            kind: ReplyFailureKind::AlreadyReplied,
            mark_as_replied: true,
            reasons,
        };
    }
    if contains(DUPLICATE_KEYWORDS) {
        return ReplyFailure {
            kind: ReplyFailureKind::Duplicate,
            mark_as_replied: true,
            reasons,
        };
    }
    ReplyFailure {
        kind: ReplyFailureKind::Rejected,
        mark_as_replied: false,
        reasons,
    }
}

/// Parse the username out of an avatar image URL. Two shapes exist:
/// `/user_avatar/<host>/<name>/...` and `/letter_avatar/<name>/...`.
pub fn parse_username_from_avatar_src(src: &str) -> Option<String> {
    let raw = src.trim();
    if raw.is_empty() {
        return None;
    }
    let segment_after = |marker: &str, skip: usize| -> Option<String> {
        let rest = &raw[raw.find(marker)? + marker.len()..];
        let parts: Vec<&str> = rest.split('/').collect();
        // The name segment must be followed by at least one more segment.
        if parts.len() > skip + 1 && !parts[skip].is_empty() {
            Some(parts[skip].to_string())
        } else {
            None
        }
    };
    let name = segment_after("/user_avatar/", 1).or_else(|| segment_after("/letter_avatar/", 0))?;
    match urlencoding::decode(&name) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => Some(name),
    }
}

/// Any usable id or username counts as success regardless of how it was
/// obtained.
pub fn user_probe_status(id: Option<i64>, username: Option<&str>, status: u16) -> u16 {
    let has_name = username.map(str::trim).is_some_and(|s| !s.is_empty());
    if id.is_some() || has_name {
        200
    } else {
        status
    }
}
