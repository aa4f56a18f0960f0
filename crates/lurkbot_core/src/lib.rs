/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Coordination core for a multi-instance forum automation bot: a shared
//! persisted state record with single-writer duty leases, a rate-adaptive
//! fetch scheduler, bounded history ledgers, a browse-queue runner and a
//! monitor/reply loop.

pub mod browse;
pub mod client;
pub mod history;
pub mod instance;
pub mod lease;
pub mod monitor;
pub mod notify;
pub mod rules;
pub mod runtime;
pub mod schedule;
pub mod state;
pub mod store;
