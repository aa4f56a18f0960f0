/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Instance identity. Ids are never persisted; a restarted instance
//! competes for leases as a new peer.

use rand::rngs::OsRng;
use rand::RngCore;

pub fn new_instance_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
