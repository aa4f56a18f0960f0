/*
 * SPDX-FileCopyrightText: 2026 Lurkbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The shared persisted store all instances coordinate through. One sqlite
//! row holds the record as a JSON document; writes are partial patches
//! applied under an immediate transaction, so concurrent writers
//! interleave at patch granularity. Each patch fans out a change
//! notification; lagging receivers just re-`load()`.

use crate::state::{PersistedState, StatePatch};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StateChange {
    /// Top-level field names touched by the patch.
    pub keys: Vec<String>,
    /// Full state after the patch was applied.
    pub state: PersistedState,
}

#[derive(Clone)]
pub struct StateStore {
    db_path: PathBuf,
    tx: broadcast::Sender<StateChange>,
}

impl StateStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { db_path, tx })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    /// Merge-with-defaults read: fields absent from the stored document
    /// take their `PersistedState` defaults.
    pub async fn load(&self) -> Result<PersistedState> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<PersistedState> {
                let conn = Connection::open(db_path)?;
                read_state(&conn)
            }
        })
        .await?
    }

    /// Apply a partial patch, broadcast and return the resulting state.
    pub async fn patch(&self, patch: &StatePatch) -> Result<PersistedState> {
        let patch_value =
            serde_json::to_value(patch).context("serialize state patch")?;
        let keys: Vec<String> = match &patch_value {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        if keys.is_empty() {
            return self.load().await;
        }

        let state = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<PersistedState> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction_with_behavior(
                    rusqlite::TransactionBehavior::Immediate,
                )?;
                let doc: Option<String> = tx
                    .query_row("SELECT doc FROM bot_state WHERE id = 0", [], |r| r.get(0))
                    .optional()?;
                let mut merged: serde_json::Value = doc
                    .as_deref()
                    .and_then(|d| serde_json::from_str(d).ok())
                    .unwrap_or_else(|| serde_json::json!({}));
                if let (serde_json::Value::Object(target), serde_json::Value::Object(overlay)) =
                    (&mut merged, patch_value)
                {
                    for (k, v) in overlay {
                        target.insert(k, v);
                    }
                }
                tx.execute(
                    "INSERT INTO bot_state (id, doc) VALUES (0, ?1)
                     ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                    params![merged.to_string()],
                )?;
                tx.commit()?;
                serde_json::from_value(merged).context("deserialize merged state")
            }
        })
        .await??;

        let _ = self.tx.send(StateChange {
            keys,
            state: state.clone(),
        });
        Ok(state)
    }
}

fn read_state(conn: &Connection) -> Result<PersistedState> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM bot_state WHERE id = 0", [], |r| r.get(0))
        .optional()?;
    match doc {
        Some(d) => serde_json::from_str(&d).context("deserialize state doc"),
        None => Ok(PersistedState::default()),
    }
}

fn init_db(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create state dir: {}", parent.display()))?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS bot_state (
          id INTEGER PRIMARY KEY CHECK (id = 0),
          doc TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> StateStore {
        StateStore::open(tmp.path().join("state.db")).unwrap()
    }

    #[tokio::test]
    async fn load_on_fresh_db_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let state = store.load().await.unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[tokio::test]
    async fn patch_merges_and_persists() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let state = store
            .patch(&StatePatch {
                running: Some(true),
                run_id: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(state.running);
        assert_eq!(state.run_id, 3);

        // Second patch leaves the first one's fields untouched.
        let state = store
            .patch(&StatePatch {
                monitor_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(state.running);
        assert!(state.monitor_enabled);

        // Survives a reopen.
        let reopened = open_store(&tmp);
        let state = reopened.load().await.unwrap();
        assert_eq!(state.run_id, 3);
        assert!(state.monitor_enabled);
    }

    #[tokio::test]
    async fn patch_can_clear_nullable_fields() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store
            .patch(&StatePatch {
                owner_id: Some(Some("a".into())),
                owner_heartbeat_ms: Some(123),
                ..Default::default()
            })
            .await
            .unwrap();
        let state = store
            .patch(&StatePatch {
                owner_id: Some(None),
                owner_heartbeat_ms: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.owner_id, None);
        assert_eq!(state.owner_heartbeat_ms, 0);
    }

    #[tokio::test]
    async fn subscribers_see_change_keys_and_state() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let mut rx = store.subscribe();

        store
            .patch(&StatePatch {
                monitor_enabled: Some(true),
                monitor_backoff_count: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        let change = rx.recv().await.unwrap();
        assert!(change.keys.contains(&"monitor_enabled".to_string()));
        assert!(change.keys.contains(&"monitor_backoff_count".to_string()));
        assert!(change.state.monitor_enabled);
    }

    #[tokio::test]
    async fn empty_patch_is_a_read() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let mut rx = store.subscribe();
        let state = store.patch(&StatePatch::default()).await.unwrap();
        assert_eq!(state, PersistedState::default());
        assert!(rx.try_recv().is_err());
    }
}
