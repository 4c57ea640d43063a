// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Known-peer bookkeeping behind an async trait, with an in-memory and a
//! SQLite backend.

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use rusqlite::{Connection as SqlConnection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{channel::ChannelId, error::NodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Address the peer was seen at or dialled on.
    pub endpoint: SocketAddr,
    /// Advertised listening address, when it differs from `endpoint`.
    pub server_endpoint: Option<SocketAddr>,
    pub last_com_unix: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub warnings: u32,
    pub channels: BTreeSet<ChannelId>,
    pub features: BTreeSet<String>,
    pub active: bool,
}

impl PeerRecord {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            server_endpoint: None,
            last_com_unix: 0,
            bytes_recv: 0,
            bytes_sent: 0,
            warnings: 0,
            channels: BTreeSet::new(),
            features: BTreeSet::new(),
            active: false,
        }
    }

    /// The address to dial.
    pub fn dial_endpoint(&self) -> SocketAddr {
        self.server_endpoint.unwrap_or(self.endpoint)
    }
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
pub trait PeerDb: Send + Sync {
    /// Insert or replace the record keyed by its endpoint.
    async fn store(&self, record: PeerRecord) -> anyhow::Result<()>;
    async fn fetch(&self, endpoint: SocketAddr) -> anyhow::Result<PeerRecord>;
    async fn remove(&self, endpoint: SocketAddr) -> anyhow::Result<()>;
    async fn set_active(&self, endpoint: SocketAddr, active: bool) -> anyhow::Result<()>;
    async fn get_random_inactive(&self) -> anyhow::Result<PeerRecord>;
    async fn inactive_count(&self) -> anyhow::Result<usize>;
    async fn all_records(&self) -> anyhow::Result<Vec<PeerRecord>>;
    /// Bump the abuse counter, returning the new total.
    async fn record_warning(&self, endpoint: SocketAddr) -> anyhow::Result<u32>;
    /// Mark every record inactive, returning how many were active. Flags left
    /// over from a previous run describe connections that no longer exist.
    async fn reset_active(&self) -> anyhow::Result<usize>;
}

#[derive(Default)]
pub struct MemoryPeerDb {
    records: RwLock<HashMap<SocketAddr, PeerRecord>>,
}

impl MemoryPeerDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PeerDb for MemoryPeerDb {
    async fn store(&self, record: PeerRecord) -> anyhow::Result<()> {
        self.records.write().await.insert(record.endpoint, record);
        Ok(())
    }

    async fn fetch(&self, endpoint: SocketAddr) -> anyhow::Result<PeerRecord> {
        self.records
            .read()
            .await
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| NodeError::not_found("peer", endpoint).into())
    }

    async fn remove(&self, endpoint: SocketAddr) -> anyhow::Result<()> {
        self.records.write().await.remove(&endpoint);
        Ok(())
    }

    async fn set_active(&self, endpoint: SocketAddr, active: bool) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&endpoint)
            .ok_or_else(|| NodeError::not_found("peer", endpoint))?;
        record.active = active;
        if active {
            record.last_com_unix = now_unix_secs();
        }
        Ok(())
    }

    async fn get_random_inactive(&self) -> anyhow::Result<PeerRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|record| !record.active)
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| NodeError::not_found("peer", "any inactive").into())
    }

    async fn inactive_count(&self) -> anyhow::Result<usize> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| !record.active)
            .count())
    }

    async fn all_records(&self) -> anyhow::Result<Vec<PeerRecord>> {
        let mut records = self.records.read().await.values().cloned().collect::<Vec<_>>();
        records.sort_by_key(|record| record.endpoint);
        Ok(records)
    }

    async fn record_warning(&self, endpoint: SocketAddr) -> anyhow::Result<u32> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&endpoint)
            .ok_or_else(|| NodeError::not_found("peer", endpoint))?;
        record.warnings = record.warnings.saturating_add(1);
        Ok(record.warnings)
    }

    async fn reset_active(&self) -> anyhow::Result<usize> {
        let mut records = self.records.write().await;
        let mut reset = 0;
        for record in records.values_mut().filter(|record| record.active) {
            record.active = false;
            reset += 1;
        }
        Ok(reset)
    }
}

/// Peer records in a SQLite file. Each call opens its own connection on a
/// blocking thread.
pub struct SqlitePeerDb {
    path: PathBuf,
}

impl SqlitePeerDb {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let db = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
        });
        let conn = db.open_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peers (
                endpoint TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 0,
                payload BLOB NOT NULL
            );",
        )?;
        Ok(db)
    }

    fn open_connection(&self) -> anyhow::Result<SqlConnection> {
        Ok(SqlConnection::open(&self.path)?)
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqlConnection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqlConnection::open(path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn upsert_sync(conn: &SqlConnection, record: &PeerRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO peers(endpoint, active, payload) VALUES(?1, ?2, ?3)
         ON CONFLICT(endpoint) DO UPDATE SET active = excluded.active, payload = excluded.payload",
        params![
            record.endpoint.to_string(),
            record.active,
            crate::wire::to_cbor(record)?
        ],
    )?;
    Ok(())
}

fn fetch_sync(conn: &SqlConnection, endpoint: SocketAddr) -> anyhow::Result<PeerRecord> {
    let payload: Option<Vec<u8>> = conn
        .query_row(
            "SELECT payload FROM peers WHERE endpoint = ?1",
            params![endpoint.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let payload = payload.ok_or_else(|| NodeError::not_found("peer", endpoint))?;
    Ok(ciborium::from_reader(payload.as_slice())?)
}

#[async_trait]
impl PeerDb for SqlitePeerDb {
    async fn store(&self, record: PeerRecord) -> anyhow::Result<()> {
        self.with_conn(move |conn| upsert_sync(conn, &record)).await
    }

    async fn fetch(&self, endpoint: SocketAddr) -> anyhow::Result<PeerRecord> {
        self.with_conn(move |conn| fetch_sync(conn, endpoint)).await
    }

    async fn remove(&self, endpoint: SocketAddr) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM peers WHERE endpoint = ?1",
                params![endpoint.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_active(&self, endpoint: SocketAddr, active: bool) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = fetch_sync(&tx, endpoint)?;
            record.active = active;
            if active {
                record.last_com_unix = now_unix_secs();
            }
            upsert_sync(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_random_inactive(&self) -> anyhow::Result<PeerRecord> {
        self.with_conn(|conn| {
            let payload: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT payload FROM peers WHERE active = 0 ORDER BY RANDOM() LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let payload = payload.ok_or_else(|| NodeError::not_found("peer", "any inactive"))?;
            Ok(ciborium::from_reader(payload.as_slice())?)
        })
        .await
    }

    async fn inactive_count(&self) -> anyhow::Result<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM peers WHERE active = 0", [], |row| {
                    row.get(0)
                })?;
            Ok(count as usize)
        })
        .await
    }

    async fn all_records(&self) -> anyhow::Result<Vec<PeerRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM peers")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(ciborium::from_reader::<PeerRecord, _>(row?.as_slice())?);
            }
            records.sort_by_key(|record| record.endpoint);
            Ok(records)
        })
        .await
    }

    async fn record_warning(&self, endpoint: SocketAddr) -> anyhow::Result<u32> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut record = fetch_sync(&tx, endpoint)?;
            record.warnings = record.warnings.saturating_add(1);
            upsert_sync(&tx, &record)?;
            tx.commit()?;
            Ok(record.warnings)
        })
        .await
    }

    async fn reset_active(&self) -> anyhow::Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stale = {
                let mut stmt = tx.prepare("SELECT payload FROM peers WHERE active = 1")?;
                let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
                let mut stale = Vec::new();
                for row in rows {
                    stale.push(ciborium::from_reader::<PeerRecord, _>(row?.as_slice())?);
                }
                stale
            };
            for mut record in stale.iter().cloned() {
                record.active = false;
                upsert_sync(&tx, &record)?;
            }
            tx.commit()?;
            Ok(stale.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CHAT_CHANNEL;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn exercise(db: Arc<dyn PeerDb>) {
        let err = db.get_random_inactive().await.expect_err("empty db");
        assert!(NodeError::is_not_found(&err));
        let err = db.fetch(addr(1)).await.expect_err("unknown peer");
        assert!(NodeError::is_not_found(&err));

        let mut record = PeerRecord::new(addr(1));
        record.channels.insert(CHAT_CHANNEL);
        db.store(record.clone()).await.expect("store");
        db.store(PeerRecord::new(addr(2))).await.expect("store");
        assert_eq!(db.inactive_count().await.expect("count"), 2);
        assert_eq!(db.fetch(addr(1)).await.expect("fetch"), record);

        db.set_active(addr(1), true).await.expect("activate");
        assert_eq!(db.inactive_count().await.expect("count"), 1);
        for _ in 0..10 {
            let pick = db.get_random_inactive().await.expect("one inactive left");
            assert_eq!(pick.endpoint, addr(2));
        }
        assert!(db.fetch(addr(1)).await.expect("fetch").last_com_unix > 0);

        assert_eq!(db.record_warning(addr(2)).await.expect("warn"), 1);
        assert_eq!(db.record_warning(addr(2)).await.expect("warn"), 2);
        assert_eq!(db.reset_active().await.expect("reset"), 1);
        assert_eq!(db.inactive_count().await.expect("count"), 2);
        assert!(!db.fetch(addr(1)).await.expect("fetch").active);
        assert_eq!(db.reset_active().await.expect("reset"), 0);
        db.set_active(addr(1), true).await.expect("activate");
        let err = db.set_active(addr(9), true).await.expect_err("unknown");
        assert!(NodeError::is_not_found(&err));

        db.remove(addr(2)).await.expect("remove");
        let all = db.all_records().await.expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].endpoint, addr(1));
        assert_eq!(db.inactive_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn memory_peer_db_contract() {
        exercise(MemoryPeerDb::new()).await;
    }

    #[tokio::test]
    async fn sqlite_peer_db_contract() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise(SqlitePeerDb::open(dir.path().join("peers.db")).expect("open")).await;
    }

    #[tokio::test]
    async fn sqlite_records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.db");
        {
            let db = SqlitePeerDb::open(&path).expect("open");
            let mut record = PeerRecord::new(addr(5));
            record.server_endpoint = Some(addr(6));
            record.features.insert("gossip".into());
            db.store(record).await.expect("store");
        }
        let db = SqlitePeerDb::open(&path).expect("reopen");
        let record = db.fetch(addr(5)).await.expect("fetch");
        assert_eq!(record.dial_endpoint(), addr(6));
        assert!(record.features.contains("gossip"));
    }

    #[tokio::test]
    async fn sqlite_active_flags_clear_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.db");
        {
            let db = SqlitePeerDb::open(&path).expect("open");
            let mut record = PeerRecord::new(addr(7));
            record.active = true;
            db.store(record).await.expect("store");
            db.store(PeerRecord::new(addr(8))).await.expect("store");
        }
        let db = SqlitePeerDb::open(&path).expect("reopen");
        assert_eq!(db.inactive_count().await.expect("count"), 1);
        assert_eq!(db.reset_active().await.expect("reset"), 1);
        assert_eq!(db.inactive_count().await.expect("count"), 2);
        assert!(!db.fetch(addr(7)).await.expect("fetch").active);
    }
}
