// Copyright 2024 The appservice-crypto contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use deadpool_sqlite::{Config as PoolConfig, Object as SqliteAsyncConn, Pool, Runtime};
use ruma::{
    DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, UserId,
};
use rusqlite::{OptionalExtension, Params, Transaction};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{kv_keys, CryptoStore, CryptoStoreError, Result, DEFAULT_NAMESPACE};
use crate::types::{
    DeviceKeys, InboundGroupSessionRecord, OlmSessionRecord, OutboundGroupSessionRecord,
    RoomEncryptionConfig, SentRoomKeyRecord,
};

const DATABASE_NAME: &str = "appservice-crypto.sqlite3";

/// Tables and indexes are created on open; the schema is idempotent.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        ns TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (ns, name)
    );

    CREATE TABLE IF NOT EXISTS rooms (
        room_id TEXT NOT NULL PRIMARY KEY,
        config TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT NOT NULL PRIMARY KEY,
        outdated INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS user_devices (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        device TEXT NOT NULL,
        active INTEGER NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS outbound_group_sessions (
        ns TEXT NOT NULL,
        session_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        current INTEGER NOT NULL,
        pickled TEXT NOT NULL,
        uses_left INTEGER,
        expires_ts INTEGER,
        PRIMARY KEY (ns, session_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS sent_outbound_group_sessions (
        ns TEXT NOT NULL,
        session_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        session_index INTEGER NOT NULL,
        PRIMARY KEY (ns, session_id, room_id, user_id, device_id, session_index)
    );

    CREATE TABLE IF NOT EXISTS olm_sessions (
        ns TEXT NOT NULL,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        last_decryption_ts INTEGER NOT NULL,
        pickled TEXT NOT NULL,
        PRIMARY KEY (ns, user_id, device_id, session_id)
    );

    CREATE TABLE IF NOT EXISTS inbound_group_sessions (
        ns TEXT NOT NULL,
        session_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        pickled TEXT NOT NULL,
        PRIMARY KEY (ns, session_id, room_id, user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS decrypted_event_metadata (
        ns TEXT NOT NULL,
        room_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        message_index INTEGER NOT NULL,
        PRIMARY KEY (ns, room_id, event_id)
    );

    CREATE INDEX IF NOT EXISTS decrypted_event_metadata_replay
        ON decrypted_event_metadata (ns, room_id, session_id, message_index);
";

/// A [`CryptoStore`] backed by an embedded sqlite database.
#[derive(Clone)]
pub struct SqliteCryptoStore {
    namespace: Arc<str>,
    pool: Pool,
}

impl fmt::Debug for SqliteCryptoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCryptoStore").field("namespace", &self.namespace).finish()
    }
}

impl SqliteCryptoStore {
    /// Open the sqlite crypto store inside the given directory, creating the
    /// database and any missing tables.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let pool = PoolConfig::new(path.join(DATABASE_NAME))
            .create_pool(Runtime::Tokio1)
            .map_err(|e| CryptoStoreError::Pool(e.to_string()))?;

        let store = Self { namespace: DEFAULT_NAMESPACE.into(), pool };
        store.conn().await?.execute_batch(SCHEMA).await?;

        debug!(path = %path.display(), "Opened the sqlite crypto store");

        Ok(store)
    }

    async fn conn(&self) -> Result<SqliteAsyncConn> {
        self.pool.get().await.map_err(|e| CryptoStoreError::Pool(e.to_string()))
    }

    fn ns(&self) -> String {
        self.namespace.as_ref().to_owned()
    }

    async fn get_kv(&self, name: &str) -> Result<Option<String>> {
        self.conn()
            .await?
            .query_row_opt(
                "SELECT value FROM kv WHERE ns = ?1 AND name = ?2",
                (self.ns(), name.to_owned()),
                |row| row.get(0),
            )
            .await
    }

    async fn set_kv(&self, name: &str, value: String) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO kv (ns, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (ns, name) DO UPDATE SET value = excluded.value",
                (self.ns(), name.to_owned(), value),
            )
            .await?;
        Ok(())
    }

    fn annotate_active(device: &str, active: bool) -> Result<DeviceKeys> {
        let mut device: DeviceKeys = serde_json::from_str(device)?;
        device.unsigned.extra.insert("active".to_owned(), JsonValue::from(active));
        Ok(device)
    }
}

type OutboundRow = (String, String, String, bool, Option<i64>, Option<i64>);

fn outbound_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn outbound_record(row: OutboundRow) -> Result<OutboundGroupSessionRecord> {
    let (session_id, room_id, pickled, is_current, uses_left, expires_ts) = row;

    Ok(OutboundGroupSessionRecord {
        session_id,
        room_id: RoomId::parse(room_id)?,
        pickled,
        is_current,
        uses_left,
        expires_ts,
    })
}

fn olm_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OlmSessionRecord> {
    Ok(OlmSessionRecord {
        session_id: row.get(0)?,
        pickled: row.get(1)?,
        last_decryption_ts: row.get(2)?,
    })
}

#[async_trait]
impl CryptoStore for SqliteCryptoStore {
    async fn get_device_id(&self) -> Result<Option<OwnedDeviceId>> {
        Ok(self.get_kv(kv_keys::DEVICE_ID).await?.map(Into::into))
    }

    async fn set_device_id(&self, device_id: &DeviceId) -> Result<()> {
        self.set_kv(kv_keys::DEVICE_ID, device_id.to_string()).await
    }

    async fn get_pickle_key(&self) -> Result<Option<String>> {
        self.get_kv(kv_keys::PICKLE_KEY).await
    }

    async fn set_pickle_key(&self, pickle_key: &str) -> Result<()> {
        self.set_kv(kv_keys::PICKLE_KEY, pickle_key.to_owned()).await
    }

    async fn get_pickled_account(&self) -> Result<Option<String>> {
        self.get_kv(kv_keys::PICKLED_ACCOUNT).await
    }

    async fn set_pickled_account(&self, pickled: &str) -> Result<()> {
        self.set_kv(kv_keys::PICKLED_ACCOUNT, pickled.to_owned()).await
    }

    async fn store_room(&self, room_id: &RoomId, config: &RoomEncryptionConfig) -> Result<()> {
        let config = serde_json::to_string(config)?;
        self.conn()
            .await?
            .execute(
                "INSERT INTO rooms (room_id, config) VALUES (?1, ?2)
                 ON CONFLICT (room_id) DO UPDATE SET config = excluded.config",
                (room_id.to_string(), config),
            )
            .await?;
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomEncryptionConfig>> {
        let config: Option<String> = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT config FROM rooms WHERE room_id = ?1",
                (room_id.to_string(),),
                |row| row.get(0),
            )
            .await?;

        Ok(config.map(|c| serde_json::from_str(&c)).transpose()?)
    }

    async fn flag_users_outdated(&self, user_ids: &[OwnedUserId]) -> Result<()> {
        let users: Vec<String> = user_ids.iter().map(|u| u.to_string()).collect();

        self.conn()
            .await?
            .with_transaction(move |txn| {
                for user in users {
                    txn.execute(
                        "INSERT INTO users (user_id, outdated) VALUES (?1, 1)
                         ON CONFLICT (user_id) DO UPDATE SET outdated = 1",
                        (user,),
                    )?;
                }
                Ok(())
            })
            .await
    }

    async fn is_user_outdated(&self, user_id: &UserId) -> Result<bool> {
        let outdated: Option<bool> = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT outdated FROM users WHERE user_id = ?1",
                (user_id.to_string(),),
                |row| row.get(0),
            )
            .await?;

        Ok(outdated.unwrap_or(true))
    }

    async fn set_active_user_devices(
        &self,
        user_id: &UserId,
        devices: Vec<DeviceKeys>,
    ) -> Result<()> {
        let user = user_id.to_string();
        let devices = devices
            .into_iter()
            .map(|d| Ok((d.device_id.to_string(), serde_json::to_string(&d)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        self.conn()
            .await?
            .with_transaction(move |txn| {
                txn.execute(
                    "INSERT INTO users (user_id, outdated) VALUES (?1, 0)
                     ON CONFLICT (user_id) DO UPDATE SET outdated = 0",
                    (user.clone(),),
                )?;
                txn.execute("UPDATE user_devices SET active = 0 WHERE user_id = ?1", (user.clone(),))?;

                for (device_id, device) in devices {
                    txn.execute(
                        "INSERT INTO user_devices (user_id, device_id, device, active)
                         VALUES (?1, ?2, ?3, 1)
                         ON CONFLICT (user_id, device_id)
                         DO UPDATE SET device = excluded.device, active = 1",
                        (user.clone(), device_id, device),
                    )?;
                }

                Ok(())
            })
            .await
    }

    async fn get_active_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        let devices: Vec<String> = self
            .conn()
            .await?
            .query_rows(
                "SELECT device FROM user_devices
                 WHERE user_id = ?1 AND active = 1 ORDER BY device_id",
                (user_id.to_string(),),
                |row| row.get(0),
            )
            .await?;

        devices.iter().map(|d| Ok(serde_json::from_str(d)?)).collect()
    }

    async fn get_all_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        let devices: Vec<(String, bool)> = self
            .conn()
            .await?
            .query_rows(
                "SELECT device, active FROM user_devices WHERE user_id = ?1 ORDER BY device_id",
                (user_id.to_string(),),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .await?;

        devices.iter().map(|(device, active)| Self::annotate_active(device, *active)).collect()
    }

    async fn get_active_user_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>> {
        let device: Option<String> = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT device FROM user_devices
                 WHERE user_id = ?1 AND device_id = ?2 AND active = 1",
                (user_id.to_string(), device_id.to_string()),
                |row| row.get(0),
            )
            .await?;

        Ok(device.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    async fn store_outbound_group_session(
        &self,
        session: &OutboundGroupSessionRecord,
    ) -> Result<()> {
        let ns = self.ns();
        let session = session.clone();

        self.conn()
            .await?
            .with_transaction(move |txn| {
                if session.is_current {
                    txn.execute(
                        "UPDATE outbound_group_sessions SET current = 0
                         WHERE ns = ?1 AND room_id = ?2",
                        (ns.clone(), session.room_id.to_string()),
                    )?;
                }

                txn.execute(
                    "INSERT INTO outbound_group_sessions
                         (ns, session_id, room_id, current, pickled, uses_left, expires_ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (ns, session_id, room_id) DO UPDATE SET
                         current = excluded.current,
                         pickled = excluded.pickled,
                         uses_left = excluded.uses_left,
                         expires_ts = excluded.expires_ts",
                    (
                        ns,
                        session.session_id,
                        session.room_id.to_string(),
                        session.is_current,
                        session.pickled,
                        session.uses_left,
                        session.expires_ts,
                    ),
                )?;

                Ok(())
            })
            .await
    }

    async fn get_outbound_group_session(
        &self,
        session_id: &str,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        let row = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT session_id, room_id, pickled, current, uses_left, expires_ts
                 FROM outbound_group_sessions
                 WHERE ns = ?1 AND session_id = ?2 AND room_id = ?3",
                (self.ns(), session_id.to_owned(), room_id.to_string()),
                outbound_row,
            )
            .await?;

        row.map(outbound_record).transpose()
    }

    async fn get_current_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        let row = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT session_id, room_id, pickled, current, uses_left, expires_ts
                 FROM outbound_group_sessions
                 WHERE ns = ?1 AND room_id = ?2 AND current = 1",
                (self.ns(), room_id.to_string()),
                outbound_row,
            )
            .await?;

        row.map(outbound_record).transpose()
    }

    async fn store_sent_room_key(
        &self,
        session: &OutboundGroupSessionRecord,
        session_index: u32,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT OR IGNORE INTO sent_outbound_group_sessions
                     (ns, session_id, room_id, user_id, device_id, session_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    self.ns(),
                    session.session_id.clone(),
                    session.room_id.to_string(),
                    user_id.to_string(),
                    device_id.to_string(),
                    session_index,
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_last_sent_room_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<Option<SentRoomKeyRecord>> {
        self.conn()
            .await?
            .query_row_opt(
                "SELECT session_id, session_index FROM sent_outbound_group_sessions
                 WHERE ns = ?1 AND user_id = ?2 AND device_id = ?3 AND room_id = ?4
                 ORDER BY rowid DESC LIMIT 1",
                (self.ns(), user_id.to_string(), device_id.to_string(), room_id.to_string()),
                |row| {
                    Ok(SentRoomKeyRecord { session_id: row.get(0)?, session_index: row.get(1)? })
                },
            )
            .await
    }

    async fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session: &OlmSessionRecord,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO olm_sessions
                     (ns, user_id, device_id, session_id, last_decryption_ts, pickled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (ns, user_id, device_id, session_id) DO UPDATE SET
                     last_decryption_ts = excluded.last_decryption_ts,
                     pickled = excluded.pickled",
                (
                    self.ns(),
                    user_id.to_string(),
                    device_id.to_string(),
                    session.session_id.clone(),
                    session.last_decryption_ts,
                    session.pickled.clone(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_current_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<OlmSessionRecord>> {
        self.conn()
            .await?
            .query_row_opt(
                "SELECT session_id, pickled, last_decryption_ts FROM olm_sessions
                 WHERE ns = ?1 AND user_id = ?2 AND device_id = ?3
                 ORDER BY last_decryption_ts DESC LIMIT 1",
                (self.ns(), user_id.to_string(), device_id.to_string()),
                olm_session_row,
            )
            .await
    }

    async fn get_olm_sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<OlmSessionRecord>> {
        self.conn()
            .await?
            .query_rows(
                "SELECT session_id, pickled, last_decryption_ts FROM olm_sessions
                 WHERE ns = ?1 AND user_id = ?2 AND device_id = ?3
                 ORDER BY last_decryption_ts DESC",
                (self.ns(), user_id.to_string(), device_id.to_string()),
                olm_session_row,
            )
            .await
    }

    async fn store_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT INTO inbound_group_sessions
                     (ns, session_id, room_id, user_id, device_id, pickled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (ns, session_id, room_id, user_id, device_id)
                 DO UPDATE SET pickled = excluded.pickled",
                (
                    self.ns(),
                    session.session_id.clone(),
                    session.room_id.to_string(),
                    session.sender_user_id.to_string(),
                    session.sender_device_id.to_string(),
                    session.pickled.clone(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        sender_user_id: &UserId,
        sender_device_id: &DeviceId,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>> {
        let pickled: Option<String> = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT pickled FROM inbound_group_sessions
                 WHERE ns = ?1 AND session_id = ?2 AND room_id = ?3
                   AND user_id = ?4 AND device_id = ?5",
                (
                    self.ns(),
                    session_id.to_owned(),
                    room_id.to_string(),
                    sender_user_id.to_string(),
                    sender_device_id.to_string(),
                ),
                |row| row.get(0),
            )
            .await?;

        Ok(pickled.map(|pickled| InboundGroupSessionRecord {
            session_id: session_id.to_owned(),
            room_id: room_id.to_owned(),
            sender_user_id: sender_user_id.to_owned(),
            sender_device_id: sender_device_id.to_owned(),
            pickled,
        }))
    }

    async fn set_message_index_for_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        session_id: &str,
        message_index: u32,
    ) -> Result<()> {
        self.conn()
            .await?
            .execute(
                "INSERT OR IGNORE INTO decrypted_event_metadata
                     (ns, room_id, event_id, session_id, message_index)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    self.ns(),
                    room_id.to_string(),
                    event_id.to_string(),
                    session_id.to_owned(),
                    message_index,
                ),
            )
            .await?;
        Ok(())
    }

    async fn get_event_for_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<OwnedEventId>> {
        let event_id: Option<String> = self
            .conn()
            .await?
            .query_row_opt(
                "SELECT event_id FROM decrypted_event_metadata
                 WHERE ns = ?1 AND room_id = ?2 AND session_id = ?3 AND message_index = ?4
                 ORDER BY rowid LIMIT 1",
                (self.ns(), room_id.to_string(), session_id.to_owned(), message_index),
                |row| row.get(0),
            )
            .await?;

        Ok(event_id.map(EventId::parse).transpose()?)
    }

    fn storage_for_user(&self, user_id: &UserId) -> Arc<dyn CryptoStore> {
        Arc::new(Self { namespace: user_id.as_str().into(), pool: self.pool.clone() })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}

#[async_trait]
trait SqliteAsyncConnExt {
    async fn execute<P>(&self, sql: &'static str, params: P) -> Result<usize>
    where
        P: Params + Send + 'static;

    async fn execute_batch(&self, sql: &'static str) -> Result<()>;

    async fn query_row_opt<T, P, F>(&self, sql: &'static str, params: P, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static;

    async fn query_rows<T, P, F>(&self, sql: &'static str, params: P, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static;

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T> + Send + 'static;
}

#[async_trait]
impl SqliteAsyncConnExt for SqliteAsyncConn {
    async fn execute<P>(&self, sql: &'static str, params: P) -> Result<usize>
    where
        P: Params + Send + 'static,
    {
        Ok(self.interact(move |conn| conn.execute(sql, params)).await.map_err(interact_error)??)
    }

    async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        Ok(self.interact(move |conn| conn.execute_batch(sql)).await.map_err(interact_error)??)
    }

    async fn query_row_opt<T, P, F>(&self, sql: &'static str, params: P, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self
            .interact(move |conn| conn.query_row(sql, params, f).optional())
            .await
            .map_err(interact_error)??)
    }

    async fn query_rows<T, P, F>(&self, sql: &'static str, params: P, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        P: Params + Send + 'static,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self
            .interact(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(params, f)?;
                rows.collect::<rusqlite::Result<Vec<T>>>()
            })
            .await
            .map_err(interact_error)??)
    }

    async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self
            .interact(move |conn| {
                let txn = conn.transaction()?;
                let result = f(&txn)?;
                txn.commit()?;
                Ok::<_, rusqlite::Error>(result)
            })
            .await
            .map_err(interact_error)??)
    }
}

fn interact_error(error: deadpool_sqlite::InteractError) -> CryptoStoreError {
    CryptoStoreError::Pool(error.to_string())
}
