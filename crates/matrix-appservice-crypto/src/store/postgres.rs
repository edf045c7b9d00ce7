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

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use ruma::{
    DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::debug;

use super::{kv_keys, CryptoStore, PickleKeyStore, Result, DEFAULT_NAMESPACE};
use crate::types::{
    DeviceKeys, InboundGroupSessionRecord, OlmSessionRecord, OutboundGroupSessionRecord,
    RoomEncryptionConfig, SentRoomKeyRecord,
};

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
        outdated BOOLEAN NOT NULL DEFAULT TRUE
    );

    CREATE TABLE IF NOT EXISTS user_devices (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        device TEXT NOT NULL,
        active BOOLEAN NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );

    CREATE TABLE IF NOT EXISTS outbound_group_sessions (
        ns TEXT NOT NULL,
        session_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        current BOOLEAN NOT NULL,
        pickled TEXT NOT NULL,
        uses_left BIGINT,
        expires_ts BIGINT,
        PRIMARY KEY (ns, session_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS sent_outbound_group_sessions (
        id BIGSERIAL PRIMARY KEY,
        ns TEXT NOT NULL,
        session_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        session_index BIGINT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS sent_outbound_group_sessions_unique
        ON sent_outbound_group_sessions (ns, session_id, room_id, user_id, device_id, session_index);

    CREATE TABLE IF NOT EXISTS olm_sessions (
        ns TEXT NOT NULL,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        last_decryption_ts BIGINT NOT NULL,
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
        id BIGSERIAL PRIMARY KEY,
        ns TEXT NOT NULL,
        room_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        message_index BIGINT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS decrypted_event_metadata_unique
        ON decrypted_event_metadata (ns, room_id, event_id);

    CREATE INDEX IF NOT EXISTS decrypted_event_metadata_replay
        ON decrypted_event_metadata (ns, room_id, session_id, message_index);
";

/// A [`CryptoStore`] backed by a remote postgres database, reached through a
/// connection string.
///
/// When a [`PickleKeyStore`] is attached, the pickle key never touches the
/// database: reads and writes of it go to the external secret store and a
/// refused write surfaces as an error.
#[derive(Clone)]
pub struct PostgresCryptoStore {
    namespace: Arc<str>,
    pool: PgPool,
    pickle_key_store: Option<Arc<dyn PickleKeyStore>>,
}

impl fmt::Debug for PostgresCryptoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCryptoStore")
            .field("namespace", &self.namespace)
            .field("external_pickle_key", &self.pickle_key_store.is_some())
            .finish()
    }
}

impl PostgresCryptoStore {
    /// Connect to the database behind the connection string and create any
    /// missing tables.
    pub async fn open(connection_string: &str) -> Result<Self> {
        Self::open_helper(connection_string, None).await
    }

    /// Like [`open`](Self::open), but the pickle key lives in the given
    /// external secret store instead of the database.
    pub async fn open_with_pickle_key_store(
        connection_string: &str,
        pickle_key_store: Arc<dyn PickleKeyStore>,
    ) -> Result<Self> {
        Self::open_helper(connection_string, Some(pickle_key_store)).await
    }

    async fn open_helper(
        connection_string: &str,
        pickle_key_store: Option<Arc<dyn PickleKeyStore>>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new().connect(connection_string).await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        debug!("Opened the postgres crypto store");

        Ok(Self { namespace: DEFAULT_NAMESPACE.into(), pool, pickle_key_store })
    }

    fn ns(&self) -> &str {
        &self.namespace
    }

    async fn get_kv(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE ns = $1 AND name = $2")
            .bind(self.ns())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_get(0)).transpose().map_err(Into::into)
    }

    async fn set_kv(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (ns, name, value) VALUES ($1, $2, $3)
             ON CONFLICT (ns, name) DO UPDATE SET value = excluded.value",
        )
        .bind(self.ns())
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_outbound(row: &sqlx::postgres::PgRow) -> Result<OutboundGroupSessionRecord> {
        Ok(OutboundGroupSessionRecord {
            session_id: row.try_get("session_id")?,
            room_id: RoomId::parse(row.try_get::<String, _>("room_id")?)?,
            pickled: row.try_get("pickled")?,
            is_current: row.try_get("current")?,
            uses_left: row.try_get("uses_left")?,
            expires_ts: row.try_get("expires_ts")?,
        })
    }

    fn row_to_olm_session(row: &sqlx::postgres::PgRow) -> Result<OlmSessionRecord> {
        Ok(OlmSessionRecord {
            session_id: row.try_get("session_id")?,
            pickled: row.try_get("pickled")?,
            last_decryption_ts: row.try_get("last_decryption_ts")?,
        })
    }
}

#[async_trait]
impl CryptoStore for PostgresCryptoStore {
    async fn get_device_id(&self) -> Result<Option<OwnedDeviceId>> {
        Ok(self.get_kv(kv_keys::DEVICE_ID).await?.map(Into::into))
    }

    async fn set_device_id(&self, device_id: &DeviceId) -> Result<()> {
        self.set_kv(kv_keys::DEVICE_ID, device_id.as_str()).await
    }

    async fn get_pickle_key(&self) -> Result<Option<String>> {
        match &self.pickle_key_store {
            Some(store) => store.get_pickle_key().await,
            None => self.get_kv(kv_keys::PICKLE_KEY).await,
        }
    }

    async fn set_pickle_key(&self, pickle_key: &str) -> Result<()> {
        match &self.pickle_key_store {
            Some(store) => store.set_pickle_key(pickle_key).await,
            None => self.set_kv(kv_keys::PICKLE_KEY, pickle_key).await,
        }
    }

    async fn get_pickled_account(&self) -> Result<Option<String>> {
        self.get_kv(kv_keys::PICKLED_ACCOUNT).await
    }

    async fn set_pickled_account(&self, pickled: &str) -> Result<()> {
        self.set_kv(kv_keys::PICKLED_ACCOUNT, pickled).await
    }

    async fn store_room(&self, room_id: &RoomId, config: &RoomEncryptionConfig) -> Result<()> {
        let config = serde_json::to_string(config)?;

        sqlx::query(
            "INSERT INTO rooms (room_id, config) VALUES ($1, $2)
             ON CONFLICT (room_id) DO UPDATE SET config = excluded.config",
        )
        .bind(room_id.as_str())
        .bind(config)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomEncryptionConfig>> {
        let row = sqlx::query("SELECT config FROM rooms WHERE room_id = $1")
            .bind(room_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(&r.try_get::<String, _>(0)?)?)).transpose()
    }

    async fn flag_users_outdated(&self, user_ids: &[OwnedUserId]) -> Result<()> {
        let mut txn = self.pool.begin().await?;

        for user_id in user_ids {
            sqlx::query(
                "INSERT INTO users (user_id, outdated) VALUES ($1, TRUE)
                 ON CONFLICT (user_id) DO UPDATE SET outdated = TRUE",
            )
            .bind(user_id.as_str())
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;

        Ok(())
    }

    async fn is_user_outdated(&self, user_id: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT outdated FROM users WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get(0)).transpose()?.unwrap_or(true))
    }

    async fn set_active_user_devices(
        &self,
        user_id: &UserId,
        devices: Vec<DeviceKeys>,
    ) -> Result<()> {
        let devices = devices
            .into_iter()
            .map(|d| Ok((d.device_id.to_string(), serde_json::to_string(&d)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let mut txn = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO users (user_id, outdated) VALUES ($1, FALSE)
             ON CONFLICT (user_id) DO UPDATE SET outdated = FALSE",
        )
        .bind(user_id.as_str())
        .execute(&mut *txn)
        .await?;

        sqlx::query("UPDATE user_devices SET active = FALSE WHERE user_id = $1")
            .bind(user_id.as_str())
            .execute(&mut *txn)
            .await?;

        for (device_id, device) in devices {
            sqlx::query(
                "INSERT INTO user_devices (user_id, device_id, device, active)
                 VALUES ($1, $2, $3, TRUE)
                 ON CONFLICT (user_id, device_id)
                 DO UPDATE SET device = excluded.device, active = TRUE",
            )
            .bind(user_id.as_str())
            .bind(device_id)
            .bind(device)
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;

        Ok(())
    }

    async fn get_active_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        let rows = sqlx::query(
            "SELECT device FROM user_devices
             WHERE user_id = $1 AND active ORDER BY device_id",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.try_get::<String, _>(0)?)?))
            .collect()
    }

    async fn get_all_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        let rows = sqlx::query(
            "SELECT device, active FROM user_devices WHERE user_id = $1 ORDER BY device_id",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let mut device: DeviceKeys =
                    serde_json::from_str(&r.try_get::<String, _>("device")?)?;
                let active: bool = r.try_get("active")?;
                device.unsigned.extra.insert("active".to_owned(), JsonValue::from(active));
                Ok(device)
            })
            .collect()
    }

    async fn get_active_user_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>> {
        let row = sqlx::query(
            "SELECT device FROM user_devices
             WHERE user_id = $1 AND device_id = $2 AND active",
        )
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Ok(serde_json::from_str(&r.try_get::<String, _>(0)?)?)).transpose()
    }

    async fn store_outbound_group_session(
        &self,
        session: &OutboundGroupSessionRecord,
    ) -> Result<()> {
        let mut txn = self.pool.begin().await?;

        if session.is_current {
            sqlx::query(
                "UPDATE outbound_group_sessions SET current = FALSE
                 WHERE ns = $1 AND room_id = $2",
            )
            .bind(self.ns())
            .bind(session.room_id.as_str())
            .execute(&mut *txn)
            .await?;
        }

        sqlx::query(
            "INSERT INTO outbound_group_sessions
                 (ns, session_id, room_id, current, pickled, uses_left, expires_ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (ns, session_id, room_id) DO UPDATE SET
                 current = excluded.current,
                 pickled = excluded.pickled,
                 uses_left = excluded.uses_left,
                 expires_ts = excluded.expires_ts",
        )
        .bind(self.ns())
        .bind(&session.session_id)
        .bind(session.room_id.as_str())
        .bind(session.is_current)
        .bind(&session.pickled)
        .bind(session.uses_left)
        .bind(session.expires_ts)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;

        Ok(())
    }

    async fn get_outbound_group_session(
        &self,
        session_id: &str,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, room_id, pickled, current, uses_left, expires_ts
             FROM outbound_group_sessions
             WHERE ns = $1 AND session_id = $2 AND room_id = $3",
        )
        .bind(self.ns())
        .bind(session_id)
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_outbound).transpose()
    }

    async fn get_current_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, room_id, pickled, current, uses_left, expires_ts
             FROM outbound_group_sessions
             WHERE ns = $1 AND room_id = $2 AND current",
        )
        .bind(self.ns())
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_outbound).transpose()
    }

    async fn store_sent_room_key(
        &self,
        session: &OutboundGroupSessionRecord,
        session_index: u32,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sent_outbound_group_sessions
                 (ns, session_id, room_id, user_id, device_id, session_index)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (ns, session_id, room_id, user_id, device_id, session_index)
             DO NOTHING",
        )
        .bind(self.ns())
        .bind(&session.session_id)
        .bind(session.room_id.as_str())
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .bind(i64::from(session_index))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_last_sent_room_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<Option<SentRoomKeyRecord>> {
        let row = sqlx::query(
            "SELECT session_id, session_index FROM sent_outbound_group_sessions
             WHERE ns = $1 AND user_id = $2 AND device_id = $3 AND room_id = $4
             ORDER BY id DESC LIMIT 1",
        )
        .bind(self.ns())
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(SentRoomKeyRecord {
                session_id: r.try_get("session_id")?,
                session_index: r.try_get::<i64, _>("session_index")? as u32,
            })
        })
        .transpose()
    }

    async fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session: &OlmSessionRecord,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO olm_sessions
                 (ns, user_id, device_id, session_id, last_decryption_ts, pickled)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (ns, user_id, device_id, session_id) DO UPDATE SET
                 last_decryption_ts = excluded.last_decryption_ts,
                 pickled = excluded.pickled",
        )
        .bind(self.ns())
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .bind(&session.session_id)
        .bind(session.last_decryption_ts)
        .bind(&session.pickled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_current_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<OlmSessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, pickled, last_decryption_ts FROM olm_sessions
             WHERE ns = $1 AND user_id = $2 AND device_id = $3
             ORDER BY last_decryption_ts DESC LIMIT 1",
        )
        .bind(self.ns())
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_olm_session).transpose()
    }

    async fn get_olm_sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<OlmSessionRecord>> {
        let rows = sqlx::query(
            "SELECT session_id, pickled, last_decryption_ts FROM olm_sessions
             WHERE ns = $1 AND user_id = $2 AND device_id = $3
             ORDER BY last_decryption_ts DESC",
        )
        .bind(self.ns())
        .bind(user_id.as_str())
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_olm_session).collect()
    }

    async fn store_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO inbound_group_sessions
                 (ns, session_id, room_id, user_id, device_id, pickled)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (ns, session_id, room_id, user_id, device_id)
             DO UPDATE SET pickled = excluded.pickled",
        )
        .bind(self.ns())
        .bind(&session.session_id)
        .bind(session.room_id.as_str())
        .bind(session.sender_user_id.as_str())
        .bind(session.sender_device_id.as_str())
        .bind(&session.pickled)
        .execute(&self.pool)
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
        let row = sqlx::query(
            "SELECT pickled FROM inbound_group_sessions
             WHERE ns = $1 AND session_id = $2 AND room_id = $3
               AND user_id = $4 AND device_id = $5",
        )
        .bind(self.ns())
        .bind(session_id)
        .bind(room_id.as_str())
        .bind(sender_user_id.as_str())
        .bind(sender_device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(InboundGroupSessionRecord {
                session_id: session_id.to_owned(),
                room_id: room_id.to_owned(),
                sender_user_id: sender_user_id.to_owned(),
                sender_device_id: sender_device_id.to_owned(),
                pickled: r.try_get(0)?,
            })
        })
        .transpose()
    }

    async fn set_message_index_for_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        session_id: &str,
        message_index: u32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO decrypted_event_metadata
                 (ns, room_id, event_id, session_id, message_index)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (ns, room_id, event_id) DO NOTHING",
        )
        .bind(self.ns())
        .bind(room_id.as_str())
        .bind(event_id.as_str())
        .bind(session_id)
        .bind(i64::from(message_index))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_event_for_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<OwnedEventId>> {
        let row = sqlx::query(
            "SELECT event_id FROM decrypted_event_metadata
             WHERE ns = $1 AND room_id = $2 AND session_id = $3 AND message_index = $4
             ORDER BY id LIMIT 1",
        )
        .bind(self.ns())
        .bind(room_id.as_str())
        .bind(session_id)
        .bind(i64::from(message_index))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Ok(EventId::parse(r.try_get::<String, _>(0)?)?)).transpose()
    }

    fn storage_for_user(&self, user_id: &UserId) -> Arc<dyn CryptoStore> {
        Arc::new(Self {
            namespace: user_id.as_str().into(),
            pool: self.pool.clone(),
            pickle_key_store: self.pickle_key_store.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::PostgresCryptoStore;
    use crate::store::CryptoStore;

    // The full `cryptostore_integration_tests!` suite runs against this
    // backend too, but only when a database is reachable; set
    // `TEST_POSTGRES_URL` and drop the ignore attribute to run it locally.
    #[allow(dead_code)]
    async fn get_store() -> (PostgresCryptoStore, Option<TempDir>) {
        let url = std::env::var("TEST_POSTGRES_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost/appservice_crypto_test".to_owned());
        (PostgresCryptoStore::open(&url).await.unwrap(), None)
    }

    #[tokio::test]
    #[ignore = "needs a running postgres server, see TEST_POSTGRES_URL"]
    async fn kv_item_roundtrips() {
        let (store, _guard) = get_store().await;

        store.set_pickled_account("the_pickled_account").await.unwrap();
        assert_eq!(
            store.get_pickled_account().await.unwrap().as_deref(),
            Some("the_pickled_account")
        );
    }
}
