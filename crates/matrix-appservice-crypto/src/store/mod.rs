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

//! Durable storage for the crypto state.
//!
//! Three backends implement the [`CryptoStore`] contract: an embedded sqlite
//! file, a remote postgres database reached through a connection string, and
//! an in-memory store for tests and throwaway sessions.
//!
//! Every store is *namespaced*: one physical database can hold the crypto
//! state of many virtual users, which is how a single appservice process
//! drives a fleet of them. [`CryptoStore::storage_for_user`] derives a view
//! of the same store that reads and writes another namespace. The `rooms`,
//! `users` and `user_devices` tables describe server-side identities and are
//! deliberately shared across all namespaces.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, UserId};
use thiserror::Error;

use crate::types::{
    DeviceKeys, InboundGroupSessionRecord, OlmSessionRecord, OutboundGroupSessionRecord,
    RoomEncryptionConfig, SentRoomKeyRecord,
};

pub mod memory;
#[cfg(feature = "postgres-store")]
pub mod postgres;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

pub use memory::MemoryCryptoStore;
#[cfg(feature = "postgres-store")]
pub use postgres::PostgresCryptoStore;
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteCryptoStore;

/// The namespace used by a store that wasn't derived with
/// [`CryptoStore::storage_for_user`].
pub const DEFAULT_NAMESPACE: &str = "default";

/// Well-known names in the `kv` table.
pub(crate) mod kv_keys {
    pub const DEVICE_ID: &str = "device_id";
    pub const PICKLE_KEY: &str = "pickle_key";
    pub const PICKLED_ACCOUNT: &str = "pickled_account";
}

#[derive(Error, Debug)]
pub enum CryptoStoreError {
    #[error("can't read or write from the store")]
    Io(#[from] std::io::Error),
    #[error("error serializing data for the store")]
    Serialization(#[from] serde_json::Error),
    #[error("a stored identifier is malformed")]
    Identifier(#[from] ruma::IdParseError),
    #[error("the secret store refused the operation: {0}")]
    SecretStore(String),
    #[cfg(feature = "sqlite-store")]
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "sqlite-store")]
    #[error("sqlite pool error: {0}")]
    Pool(String),
    #[cfg(feature = "postgres-store")]
    #[error("postgres error")]
    Postgres(#[from] sqlx::Error),
}

/// The result type of every store operation.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// A pluggable home for the pickle key.
///
/// The remote store accepts one of these so the key that protects all pickled
/// material can live in an external vault instead of next to the pickles. A
/// refused write must surface as an error; the store never quietly falls back
/// to its own `kv` table.
#[async_trait]
pub trait PickleKeyStore: Debug + Send + Sync {
    /// Fetch the pickle key, if one was stored before.
    async fn get_pickle_key(&self) -> Result<Option<String>>;

    /// Persist the pickle key.
    async fn set_pickle_key(&self, pickle_key: &str) -> Result<()>;
}

/// Persistent storage contract for all crypto state.
///
/// Multi-row writes are transactional in the SQL backends; the store performs
/// no retries, backend errors surface as [`CryptoStoreError`].
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Get our own stored device id.
    async fn get_device_id(&self) -> Result<Option<OwnedDeviceId>>;

    /// Store our own device id.
    async fn set_device_id(&self, device_id: &DeviceId) -> Result<()>;

    /// Get the pickle key protecting all pickled material in this store.
    async fn get_pickle_key(&self) -> Result<Option<String>>;

    /// Store the pickle key.
    async fn set_pickle_key(&self, pickle_key: &str) -> Result<()>;

    /// Get the pickled account of the crypto machine.
    async fn get_pickled_account(&self) -> Result<Option<String>>;

    /// Store the pickled account of the crypto machine.
    async fn set_pickled_account(&self, pickled: &str) -> Result<()>;

    /// Store a room's encryption config. Room configs are global, not
    /// namespaced.
    async fn store_room(&self, room_id: &RoomId, config: &RoomEncryptionConfig) -> Result<()>;

    /// Get a room's encryption config.
    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomEncryptionConfig>>;

    /// Flag each user's device list as outdated, creating the users if they
    /// were never seen.
    async fn flag_users_outdated(&self, user_ids: &[OwnedUserId]) -> Result<()>;

    /// Whether we need to refresh the user's device list. Users we have never
    /// seen are outdated by definition.
    async fn is_user_outdated(&self, user_id: &UserId) -> Result<bool>;

    /// Replace the user's set of active devices.
    ///
    /// Atomically clears the user's outdated flag, marks every previously
    /// known device inactive and upserts the given devices as active.
    /// Historical devices are kept so key pinning can be enforced if a device
    /// id ever comes back with different keys.
    async fn set_active_user_devices(
        &self,
        user_id: &UserId,
        devices: Vec<DeviceKeys>,
    ) -> Result<()>;

    /// Get the user's active devices.
    async fn get_active_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>>;

    /// Get every device ever seen for the user, active or not. Each device's
    /// `unsigned` data carries an `active` flag.
    async fn get_all_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>>;

    /// Get a single active device of a user.
    async fn get_active_user_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>>;

    /// Store an outbound group session.
    ///
    /// If the session is flagged current, the flag is first cleared from
    /// every other session of the room in the same transaction, so at most
    /// one session per room is ever current.
    async fn store_outbound_group_session(
        &self,
        session: &OutboundGroupSessionRecord,
    ) -> Result<()>;

    /// Get a specific outbound group session.
    async fn get_outbound_group_session(
        &self,
        session_id: &str,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>>;

    /// Get the room's current outbound group session, if any.
    async fn get_current_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>>;

    /// Record that a device received an outbound group session at the given
    /// ratchet index. Re-recording the same tuple is a no-op.
    async fn store_sent_room_key(
        &self,
        session: &OutboundGroupSessionRecord,
        session_index: u32,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<()>;

    /// The most recently recorded session share for a device in a room.
    async fn get_last_sent_room_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<Option<SentRoomKeyRecord>>;

    /// Store an Olm session with a peer device, upserting by session id.
    async fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session: &OlmSessionRecord,
    ) -> Result<()>;

    /// The device's current Olm session: the one with the most recent
    /// decryption timestamp.
    async fn get_current_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<OlmSessionRecord>>;

    /// All Olm sessions with a device, most recently used first.
    async fn get_olm_sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<OlmSessionRecord>>;

    /// Store an inbound group session.
    async fn store_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<()>;

    /// Get an inbound group session by sender, room and session id.
    async fn get_inbound_group_session(
        &self,
        sender_user_id: &UserId,
        sender_device_id: &DeviceId,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>>;

    /// Record which (session, ratchet index) pair a decrypted event used.
    async fn set_message_index_for_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        session_id: &str,
        message_index: u32,
    ) -> Result<()>;

    /// Look up the event that already used a (session, ratchet index) pair.
    /// A hit for a *different* event id than the one being decrypted means
    /// the ciphertext is being replayed.
    async fn get_event_for_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<OwnedEventId>>;

    /// Derive a view of this store whose namespaced tables belong to the
    /// given virtual user. The view shares the physical connection.
    fn storage_for_user(&self, user_id: &UserId) -> Arc<dyn CryptoStore>;

    /// Release the underlying database handles.
    async fn close(&self) -> Result<()>;
}

/// A test suite every [`CryptoStore`] backend embeds.
///
/// Expects an async `get_store() -> (impl CryptoStore, guard)` helper at the
/// invocation site; the guard keeps backend resources (e.g. a temp dir)
/// alive for the duration of a test.
#[cfg(test)]
#[macro_export]
macro_rules! cryptostore_integration_tests {
    () => {
        mod cryptostore_integration {
            use ruma::{device_id, event_id, room_id, user_id, EventEncryptionAlgorithm};
            use serde_json::json;

            use super::get_store;
            use $crate::{
                store::CryptoStore,
                types::{
                    DeviceKeys, InboundGroupSessionRecord, OlmSessionRecord,
                    OutboundGroupSessionRecord, RoomEncryptionConfig,
                },
            };

            fn device(user: &str, device_id: &str, ed25519: &str) -> DeviceKeys {
                serde_json::from_value(json!({
                    "user_id": user,
                    "device_id": device_id,
                    "algorithms": ["m.megolm.v1.aes-sha2"],
                    "keys": {
                        (format!("curve25519:{device_id}")): format!("curve_{device_id}"),
                        (format!("ed25519:{device_id}")): ed25519,
                    },
                    "signatures": {
                        user: { (format!("ed25519:{device_id}")): "signature" }
                    },
                }))
                .unwrap()
            }

            fn outbound(room_id: &str, session_id: &str, current: bool) -> OutboundGroupSessionRecord {
                OutboundGroupSessionRecord {
                    session_id: session_id.to_owned(),
                    room_id: <&ruma::RoomId>::try_from(room_id).unwrap().to_owned(),
                    pickled: format!("pickle_{session_id}"),
                    is_current: current,
                    uses_left: Some(100),
                    expires_ts: Some(1_700_000_000_000),
                }
            }

            fn room_config() -> RoomEncryptionConfig {
                RoomEncryptionConfig {
                    algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                    rotation_period_ms: Some(604_800_000),
                    rotation_period_msgs: Some(100),
                    history_visibility: None,
                }
            }

            #[tokio::test]
            async fn kv_item_roundtrips() {
                let (store, _guard) = get_store().await;

                assert!(store.get_device_id().await.unwrap().is_none());
                assert!(store.get_pickle_key().await.unwrap().is_none());
                assert!(store.get_pickled_account().await.unwrap().is_none());

                store.set_device_id(device_id!("HCDJLDXQHQ")).await.unwrap();
                store.set_pickle_key("the_pickle_key").await.unwrap();
                store.set_pickled_account("the_pickled_account").await.unwrap();

                assert_eq!(
                    store.get_device_id().await.unwrap().as_deref(),
                    Some(device_id!("HCDJLDXQHQ"))
                );
                assert_eq!(store.get_pickle_key().await.unwrap().as_deref(), Some("the_pickle_key"));
                assert_eq!(
                    store.get_pickled_account().await.unwrap().as_deref(),
                    Some("the_pickled_account")
                );

                store.set_pickled_account("repickled").await.unwrap();
                assert_eq!(store.get_pickled_account().await.unwrap().as_deref(), Some("repickled"));
            }

            #[tokio::test]
            async fn room_config_roundtrips() {
                let (store, _guard) = get_store().await;
                let room_id = room_id!("!encrypted:localhost");

                assert!(store.get_room(room_id).await.unwrap().is_none());

                let config = room_config();
                store.store_room(room_id, &config).await.unwrap();
                assert_eq!(store.get_room(room_id).await.unwrap(), Some(config));
            }

            #[tokio::test]
            async fn outdated_flags() {
                let (store, _guard) = get_store().await;
                let user_id = user_id!("@ping:localhost");

                assert!(store.is_user_outdated(user_id).await.unwrap(), "unseen users are outdated");

                store.set_active_user_devices(user_id, vec![]).await.unwrap();
                assert!(!store.is_user_outdated(user_id).await.unwrap());

                store.flag_users_outdated(&[user_id.to_owned()]).await.unwrap();
                assert!(store.is_user_outdated(user_id).await.unwrap());
            }

            #[tokio::test]
            async fn active_device_replacement() {
                let (store, _guard) = get_store().await;
                let user_id = user_id!("@ping:localhost");

                let first = device("@ping:localhost", "AAAA", "key_a");
                let second = device("@ping:localhost", "BBBB", "key_b");
                let third = device("@ping:localhost", "CCCC", "key_c");

                store
                    .set_active_user_devices(user_id, vec![first.clone(), second.clone()])
                    .await
                    .unwrap();

                let active = store.get_active_user_devices(user_id).await.unwrap();
                assert_eq!(active.len(), 2);

                store
                    .set_active_user_devices(user_id, vec![second.clone(), third.clone()])
                    .await
                    .unwrap();

                let mut active: Vec<_> = store
                    .get_active_user_devices(user_id)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|d| d.device_id)
                    .collect();
                active.sort();
                assert_eq!(active, vec!["BBBB", "CCCC"]);

                let all = store.get_all_user_devices(user_id).await.unwrap();
                assert_eq!(all.len(), 3);

                let replaced = all.iter().find(|d| d.device_id == "AAAA").unwrap();
                assert!(!replaced.is_active(), "replaced devices are kept but flagged inactive");
                assert_eq!(replaced.ed25519_key(), Some("key_a"), "the historical record is intact");

                assert!(store
                    .get_active_user_device(user_id, device_id!("AAAA"))
                    .await
                    .unwrap()
                    .is_none());
                assert!(store
                    .get_active_user_device(user_id, device_id!("BBBB"))
                    .await
                    .unwrap()
                    .is_some());
            }

            #[tokio::test]
            async fn outbound_session_rotation() {
                let (store, _guard) = get_store().await;
                let room_id = room_id!("!r:x");

                assert!(store.get_current_outbound_group_session(room_id).await.unwrap().is_none());

                store.store_outbound_group_session(&outbound("!r:x", "A", true)).await.unwrap();
                store.store_outbound_group_session(&outbound("!r:x", "B", true)).await.unwrap();

                let current =
                    store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();
                assert_eq!(current.session_id, "B");

                let first = store.get_outbound_group_session("A", room_id).await.unwrap().unwrap();
                assert!(!first.is_current, "storing a new current session demotes the old one");

                // A session stored for another room doesn't touch this room's
                // current flag.
                store.store_outbound_group_session(&outbound("!other:x", "C", true)).await.unwrap();
                let current =
                    store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();
                assert_eq!(current.session_id, "B");
            }

            #[tokio::test]
            async fn sent_room_key_ledger() {
                let (store, _guard) = get_store().await;
                let room_id = room_id!("!r:x");
                let user_id = user_id!("@receiver:localhost");
                let device_id = device_id!("RECVDEV");

                assert!(store
                    .get_last_sent_room_key(user_id, device_id, room_id)
                    .await
                    .unwrap()
                    .is_none());

                let session = outbound("!r:x", "A", true);
                store.store_sent_room_key(&session, 0, user_id, device_id).await.unwrap();
                // Recording the same share again is a no-op.
                store.store_sent_room_key(&session, 0, user_id, device_id).await.unwrap();
                store.store_sent_room_key(&session, 4, user_id, device_id).await.unwrap();

                let last = store
                    .get_last_sent_room_key(user_id, device_id, room_id)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(last.session_id, "A");
                assert_eq!(last.session_index, 4);
            }

            #[tokio::test]
            async fn current_olm_session_has_newest_timestamp() {
                let (store, _guard) = get_store().await;
                let user_id = user_id!("@ping:localhost");
                let device_id = device_id!("HCDJLDXQHQ");

                for (session_id, ts) in [("one", 10), ("three", 30), ("two", 20)] {
                    let session = OlmSessionRecord {
                        session_id: session_id.to_owned(),
                        pickled: format!("pickle_{session_id}"),
                        last_decryption_ts: ts,
                    };
                    store.store_olm_session(user_id, device_id, &session).await.unwrap();
                }

                let current =
                    store.get_current_olm_session(user_id, device_id).await.unwrap().unwrap();
                assert_eq!(current.session_id, "three");

                let sessions = store.get_olm_sessions(user_id, device_id).await.unwrap();
                let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
                assert_eq!(ids, ["three", "two", "one"], "most recently used first");
            }

            #[tokio::test]
            async fn inbound_session_roundtrips() {
                let (store, _guard) = get_store().await;

                let session = InboundGroupSessionRecord {
                    session_id: "inbound".to_owned(),
                    room_id: room_id!("!r:x").to_owned(),
                    sender_user_id: user_id!("@sender:localhost").to_owned(),
                    sender_device_id: device_id!("SENDERDEV").to_owned(),
                    pickled: "pickle_inbound".to_owned(),
                };

                store.store_inbound_group_session(&session).await.unwrap();

                let loaded = store
                    .get_inbound_group_session(
                        user_id!("@sender:localhost"),
                        device_id!("SENDERDEV"),
                        room_id!("!r:x"),
                        "inbound",
                    )
                    .await
                    .unwrap();
                assert_eq!(loaded, Some(session));

                let missing = store
                    .get_inbound_group_session(
                        user_id!("@other:localhost"),
                        device_id!("SENDERDEV"),
                        room_id!("!r:x"),
                        "inbound",
                    )
                    .await
                    .unwrap();
                assert!(missing.is_none());
            }

            #[tokio::test]
            async fn message_index_keeps_the_first_event() {
                let (store, _guard) = get_store().await;
                let room_id = room_id!("!r:x");

                assert!(store
                    .get_event_for_message_index(room_id, "session", 0)
                    .await
                    .unwrap()
                    .is_none());

                store
                    .set_message_index_for_event(room_id, event_id!("$first"), "session", 0)
                    .await
                    .unwrap();

                assert_eq!(
                    store.get_event_for_message_index(room_id, "session", 0).await.unwrap().as_deref(),
                    Some(event_id!("$first"))
                );

                // A replayed ciphertext under a new event id must not displace
                // the original mapping.
                store
                    .set_message_index_for_event(room_id, event_id!("$replay"), "session", 0)
                    .await
                    .unwrap();

                assert_eq!(
                    store.get_event_for_message_index(room_id, "session", 0).await.unwrap().as_deref(),
                    Some(event_id!("$first"))
                );
            }

            #[tokio::test]
            async fn namespaced_views_are_isolated() {
                let (store, _guard) = get_store().await;
                let view = store.storage_for_user(user_id!("@u:e"));

                view.set_device_id(device_id!("ABC")).await.unwrap();
                assert!(store.get_device_id().await.unwrap().is_none());
                assert_eq!(view.get_device_id().await.unwrap().as_deref(), Some(device_id!("ABC")));

                view.store_outbound_group_session(&outbound("!r:x", "A", true)).await.unwrap();
                assert!(store
                    .get_current_outbound_group_session(room_id!("!r:x"))
                    .await
                    .unwrap()
                    .is_none());
                assert!(view
                    .get_current_outbound_group_session(room_id!("!r:x"))
                    .await
                    .unwrap()
                    .is_some());

                // Rooms and server-side identities are global.
                store.store_room(room_id!("!shared:x"), &room_config()).await.unwrap();
                assert!(view.get_room(room_id!("!shared:x")).await.unwrap().is_some());

                let user_id = user_id!("@ping:localhost");
                store
                    .set_active_user_devices(user_id, vec![device("@ping:localhost", "AAAA", "key_a")])
                    .await
                    .unwrap();
                assert_eq!(view.get_active_user_devices(user_id).await.unwrap().len(), 1);
                assert!(!view.is_user_outdated(user_id).await.unwrap());
            }
        }
    };
}
