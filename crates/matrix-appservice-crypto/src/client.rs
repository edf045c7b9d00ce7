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

//! The encryption façade an appservice or bot client holds per user.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock as StdRwLock,
};

use rand::{distributions::Alphanumeric, Rng};
use ruma::{EventId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
    backups::BackupManager,
    driver::MachineDriver,
    error::{CryptoError, Result},
    events::{CryptoEvent, CryptoEvents},
    machine::{CryptoMachine, MachineInitData},
    store::CryptoStore,
    tracker::DeviceTracker,
    transport::CryptoTransport,
    types::{
        DecryptedRoomEvent, DeviceKeys, EncryptedContent, KeyBackupInfo, KeyBackupVersion,
        RoomEncryptionConfig, SignatureMap, SyncChanges,
    },
    group_sessions::GroupSessionManager,
};

const PICKLE_KEY_LENGTH: usize = 64;

/// The top-level handle to the encryption subsystem for one (virtual) user.
///
/// An appservice process holds one `CryptoClient` per virtual user, each
/// constructed over [`CryptoStore::storage_for_user`]-derived storage, a
/// machine instance and the shared transport. Nothing works before
/// [`prepare`](Self::prepare) ran once.
pub struct CryptoClient {
    user_id: OwnedUserId,
    device_id: StdRwLock<Option<OwnedDeviceId>>,
    store: Arc<dyn CryptoStore>,
    machine: Arc<dyn CryptoMachine>,
    transport: Arc<dyn CryptoTransport>,
    driver: Arc<MachineDriver>,
    tracker: Arc<DeviceTracker>,
    group_sessions: GroupSessionManager,
    backups: Arc<BackupManager>,
    events: CryptoEvents,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for CryptoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoClient")
            .field("user_id", &self.user_id)
            .field("ready", &self.ready.load(Ordering::Acquire))
            .finish()
    }
}

impl CryptoClient {
    /// Wire up the subsystem for one user. No I/O happens until
    /// [`prepare`](Self::prepare).
    pub fn new(
        user_id: &UserId,
        store: Arc<dyn CryptoStore>,
        machine: Arc<dyn CryptoMachine>,
        transport: Arc<dyn CryptoTransport>,
    ) -> Self {
        let events = CryptoEvents::new();
        let ready = Arc::new(AtomicBool::new(false));

        let driver =
            Arc::new(MachineDriver::new(machine.clone(), transport.clone(), events.clone()));
        let tracker = Arc::new(DeviceTracker::new(store.clone(), transport.clone()));
        let backups = Arc::new(BackupManager::new(
            machine.clone(),
            transport.clone(),
            events.clone(),
            driver.sync_lock(),
            ready.clone(),
        ));
        let group_sessions = GroupSessionManager::new(
            store.clone(),
            transport.clone(),
            machine.clone(),
            driver.clone(),
            backups.clone(),
        );

        Self {
            user_id: user_id.to_owned(),
            device_id: StdRwLock::new(None),
            store,
            machine,
            transport,
            driver,
            tracker,
            group_sessions,
            backups,
            events,
            ready,
        }
    }

    /// The user this client encrypts for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device id of this login, known once [`prepare`](Self::prepare)
    /// ran.
    pub fn device_id(&self) -> Option<OwnedDeviceId> {
        self.device_id.read().unwrap().clone()
    }

    /// Whether [`prepare`](Self::prepare) completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Subscribe to out-of-band crypto events.
    pub fn subscribe_to_events(&self) -> broadcast::Receiver<CryptoEvent> {
        self.events.subscribe()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CryptoError::UninitializedCrypto)
        }
    }

    /// Bring the machine up from stored state and publish our identity.
    ///
    /// Resolves the device id (from the store, or the server on first run),
    /// creates or loads the pickle key, restores the machine's account,
    /// persists the re-pickled account and captures the encryption configs
    /// of the given rooms. Subsequent calls are cheap no-ops.
    #[instrument(skip(self, initial_room_ids), fields(user_id = %self.user_id))]
    pub async fn prepare(&self, initial_room_ids: Vec<OwnedRoomId>) -> Result<()> {
        if self.is_ready() {
            debug!("The crypto client is already prepared");
            return Ok(());
        }

        let device_id = match self.store.get_device_id().await? {
            Some(device_id) => device_id,
            None => {
                let device_id = self.transport.whoami().await?;
                self.store.set_device_id(&device_id).await?;
                debug!(device_id = %device_id, "Resolved our device id from the server");
                device_id
            }
        };

        let pickle_key = match self.store.get_pickle_key().await? {
            Some(key) => key,
            None => {
                let key = generate_pickle_key();
                self.store.set_pickle_key(&key).await?;
                key
            }
        };

        let pickled_account = self.store.get_pickled_account().await?;
        let had_account = pickled_account.is_some();

        let repickled = self
            .machine
            .initialize(MachineInitData {
                user_id: &self.user_id,
                device_id: &device_id,
                pickle_key: &pickle_key,
                pickled_account,
            })
            .await?;

        self.store.set_pickled_account(&repickled).await?;

        for room_id in &initial_room_ids {
            if self.store.get_room(room_id).await?.is_none() {
                self.capture_room_config(room_id).await?;
            }
        }

        *self.device_id.write().unwrap() = Some(device_id.clone());
        self.ready.store(true, Ordering::Release);

        // First drive cycle publishes our identity and one-time keys.
        self.driver.run().await?;

        info!(
            device_id = %device_id,
            restored = had_account,
            "The crypto client is ready"
        );

        Ok(())
    }

    /// Whether events for this room must be encrypted.
    ///
    /// Reads the stored room config first and falls back to the room state,
    /// capturing the config for the next call.
    pub async fn is_room_encrypted(&self, room_id: &RoomId) -> Result<bool> {
        if self.store.get_room(room_id).await?.is_some() {
            return Ok(true);
        }

        Ok(self.capture_room_config(room_id).await?.is_some())
    }

    async fn capture_room_config(&self, room_id: &RoomId) -> Result<Option<RoomEncryptionConfig>> {
        let Some(content) =
            self.transport.get_room_state_event(room_id, "m.room.encryption", "").await?
        else {
            return Ok(None);
        };

        match serde_json::from_value::<RoomEncryptionConfig>(content) {
            Ok(config) => {
                self.store.store_room(room_id, &config).await?;
                Ok(Some(config))
            }
            Err(error) => {
                warn!(
                    room_id = %room_id,
                    %error,
                    "The room has a malformed m.room.encryption event, treating it as unencrypted"
                );
                Ok(None)
            }
        }
    }

    /// Encrypt a room event, sharing the room key beforehand where needed.
    ///
    /// Returns the `m.room.encrypted` content to send.
    #[instrument(skip(self, content), fields(room_id = %room_id, event_type))]
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<EncryptedContent> {
        self.ensure_ready()?;

        if !self.is_room_encrypted(room_id).await? {
            return Err(CryptoError::RoomNotEncrypted(room_id.to_owned()));
        }

        let config = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| CryptoError::RoomNotEncrypted(room_id.to_owned()))?;

        self.group_sessions.prepare_encrypt(room_id, &config).await?;

        Ok(self.machine.encrypt_room_event(room_id, event_type, content).await?)
    }

    /// Decrypt an `m.room.encrypted` room event.
    ///
    /// On the first successful decryption the (session, ratchet index) pair
    /// is pinned to the event id; a later event presenting the same pair is
    /// rejected as a replay.
    #[instrument(skip(self, event), fields(room_id = %room_id))]
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &JsonValue,
    ) -> Result<DecryptedRoomEvent> {
        self.ensure_ready()?;

        let event_id = event
            .get("event_id")
            .and_then(JsonValue::as_str)
            .ok_or(CryptoError::MalformedEvent("event_id"))?;
        let event_id = EventId::parse(event_id)
            .map_err(|_| CryptoError::MalformedEvent("event_id"))?;

        let decrypted = self.machine.decrypt_room_event(room_id, event).await?;

        match self
            .store
            .get_event_for_message_index(room_id, &decrypted.session_id, decrypted.message_index)
            .await?
        {
            Some(known_event_id) if known_event_id != event_id => {
                warn!(
                    event_id = %event_id,
                    known_event_id = %known_event_id,
                    session_id = decrypted.session_id.as_str(),
                    message_index = decrypted.message_index,
                    "An event replayed an already decrypted ratchet index"
                );

                return Err(CryptoError::ReplayDetected {
                    session_id: decrypted.session_id,
                    message_index: decrypted.message_index,
                });
            }
            Some(_) => {}
            None => {
                self.store
                    .set_message_index_for_event(
                        room_id,
                        &event_id,
                        &decrypted.session_id,
                        decrypted.message_index,
                    )
                    .await?;
            }
        }

        Ok(decrypted)
    }

    /// Sign the canonical form of an object with our device's ed25519 key.
    pub async fn sign(&self, object: &JsonValue) -> Result<SignatureMap> {
        self.ensure_ready()?;

        let canonical = crate::types::canonical_signing_payload(object)?;
        Ok(self.machine.sign(&canonical).await?)
    }

    /// Feed the crypto-relevant parts of a sync response into the machine
    /// and flush the requests it produced.
    pub async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<()> {
        self.ensure_ready()?;

        if !changes.changed_devices.is_empty() {
            self.tracker.flag_users_outdated(&changes.changed_devices, false).await?;
        }

        self.driver.receive_sync_changes(changes).await
    }

    /// Run one outgoing-request drive cycle.
    pub async fn run_request_pump(&self) -> Result<()> {
        self.ensure_ready()?;
        self.driver.run().await
    }

    /// The active devices of each user, refreshing outdated device lists
    /// first.
    pub async fn get_devices_for(
        &self,
        user_ids: &[OwnedUserId],
    ) -> Result<std::collections::HashMap<OwnedUserId, Vec<DeviceKeys>>> {
        self.tracker.get_devices_for(user_ids).await
    }

    /// Flag device lists as stale, optionally refreshing them right away.
    pub async fn flag_users_outdated(&self, user_ids: &[OwnedUserId], resync: bool) -> Result<()> {
        self.tracker.flag_users_outdated(user_ids, resync).await
    }

    /// Sign and create a new backup version on the server.
    pub async fn sign_and_create_key_backup_version(
        &self,
        info: KeyBackupInfo,
    ) -> Result<String> {
        self.backups.sign_and_create_backup_version(info).await
    }

    /// Read the current backup version from the server, `None` when no
    /// backup exists.
    pub async fn get_key_backup_version(&self) -> Result<Option<KeyBackupVersion>> {
        Ok(self.transport.get_key_backup_version().await?)
    }

    /// Start uploading room keys to the given backup.
    pub async fn enable_key_backup(&self, info: &KeyBackupVersion) -> Result<()> {
        self.backups.enable_backup(info).await
    }

    /// Stop uploading room keys.
    pub async fn disable_key_backup(&self) -> Result<()> {
        self.backups.disable_backup().await
    }

    /// Upload every room key the machine hasn't backed up yet.
    pub async fn backup_room_keys(&self) -> Result<()> {
        self.backups.backup_room_keys().await
    }

    /// Export the room keys of one group session.
    pub async fn export_room_keys_for_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<JsonValue> {
        self.backups.export_room_keys_for_session(room_id, session_id).await
    }
}

fn generate_pickle_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PICKLE_KEY_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, event_id, room_id, user_id};
    use serde_json::json;

    use super::{generate_pickle_key, CryptoClient};
    use crate::{
        error::CryptoError,
        store::{CryptoStore, MemoryCryptoStore},
        testing::{encrypted_event, MockMachine, MockTransport},
    };

    fn client_with(
        store: Arc<MemoryCryptoStore>,
        machine: Arc<MockMachine>,
        transport: Arc<MockTransport>,
    ) -> CryptoClient {
        CryptoClient::new(user_id!("@bot:localhost"), store, machine, transport)
    }

    fn client() -> (CryptoClient, Arc<MemoryCryptoStore>, Arc<MockMachine>, Arc<MockTransport>) {
        let store = Arc::new(MemoryCryptoStore::new());
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        let client = client_with(store.clone(), machine.clone(), transport.clone());
        (client, store, machine, transport)
    }

    #[test]
    fn pickle_keys_are_long_and_random() {
        let first = generate_pickle_key();
        let second = generate_pickle_key();

        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn operations_fail_before_prepare() {
        let (client, ..) = client();

        let error =
            client.encrypt_room_event(room_id!("!r:x"), "m.room.message", &json!({})).await;
        assert_matches!(error, Err(CryptoError::UninitializedCrypto));
    }

    #[tokio::test]
    async fn prepare_resolves_and_persists_the_device_id() {
        let (client, store, machine, _transport) = client();

        client.prepare(vec![]).await.unwrap();

        assert!(client.is_ready());
        assert_eq!(client.device_id().as_deref(), Some(device_id!("BOTDEV")));
        assert_eq!(store.get_device_id().await.unwrap().as_deref(), Some(device_id!("BOTDEV")));
        assert!(store.get_pickle_key().await.unwrap().is_some());
        assert!(store.get_pickled_account().await.unwrap().is_some());
        assert!(machine.is_initialized());

        // A second prepare is a no-op.
        let pickled = store.get_pickled_account().await.unwrap();
        client.prepare(vec![]).await.unwrap();
        assert_eq!(store.get_pickled_account().await.unwrap(), pickled);
    }

    #[tokio::test]
    async fn prepare_prefers_the_stored_device_id() {
        let store = Arc::new(MemoryCryptoStore::new());
        store.set_device_id(device_id!("STOREDDEV")).await.unwrap();

        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("SERVERDEV")));
        let client = client_with(store, machine, transport);

        client.prepare(vec![]).await.unwrap();
        assert_eq!(client.device_id().as_deref(), Some(device_id!("STOREDDEV")));
    }

    #[tokio::test]
    async fn room_encryption_state_is_captured_from_the_server() {
        let (client, store, _machine, transport) = client();
        let room_id = room_id!("!encrypted:localhost");

        transport.set_state_event(
            room_id,
            "m.room.encryption",
            "",
            json!({ "algorithm": "m.megolm.v1.aes-sha2", "rotation_period_ms": 604800000 }),
        );

        client.prepare(vec![]).await.unwrap();

        assert!(client.is_room_encrypted(room_id).await.unwrap());
        assert!(store.get_room(room_id).await.unwrap().is_some(), "the config was captured");

        assert!(!client.is_room_encrypted(room_id!("!plain:localhost")).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_encryption_state_reads_as_unencrypted() {
        let (client, _store, _machine, transport) = client();
        let room_id = room_id!("!weird:localhost");

        transport.set_state_event(room_id, "m.room.encryption", "", json!({ "no": "algorithm" }));

        client.prepare(vec![]).await.unwrap();
        assert!(!client.is_room_encrypted(room_id).await.unwrap());
    }

    #[tokio::test]
    async fn encrypting_in_an_unencrypted_room_is_an_error() {
        let (client, ..) = client();
        client.prepare(vec![]).await.unwrap();

        let error = client
            .encrypt_room_event(room_id!("!plain:x"), "m.room.message", &json!({ "body": "hi" }))
            .await;
        assert_matches!(error, Err(CryptoError::RoomNotEncrypted(_)));
    }

    #[tokio::test]
    async fn replayed_ratchet_indices_are_rejected() {
        let (client, _store, _machine, _transport) = client();
        let room_id = room_id!("!r:x");

        client.prepare(vec![]).await.unwrap();

        let original = encrypted_event(event_id!("$original"), "session1", 3);
        let decrypted = client.decrypt_room_event(room_id, &original).await.unwrap();
        assert_eq!(decrypted.session_id, "session1");
        assert_eq!(decrypted.message_index, 3);

        // Decrypting the same event again is fine.
        client.decrypt_room_event(room_id, &original).await.unwrap();

        // A different event with the same session and index is a replay.
        let replay = encrypted_event(event_id!("$replay"), "session1", 3);
        let error = client.decrypt_room_event(room_id, &replay).await;
        assert_matches!(
            error,
            Err(CryptoError::ReplayDetected { session_id, message_index: 3 })
                if session_id == "session1"
        );

        // The same index in another session is unrelated.
        let other = encrypted_event(event_id!("$other"), "session2", 3);
        client.decrypt_room_event(room_id, &other).await.unwrap();
    }

    #[tokio::test]
    async fn sync_changes_flag_changed_users() {
        let (client, store, machine, _transport) = client();
        client.prepare(vec![]).await.unwrap();

        let changes = crate::types::SyncChanges {
            changed_devices: vec![user_id!("@ping:localhost").to_owned()],
            ..Default::default()
        };
        client.receive_sync_changes(changes).await.unwrap();

        assert!(store.is_user_outdated(user_id!("@ping:localhost")).await.unwrap());
        assert_eq!(machine.sync_changes_received(), 1);
    }
}
