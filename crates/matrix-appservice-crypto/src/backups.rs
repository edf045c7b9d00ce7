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

//! Server-side room-key backup lifecycle.
//!
//! Creating, enabling and disabling a backup version, and draining the
//! machine's not-yet-backed-up room keys to the server. Every public
//! operation enqueues on one serial waiter, so backup calls complete in the
//! order they were made.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock as StdRwLock,
};

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::{CryptoError, Result},
    events::{CryptoEvent, CryptoEvents},
    machine::{CryptoMachine, MachineRequest, MachineRequestKind},
    transport::CryptoTransport,
    types::{
        canonical_signing_payload, BackupAuthData, KeyBackupInfo, KeyBackupVersion,
        MEGOLM_BACKUP_V1,
    },
};

/// Drives the server-side room-key backup.
pub struct BackupManager {
    machine: Arc<dyn CryptoMachine>,
    transport: Arc<dyn CryptoTransport>,
    events: CryptoEvents,
    /// Shared with the driver; taken around `mark_request_as_sent`.
    sync_lock: Arc<Mutex<()>>,
    /// The serial waiter all public operations enqueue on.
    waiter: Mutex<()>,
    /// Set once the crypto client finished preparing.
    ready: Arc<AtomicBool>,
    /// The version backups are currently uploaded to, if enabled.
    enabled_version: StdRwLock<Option<String>>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("enabled_version", &self.enabled_version)
            .finish()
    }
}

impl BackupManager {
    pub(crate) fn new(
        machine: Arc<dyn CryptoMachine>,
        transport: Arc<dyn CryptoTransport>,
        events: CryptoEvents,
        sync_lock: Arc<Mutex<()>>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            machine,
            transport,
            events,
            sync_lock,
            waiter: Mutex::new(()),
            ready,
            enabled_version: StdRwLock::new(None),
        }
    }

    /// Whether room keys are currently being backed up.
    pub fn is_enabled(&self) -> bool {
        self.enabled_version.read().unwrap().is_some()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CryptoError::UninitializedCrypto)
        }
    }

    /// Sign the backup's auth data with our device key and create the backup
    /// version on the server.
    ///
    /// Returns the server-assigned version.
    pub async fn sign_and_create_backup_version(&self, info: KeyBackupInfo) -> Result<String> {
        let _waiter = self.waiter.lock().await;
        self.ensure_ready()?;

        let mut info = info;
        let canonical = canonical_signing_payload(&info.auth_data)?;
        let signatures = self.machine.sign(&canonical).await?;

        let auth_data = info
            .auth_data
            .as_object_mut()
            .ok_or(CryptoError::InvalidBackupInfo("auth_data is not an object"))?;
        let signature_map = auth_data
            .entry("signatures".to_owned())
            .or_insert_with(|| JsonValue::Object(Default::default()))
            .as_object_mut()
            .ok_or(CryptoError::InvalidBackupInfo("signatures is not an object"))?;

        for (user_id, signatures) in signatures {
            let user_map = signature_map
                .entry(user_id.to_string())
                .or_insert_with(|| JsonValue::Object(Default::default()))
                .as_object_mut()
                .ok_or(CryptoError::InvalidBackupInfo("signatures is not an object"))?;

            for (key_id, signature) in signatures {
                user_map.insert(key_id.to_string(), JsonValue::String(signature));
            }
        }

        let version = self.transport.create_key_backup_version(&info).await?;

        info!(version = %version, "Created a new key backup version");

        Ok(version)
    }

    /// Start uploading room keys to the given backup.
    ///
    /// An already enabled backup is disabled first. Only
    /// `m.megolm_backup.v1.curve25519-aes-sha2` backups are supported.
    /// Enabling immediately drains the keys the machine has queued.
    #[instrument(skip(self, info), fields(version = %info.version))]
    pub async fn enable_backup(&self, info: &KeyBackupVersion) -> Result<()> {
        let _waiter = self.waiter.lock().await;
        self.ensure_ready()?;

        if self.is_enabled() {
            debug!("A backup is already enabled, disabling it first");
            self.disable_locked().await?;
        }

        if info.algorithm != MEGOLM_BACKUP_V1 {
            return Err(CryptoError::UnsupportedBackupAlgorithm(info.algorithm.clone()));
        }

        let auth_data: BackupAuthData = serde_json::from_value(info.auth_data.clone())
            .map_err(|_| CryptoError::InvalidBackupInfo("auth_data has no public_key"))?;

        self.machine.enable_backup_v1(&auth_data.public_key, &info.version).await?;
        *self.enabled_version.write().unwrap() = Some(info.version.clone());

        info!("Enabled key backups");

        self.drain_locked().await
    }

    /// Stop backing up room keys.
    pub async fn disable_backup(&self) -> Result<()> {
        let _waiter = self.waiter.lock().await;
        self.ensure_ready()?;
        self.disable_locked().await
    }

    async fn disable_locked(&self) -> Result<()> {
        self.machine.disable_backup().await?;
        *self.enabled_version.write().unwrap() = None;

        info!("Disabled key backups");

        Ok(())
    }

    /// Upload every room key the machine hasn't backed up yet, one batch at
    /// a time, until the machine reports there is nothing left.
    ///
    /// A failed upload emits [`CryptoEvent::BackupFailed`] and stops the
    /// drain; nothing retries until the next explicit call.
    pub async fn backup_room_keys(&self) -> Result<()> {
        let _waiter = self.waiter.lock().await;
        self.ensure_ready()?;

        if !self.is_enabled() {
            return Err(CryptoError::BackupNotEnabled);
        }

        self.drain_locked().await
    }

    async fn drain_locked(&self) -> Result<()> {
        loop {
            let Some(request) = self.machine.backup_room_keys().await? else {
                trace!("No more room keys to back up");
                return Ok(());
            };

            let MachineRequest::KeysBackup { version, rooms } = request.request else {
                return Err(CryptoError::UnsupportedRequestType(request.request.kind()));
            };

            match self.transport.put_room_keys(&version, &rooms).await {
                Ok(response) => {
                    let _sync = self.sync_lock.lock().await;
                    self.machine
                        .mark_request_as_sent(
                            &request.request_id,
                            MachineRequestKind::KeysBackup,
                            &response,
                        )
                        .await?;
                }
                Err(error) => {
                    warn!(%error, "Failed to upload a room key batch, stopping the backup drain");
                    self.events.emit(CryptoEvent::BackupFailed { error: error.to_string() });
                    return Ok(());
                }
            }
        }
    }

    /// Export the room keys of a single group session, parsed from the
    /// machine's JSON export format.
    pub async fn export_room_keys_for_session(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
    ) -> Result<JsonValue> {
        let _waiter = self.waiter.lock().await;
        self.ensure_ready()?;

        let export = self.machine.export_room_keys_for_session(room_id, session_id).await?;

        Ok(serde_json::from_str(&export)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::BackupManager;
    use crate::{
        error::CryptoError,
        events::CryptoEvents,
        machine::CryptoMachine,
        testing::{MockMachine, MockTransport, RecordedRequest},
        types::{KeyBackupInfo, KeyBackupVersion, MEGOLM_BACKUP_V1},
    };

    fn backup_manager(
        machine: Arc<MockMachine>,
        transport: Arc<MockTransport>,
    ) -> BackupManager {
        let ready = Arc::new(AtomicBool::new(true));
        BackupManager::new(
            machine,
            transport,
            CryptoEvents::new(),
            Arc::new(Mutex::new(())),
            ready,
        )
    }

    fn backup_info() -> KeyBackupInfo {
        KeyBackupInfo {
            algorithm: MEGOLM_BACKUP_V1.to_owned(),
            auth_data: json!({ "public_key": "backup_public_key" }),
        }
    }

    #[tokio::test]
    async fn creating_a_version_signs_the_auth_data() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let backups = backup_manager(machine, transport.clone());
        let version = backups.sign_and_create_backup_version(backup_info()).await.unwrap();
        assert_eq!(version, "1");

        let stored = transport.backup_version().unwrap();
        assert_eq!(stored.version, "1");
        assert_eq!(stored.count, 0);
        assert_eq!(stored.etag, "etag0");

        let signatures = &stored.auth_data["signatures"]["@bot:localhost"];
        let signature = signatures["ed25519:MOCKDEV"].as_str().unwrap();
        assert!(!signature.is_empty());
    }

    #[tokio::test]
    async fn operations_require_a_prepared_machine() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let backups = BackupManager::new(
            machine,
            transport,
            CryptoEvents::new(),
            Arc::new(Mutex::new(())),
            Arc::new(AtomicBool::new(false)),
        );

        let error = backups.sign_and_create_backup_version(backup_info()).await.unwrap_err();
        assert_matches!(error, CryptoError::UninitializedCrypto);
    }

    #[tokio::test]
    async fn unsupported_algorithms_are_rejected() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let backups = backup_manager(machine, transport);

        let info = KeyBackupVersion {
            algorithm: "m.megolm_backup.v2".to_owned(),
            auth_data: json!({ "public_key": "backup_public_key" }),
            count: 0,
            etag: "etag0".to_owned(),
            version: "1".to_owned(),
        };

        let error = backups.enable_backup(&info).await.unwrap_err();
        assert_matches!(error, CryptoError::UnsupportedBackupAlgorithm(a) if a == "m.megolm_backup.v2");
        assert!(!backups.is_enabled());
    }

    #[tokio::test]
    async fn draining_requires_an_enabled_backup() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let backups = backup_manager(machine, transport);

        let error = backups.backup_room_keys().await.unwrap_err();
        assert_matches!(error, CryptoError::BackupNotEnabled);
    }

    #[tokio::test]
    async fn enabling_drains_queued_room_keys() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        // A room key the machine created before the backup existed.
        machine.add_unbacked_session(room_id!("!r:x"), "session1");

        let backups = backup_manager(machine.clone(), transport.clone());

        let version = KeyBackupVersion {
            algorithm: MEGOLM_BACKUP_V1.to_owned(),
            auth_data: json!({ "public_key": "backup_public_key" }),
            count: 0,
            etag: "etag0".to_owned(),
            version: "1".to_owned(),
        };

        backups.enable_backup(&version).await.unwrap();
        assert!(backups.is_enabled());

        let puts: Vec<_> = transport
            .recorded()
            .into_iter()
            .filter_map(|r| match r {
                RecordedRequest::PutRoomKeys { version, rooms } => Some((version, rooms)),
                _ => None,
            })
            .collect();

        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "1");
        assert!(puts[0].1["rooms"]["!r:x"]["sessions"]["session1"].is_object());

        assert_eq!(transport.backup_version().unwrap().count, 1);

        // Nothing left: another drain uploads nothing.
        backups.backup_room_keys().await.unwrap();
        assert_eq!(
            transport
                .recorded()
                .iter()
                .filter(|r| matches!(r, RecordedRequest::PutRoomKeys { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_uploads_stop_the_drain_and_emit_an_event() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        machine.add_unbacked_session(room_id!("!r:x"), "session1");

        let events = CryptoEvents::new();
        let mut failures = events.subscribe();

        let backups = BackupManager::new(
            machine.clone(),
            transport.clone(),
            events,
            Arc::new(Mutex::new(())),
            Arc::new(AtomicBool::new(true)),
        );

        let version = KeyBackupVersion {
            algorithm: MEGOLM_BACKUP_V1.to_owned(),
            auth_data: json!({ "public_key": "backup_public_key" }),
            count: 0,
            etag: "etag0".to_owned(),
            version: "1".to_owned(),
        };

        transport.fail_put_room_keys(true);
        backups.enable_backup(&version).await.expect("upload failures are swallowed");

        assert!(failures.try_recv().is_ok());
        assert!(machine.sent_requests().is_empty(), "the batch was not marked as sent");
    }

    #[tokio::test]
    async fn disabling_forgets_the_version() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let backups = backup_manager(machine.clone(), transport);

        let version = KeyBackupVersion {
            algorithm: MEGOLM_BACKUP_V1.to_owned(),
            auth_data: json!({ "public_key": "backup_public_key" }),
            count: 0,
            etag: "etag0".to_owned(),
            version: "1".to_owned(),
        };

        backups.enable_backup(&version).await.unwrap();
        backups.disable_backup().await.unwrap();

        assert!(!backups.is_enabled());
        assert!(!machine.backup_enabled());
    }

    #[tokio::test]
    async fn exports_parse_the_machine_output() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        machine
            .share_room_key(
                room_id!("!r:x"),
                &[user_id!("@ping:localhost").to_owned()],
                Default::default(),
            )
            .await
            .unwrap();

        let backups = backup_manager(machine.clone(), transport);

        let session_id = machine.current_session_id(room_id!("!r:x")).unwrap();
        let export = backups
            .export_room_keys_for_session(room_id!("!r:x"), &session_id)
            .await
            .unwrap();

        let export = export.as_array().expect("the export is a JSON array");
        assert_eq!(export.len(), 1);
        assert_eq!(export[0]["room_id"], "!r:x");
        assert_eq!(export[0]["session_id"], session_id.as_str());
        assert!(!export[0]["session_key"].as_str().unwrap().is_empty());
    }
}
