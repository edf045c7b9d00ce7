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

//! Test doubles for the machine and transport collaborators.
//!
//! [`MockMachine`] is a scriptable stand-in for the opaque crypto machine:
//! it fabricates sessions, envelopes and signatures without any real
//! cryptography, while keeping the bookkeeping (request queue, tracked
//! users, backup state) observable. To make rotation-dependent flows easy to
//! drive, it rotates the outbound session on *every* room key share.
//!
//! [`TestDevice`] generates devices with real ed25519/curve25519 keys and a
//! valid self-signature, which the device tracker's validation accepts.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ruma::{
    events::room::member::MembershipState, DeviceId, DeviceKeyAlgorithm, DeviceKeyId,
    EventEncryptionAlgorithm, EventId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, RoomId, TransactionId, UserId,
};
use serde_json::{json, Value as JsonValue};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519SecretKey};

use crate::{
    machine::{
        CryptoMachine, MachineError, MachineInitData, MachineRequest, MachineRequestKind,
        OutgoingMachineRequest, RoomKeyShare, ShareTarget,
    },
    transport::{CryptoTransport, Result as TransportResult, TransportError},
    types::{
        canonical_signing_payload, DecryptedRoomEvent, DeviceKeys, EncryptedContent,
        EncryptionSettings, KeyBackupInfo, KeyBackupVersion, OutboundGroupSessionRecord,
        SignatureMap, SyncChanges,
    },
};

/// A device with real keys and a valid self-signature.
pub struct TestDevice {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    signing_key: Ed25519SecretKey,
    curve25519: Curve25519PublicKey,
}

impl std::fmt::Debug for TestDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDevice")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl TestDevice {
    /// Generate a fresh device identity.
    pub fn generate(user_id: &UserId, device_id: &DeviceId) -> Self {
        let signing_key = Ed25519SecretKey::new();
        let curve25519 = Curve25519PublicKey::from(&Curve25519SecretKey::new());

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            signing_key,
            curve25519,
        }
    }

    /// The device's `/keys/query` record, self-signed.
    pub fn signed_json(&self) -> JsonValue {
        let mut device = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                (format!("ed25519:{}", self.device_id)):
                    self.signing_key.public_key().to_base64(),
                (format!("curve25519:{}", self.device_id)): self.curve25519.to_base64(),
            },
        });

        let canonical = canonical_signing_payload(&device)
            .expect("a test device always canonicalizes");
        let signature = self.signing_key.sign(canonical.as_bytes());

        device["signatures"] = json!({
            (self.user_id.as_str()): {
                (format!("ed25519:{}", self.device_id)): signature.to_base64(),
            }
        });

        device
    }

    /// The device parsed into [`DeviceKeys`].
    pub fn device_keys(&self) -> DeviceKeys {
        serde_json::from_value(self.signed_json()).expect("a test device always deserializes")
    }
}

/// A fabricated `m.room.encrypted` event in the [`MockMachine`]'s format.
pub fn encrypted_event(event_id: &EventId, session_id: &str, message_index: u32) -> JsonValue {
    json!({
        "event_id": event_id,
        "type": "m.room.encrypted",
        "sender": "@someone:localhost",
        "content": {
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": "mock_sender_key",
            "device_id": "MOCKDEV",
            "session_id": session_id,
            "message_index": message_index,
            "ciphertext": STANDARD.encode(
                json!({ "type": "m.room.message", "content": { "body": "cleartext" } })
                    .to_string()
            ),
        }
    })
}

#[derive(Debug)]
struct MockSession {
    session_id: String,
    message_index: u32,
}

/// A scriptable [`CryptoMachine`].
#[derive(Debug)]
pub struct MockMachine {
    user_id: OwnedUserId,
    device_id: StdMutex<OwnedDeviceId>,
    initialized: AtomicBool,
    queued: StdMutex<Vec<OutgoingMachineRequest>>,
    sent: StdMutex<Vec<(OwnedTransactionId, MachineRequestKind, JsonValue)>>,
    tracked: StdMutex<BTreeSet<OwnedUserId>>,
    claimed: StdMutex<BTreeSet<OwnedUserId>>,
    sessions: StdMutex<HashMap<OwnedRoomId, MockSession>>,
    session_counter: AtomicU64,
    unbacked: StdMutex<Vec<(OwnedRoomId, String)>>,
    backup: StdMutex<Option<(String, String)>>,
    share_calls: AtomicU64,
    last_share_users: StdMutex<Vec<OwnedUserId>>,
    last_share_targets: StdMutex<Vec<ShareTarget>>,
    sync_changes: AtomicU64,
}

impl MockMachine {
    pub fn new(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: StdMutex::new("MOCKDEV".into()),
            initialized: AtomicBool::new(false),
            queued: StdMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
            tracked: StdMutex::new(BTreeSet::new()),
            claimed: StdMutex::new(BTreeSet::new()),
            sessions: StdMutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            unbacked: StdMutex::new(Vec::new()),
            backup: StdMutex::new(None),
            share_calls: AtomicU64::new(0),
            last_share_users: StdMutex::new(Vec::new()),
            last_share_targets: StdMutex::new(Vec::new()),
            sync_changes: AtomicU64::new(0),
        }
    }

    /// Queue a request for the next [`outgoing_requests`] snapshot.
    ///
    /// [`outgoing_requests`]: CryptoMachine::outgoing_requests
    pub fn queue_request(&self, request: OutgoingMachineRequest) {
        self.queued.lock().unwrap().push(request);
    }

    /// Every `(request id, kind, response)` marked as sent, in order.
    pub fn sent_requests(&self) -> Vec<(OwnedTransactionId, MachineRequestKind, JsonValue)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn tracked_users(&self) -> BTreeSet<OwnedUserId> {
        self.tracked.lock().unwrap().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn share_call_count(&self) -> u64 {
        self.share_calls.load(Ordering::Acquire)
    }

    pub fn last_share_users(&self) -> Vec<OwnedUserId> {
        self.last_share_users.lock().unwrap().clone()
    }

    pub fn last_share_targets(&self) -> Vec<ShareTarget> {
        self.last_share_targets.lock().unwrap().clone()
    }

    pub fn current_session_id(&self, room_id: &RoomId) -> Option<String> {
        self.sessions.lock().unwrap().get(room_id).map(|s| s.session_id.clone())
    }

    /// Pretend the machine holds a room key that was never backed up.
    pub fn add_unbacked_session(&self, room_id: &RoomId, session_id: &str) {
        self.unbacked.lock().unwrap().push((room_id.to_owned(), session_id.to_owned()));
    }

    pub fn backup_enabled(&self) -> bool {
        self.backup.lock().unwrap().is_some()
    }

    pub fn sync_changes_received(&self) -> u64 {
        self.sync_changes.load(Ordering::Acquire)
    }

    fn device_id(&self) -> OwnedDeviceId {
        self.device_id.lock().unwrap().clone()
    }
}

#[async_trait]
impl CryptoMachine for MockMachine {
    async fn initialize(&self, data: MachineInitData<'_>) -> Result<String, MachineError> {
        *self.device_id.lock().unwrap() = data.device_id.to_owned();
        self.initialized.store(true, Ordering::Release);

        Ok(data.pickled_account.unwrap_or_else(|| {
            format!("pickled_account:{}:{}", data.user_id, data.device_id)
        }))
    }

    async fn outgoing_requests(&self) -> Result<Vec<OutgoingMachineRequest>, MachineError> {
        Ok(self.queued.lock().unwrap().clone())
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        kind: MachineRequestKind,
        response: &JsonValue,
    ) -> Result<(), MachineError> {
        self.queued.lock().unwrap().retain(|r| r.request_id != request_id);
        self.sent.lock().unwrap().push((request_id.to_owned(), kind, response.clone()));
        Ok(())
    }

    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), MachineError> {
        self.tracked.lock().unwrap().extend(users.iter().cloned());
        Ok(())
    }

    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingMachineRequest>, MachineError> {
        let mut claimed = self.claimed.lock().unwrap();
        let missing: Vec<_> = users.iter().filter(|u| !claimed.contains(*u)).cloned().collect();

        if missing.is_empty() {
            return Ok(None);
        }

        claimed.extend(missing.iter().cloned());

        let one_time_keys: serde_json::Map<String, JsonValue> = missing
            .iter()
            .map(|u| (u.to_string(), json!({ "MOCKDEV": "signed_curve25519" })))
            .collect();

        Ok(Some(OutgoingMachineRequest {
            request_id: TransactionId::new(),
            request: MachineRequest::KeysClaim { body: json!({ "one_time_keys": one_time_keys }) },
        }))
    }

    async fn receive_sync_changes(&self, _changes: SyncChanges) -> Result<(), MachineError> {
        self.sync_changes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        _settings: EncryptionSettings,
    ) -> Result<RoomKeyShare, MachineError> {
        self.share_calls.fetch_add(1, Ordering::AcqRel);

        let n = self.session_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let session_id = format!("session{n}");

        self.sessions
            .lock()
            .unwrap()
            .insert(room_id.to_owned(), MockSession { session_id: session_id.clone(), message_index: 0 });
        self.unbacked.lock().unwrap().push((room_id.to_owned(), session_id.clone()));

        let shared_with: Vec<ShareTarget> = users
            .iter()
            .map(|user_id| ShareTarget {
                user_id: user_id.clone(),
                device_id: format!("{}_DEVICE", user_id.localpart().to_uppercase()).into(),
            })
            .collect();

        let txn_id = TransactionId::new();
        let messages: serde_json::Map<String, JsonValue> = shared_with
            .iter()
            .map(|target| {
                (
                    target.user_id.to_string(),
                    json!({
                        (target.device_id.as_str()): {
                            "algorithm": "m.olm.v1.curve25519-aes-sha2",
                            "session_id": session_id,
                        }
                    }),
                )
            })
            .collect();

        let requests = vec![OutgoingMachineRequest {
            request_id: txn_id.clone(),
            request: MachineRequest::ToDevice {
                event_type: "m.room.encrypted".to_owned(),
                txn_id,
                messages: JsonValue::Object(messages),
            },
        }];

        *self.last_share_users.lock().unwrap() = users.to_vec();
        *self.last_share_targets.lock().unwrap() = shared_with.clone();

        Ok(RoomKeyShare {
            session: OutboundGroupSessionRecord {
                session_id: session_id.clone(),
                room_id: room_id.to_owned(),
                pickled: format!("pickled_session:{session_id}"),
                is_current: true,
                uses_left: Some(100),
                expires_ts: Some(2_000_000_000_000),
            },
            message_index: 0,
            shared_with,
            requests,
        })
    }

    async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<EncryptedContent, MachineError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(room_id)
            .ok_or_else(|| MachineError::Operation("no outbound session for the room".to_owned()))?;

        session.message_index += 1;

        let plaintext = json!({ "type": event_type, "content": content }).to_string();

        Ok(EncryptedContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            sender_key: "mock_sender_key".to_owned(),
            ciphertext: STANDARD.encode(plaintext),
            session_id: session.session_id.clone(),
            device_id: self.device_id(),
        })
    }

    async fn decrypt_room_event(
        &self,
        _room_id: &RoomId,
        event: &JsonValue,
    ) -> Result<DecryptedRoomEvent, MachineError> {
        let content = event
            .get("content")
            .ok_or_else(|| MachineError::Operation("the event has no content".to_owned()))?;

        let session_id = content
            .get("session_id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| MachineError::Operation("the event has no session_id".to_owned()))?
            .to_owned();

        let message_index =
            content.get("message_index").and_then(JsonValue::as_u64).unwrap_or(0) as u32;

        let cleartext = content
            .get("ciphertext")
            .and_then(JsonValue::as_str)
            .and_then(|c| STANDARD.decode(c).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(|| json!({ "type": "m.room.message", "content": {} }));

        Ok(DecryptedRoomEvent { session_id, message_index, cleartext })
    }

    async fn enable_backup_v1(
        &self,
        public_key: &str,
        version: &str,
    ) -> Result<(), MachineError> {
        *self.backup.lock().unwrap() = Some((public_key.to_owned(), version.to_owned()));
        Ok(())
    }

    async fn disable_backup(&self) -> Result<(), MachineError> {
        self.backup.lock().unwrap().take();
        Ok(())
    }

    async fn backup_room_keys(&self) -> Result<Option<OutgoingMachineRequest>, MachineError> {
        let Some((_, version)) = self.backup.lock().unwrap().clone() else {
            return Ok(None);
        };

        let pending = std::mem::take(&mut *self.unbacked.lock().unwrap());
        if pending.is_empty() {
            return Ok(None);
        }

        let mut rooms: serde_json::Map<String, JsonValue> = serde_json::Map::new();
        for (room_id, session_id) in pending {
            let room = rooms
                .entry(room_id.to_string())
                .or_insert_with(|| json!({ "sessions": {} }));
            room["sessions"][&session_id] = json!({
                "first_message_index": 0,
                "forwarded_count": 0,
                "is_verified": false,
                "session_data": { "ciphertext": STANDARD.encode(session_id.as_bytes()) },
            });
        }

        Ok(Some(OutgoingMachineRequest {
            request_id: TransactionId::new(),
            request: MachineRequest::KeysBackup {
                version,
                rooms: json!({ "rooms": rooms }),
            },
        }))
    }

    async fn export_room_keys_for_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<String, MachineError> {
        let export = json!([{
            "algorithm": "m.megolm.v1.aes-sha2",
            "room_id": room_id,
            "session_id": session_id,
            "session_key": format!("exported_key:{session_id}"),
            "sender_key": "mock_sender_key",
            "sender_claimed_keys": {},
            "forwarding_curve25519_key_chain": [],
        }]);

        Ok(export.to_string())
    }

    async fn sign(&self, message: &str) -> Result<SignatureMap, MachineError> {
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id());
        let signature = format!("mock_signature:{:08x}", message.len());

        let mut signatures = SignatureMap::new();
        signatures.insert(self.user_id.clone(), BTreeMap::from([(key_id, signature)]));

        Ok(signatures)
    }
}

/// What a [`MockTransport`] saw, in call order.
#[derive(Clone, Debug)]
pub enum RecordedRequest {
    KeysUpload(JsonValue),
    KeysQuery(JsonValue),
    KeysClaim(JsonValue),
    ToDevice { event_type: String, messages: JsonValue },
    CreateBackupVersion(JsonValue),
    PutRoomKeys { version: String, rooms: JsonValue },
}

/// A scriptable [`CryptoTransport`] that records every request.
#[derive(Debug)]
pub struct MockTransport {
    device_id: OwnedDeviceId,
    recorded: StdMutex<Vec<RecordedRequest>>,
    keys_query_response: StdMutex<JsonValue>,
    fail_keys_query: AtomicBool,
    fail_put_room_keys: AtomicBool,
    fail_invite_members: AtomicBool,
    members: StdMutex<HashMap<(OwnedRoomId, String), Vec<OwnedUserId>>>,
    state_events: StdMutex<HashMap<(OwnedRoomId, String, String), JsonValue>>,
    backup: StdMutex<Option<KeyBackupVersion>>,
    version_counter: AtomicU64,
    etag_counter: AtomicU64,
}

impl MockTransport {
    pub fn new(device_id: &DeviceId) -> Self {
        Self {
            device_id: device_id.to_owned(),
            recorded: StdMutex::new(Vec::new()),
            keys_query_response: StdMutex::new(json!({ "device_keys": {} })),
            fail_keys_query: AtomicBool::new(false),
            fail_put_room_keys: AtomicBool::new(false),
            fail_invite_members: AtomicBool::new(false),
            members: StdMutex::new(HashMap::new()),
            state_events: StdMutex::new(HashMap::new()),
            backup: StdMutex::new(None),
            version_counter: AtomicU64::new(0),
            etag_counter: AtomicU64::new(0),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn set_keys_query_response(&self, response: JsonValue) {
        *self.keys_query_response.lock().unwrap() = response;
    }

    pub fn fail_keys_query(&self, fail: bool) {
        self.fail_keys_query.store(fail, Ordering::Release);
    }

    pub fn fail_put_room_keys(&self, fail: bool) {
        self.fail_put_room_keys.store(fail, Ordering::Release);
    }

    pub fn fail_invite_members(&self, fail: bool) {
        self.fail_invite_members.store(fail, Ordering::Release);
    }

    pub fn add_members(&self, room_id: &RoomId, membership: &str, users: &[&UserId]) {
        self.members
            .lock()
            .unwrap()
            .entry((room_id.to_owned(), membership.to_owned()))
            .or_default()
            .extend(users.iter().map(|u| (*u).to_owned()));
    }

    pub fn set_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) {
        self.state_events
            .lock()
            .unwrap()
            .insert((room_id.to_owned(), event_type.to_owned(), state_key.to_owned()), content);
    }

    /// The backup version the mock server currently holds.
    pub fn backup_version(&self) -> Option<KeyBackupVersion> {
        self.backup.lock().unwrap().clone()
    }

    fn record(&self, request: RecordedRequest) {
        self.recorded.lock().unwrap().push(request);
    }
}

#[async_trait]
impl CryptoTransport for MockTransport {
    async fn whoami(&self) -> TransportResult<OwnedDeviceId> {
        Ok(self.device_id.clone())
    }

    async fn keys_upload(&self, body: &JsonValue) -> TransportResult<JsonValue> {
        self.record(RecordedRequest::KeysUpload(body.clone()));
        Ok(json!({ "one_time_key_counts": { "signed_curve25519": 50 } }))
    }

    async fn keys_query(&self, body: &JsonValue) -> TransportResult<JsonValue> {
        if self.fail_keys_query.load(Ordering::Acquire) {
            return Err(TransportError::Connection("the mock transport is offline".to_owned()));
        }

        self.record(RecordedRequest::KeysQuery(body.clone()));
        Ok(self.keys_query_response.lock().unwrap().clone())
    }

    async fn keys_claim(&self, body: &JsonValue) -> TransportResult<JsonValue> {
        self.record(RecordedRequest::KeysClaim(body.clone()));
        Ok(json!({ "one_time_keys": {} }))
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        _txn_id: &TransactionId,
        messages: &JsonValue,
    ) -> TransportResult<JsonValue> {
        self.record(RecordedRequest::ToDevice {
            event_type: event_type.to_owned(),
            messages: messages.clone(),
        });
        Ok(json!({}))
    }

    async fn get_key_backup_version(&self) -> TransportResult<Option<KeyBackupVersion>> {
        Ok(self.backup.lock().unwrap().clone())
    }

    async fn create_key_backup_version(&self, info: &KeyBackupInfo) -> TransportResult<String> {
        self.record(RecordedRequest::CreateBackupVersion(serde_json::to_value(info)?));

        let version = (self.version_counter.fetch_add(1, Ordering::AcqRel) + 1).to_string();

        *self.backup.lock().unwrap() = Some(KeyBackupVersion {
            algorithm: info.algorithm.clone(),
            auth_data: info.auth_data.clone(),
            count: 0,
            etag: "etag0".to_owned(),
            version: version.clone(),
        });

        Ok(version)
    }

    async fn put_room_keys(&self, version: &str, rooms: &JsonValue) -> TransportResult<JsonValue> {
        if self.fail_put_room_keys.load(Ordering::Acquire) {
            return Err(TransportError::Connection("the mock transport is offline".to_owned()));
        }

        self.record(RecordedRequest::PutRoomKeys {
            version: version.to_owned(),
            rooms: rooms.clone(),
        });

        let uploaded: u64 = rooms
            .get("rooms")
            .and_then(JsonValue::as_object)
            .map(|rooms| {
                rooms
                    .values()
                    .filter_map(|r| r.get("sessions").and_then(JsonValue::as_object))
                    .map(|s| s.len() as u64)
                    .sum()
            })
            .unwrap_or(0);

        let etag = format!("etag{}", self.etag_counter.fetch_add(1, Ordering::AcqRel) + 1);

        let mut backup = self.backup.lock().unwrap();
        let (count, etag) = match backup.as_mut() {
            Some(backup) => {
                backup.count += uploaded;
                backup.etag = etag.clone();
                (backup.count, etag)
            }
            None => (uploaded, etag),
        };

        Ok(json!({ "count": count, "etag": etag }))
    }

    async fn get_room_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> TransportResult<Option<JsonValue>> {
        Ok(self
            .state_events
            .lock()
            .unwrap()
            .get(&(room_id.to_owned(), event_type.to_owned(), state_key.to_owned()))
            .cloned())
    }

    async fn get_room_members(
        &self,
        room_id: &RoomId,
        memberships: &[MembershipState],
    ) -> TransportResult<Vec<OwnedUserId>> {
        if self.fail_invite_members.load(Ordering::Acquire)
            && memberships.contains(&MembershipState::Invite)
        {
            return Err(TransportError::Connection("the mock transport is offline".to_owned()));
        }

        let members = self.members.lock().unwrap();
        let mut found = Vec::new();

        for membership in memberships {
            if let Some(users) = members.get(&(room_id.to_owned(), membership.to_string())) {
                found.extend(users.iter().cloned());
            }
        }

        Ok(found)
    }
}
