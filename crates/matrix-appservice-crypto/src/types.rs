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

//! Shared data types of the encryption subsystem.

use std::{collections::BTreeMap, time::Duration};

use ruma::{
    events::room::history_visibility::HistoryVisibility, CanonicalJsonValue, DeviceKeyAlgorithm,
    DeviceKeyId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedDeviceKeyId, OwnedRoomId,
    OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The only backup algorithm this client knows how to drive.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// The signature map produced when this device signs an object.
pub type SignatureMap = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>;

/// The public identity of a single device, as uploaded to `/keys/upload` and
/// returned by `/keys/query`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The id of the user the device belongs to.
    pub user_id: OwnedUserId,
    /// The unique id of the device.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: SignatureMap,
    /// Server- and client-added data that isn't covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,
}

impl DeviceKeys {
    /// The base64 ed25519 identity key of the device, if present.
    pub fn ed25519_key(&self) -> Option<&str> {
        self.key(DeviceKeyAlgorithm::Ed25519)
    }

    /// The base64 curve25519 key-exchange key of the device, if present.
    pub fn curve25519_key(&self) -> Option<&str> {
        self.key(DeviceKeyAlgorithm::Curve25519)
    }

    fn key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        let key_id = DeviceKeyId::from_parts(algorithm, &self.device_id);
        self.keys.get(&key_id).map(String::as_str)
    }

    /// The self-signature of the device, an ed25519 signature over the
    /// canonical form of this object minus `signatures` and `unsigned`.
    pub fn self_signature(&self) -> Option<&str> {
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);
        self.signatures.get(&self.user_id).and_then(|s| s.get(&key_id)).map(String::as_str)
    }

    /// Whether the store considers this device active, read from the
    /// `unsigned` annotation added by
    /// [`CryptoStore::get_all_user_devices`](crate::store::CryptoStore::get_all_user_devices).
    pub fn is_active(&self) -> bool {
        self.unsigned.extra.get("active").and_then(JsonValue::as_bool).unwrap_or(true)
    }
}

/// The unsigned portion of a device's public identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The human-readable name the owner gave the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
    /// Any further unsigned data; the store uses this for the `active` flag.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl UnsignedDeviceInfo {
    fn is_empty(&self) -> bool {
        self.device_display_name.is_none() && self.extra.is_empty()
    }
}

/// The content of a room's `m.room.encryption` state event, persisted per
/// room so encryption can be driven without re-fetching state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomEncryptionConfig {
    /// The algorithm the room uses for message encryption.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long a group session may be used, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages a group session may encrypt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
    /// The room's history visibility at the time the config was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_visibility: Option<HistoryVisibility>,
}

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings handed to the crypto machine when a group session is created.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// The history visibility of the room when the session was created.
    pub history_visibility: HistoryVisibility,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            history_visibility: HistoryVisibility::Shared,
        }
    }
}

impl EncryptionSettings {
    /// Create new encryption settings from a stored room config and a history
    /// visibility.
    pub fn new(config: &RoomEncryptionConfig, history_visibility: HistoryVisibility) -> Self {
        let rotation_period =
            config.rotation_period_ms.map_or(ROTATION_PERIOD, Duration::from_millis);
        let rotation_period_msgs = config.rotation_period_msgs.unwrap_or(ROTATION_MESSAGES);

        Self {
            algorithm: config.algorithm.clone(),
            rotation_period,
            rotation_period_msgs,
            history_visibility,
        }
    }
}

/// A stored outbound group session.
///
/// The pickle is opaque to us; rotation bookkeeping lives in the store so the
/// current session survives restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundGroupSessionRecord {
    /// The unique id of the session.
    pub session_id: String,
    /// The room the session encrypts for.
    pub room_id: OwnedRoomId,
    /// The pickled session, opaque to everything but the machine.
    pub pickled: String,
    /// Whether this is the session new messages are encrypted with. At most
    /// one session per room carries the flag.
    pub is_current: bool,
    /// How many more messages the session may encrypt before rotation.
    pub uses_left: Option<i64>,
    /// Unix millisecond timestamp after which the session must rotate.
    pub expires_ts: Option<i64>,
}

/// A stored pairwise Olm session with a single peer device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OlmSessionRecord {
    /// The unique id of the session.
    pub session_id: String,
    /// The pickled session.
    pub pickled: String,
    /// Unix millisecond timestamp of the last successful decryption, used to
    /// pick the current session among several.
    pub last_decryption_ts: i64,
}

/// A stored inbound group session, keyed by its sender and room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    /// The unique id of the session.
    pub session_id: String,
    /// The room the session decrypts for.
    pub room_id: OwnedRoomId,
    /// The user that created the session.
    pub sender_user_id: OwnedUserId,
    /// The device that created the session.
    pub sender_device_id: OwnedDeviceId,
    /// The pickled session.
    pub pickled: String,
}

/// A sent-session ledger entry: which ratchet index of which outbound session
/// a given peer device has received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SentRoomKeyRecord {
    /// The id of the shared session.
    pub session_id: String,
    /// The ratchet index the recipient can decrypt from.
    pub session_index: u32,
}

/// The encrypted envelope of a room event, ready to be sent as
/// `m.room.encrypted` content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedContent {
    /// The algorithm that produced the ciphertext.
    pub algorithm: EventEncryptionAlgorithm,
    /// The curve25519 key of the sending device.
    pub sender_key: String,
    /// The megolm ciphertext.
    pub ciphertext: String,
    /// The id of the group session that encrypted the event.
    pub session_id: String,
    /// The id of the sending device.
    pub device_id: OwnedDeviceId,
}

/// The result of decrypting a room event.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedRoomEvent {
    /// The id of the group session the event was encrypted with.
    pub session_id: String,
    /// The ratchet index the event was encrypted at.
    pub message_index: u32,
    /// The decrypted event, `{ "type": ..., "content": ... }`.
    pub cleartext: JsonValue,
}

/// A key backup as created on, or fetched from, the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupVersion {
    /// The backup algorithm.
    pub algorithm: String,
    /// Algorithm-dependent auth data; for megolm v1 backups this is a
    /// [`BackupAuthData`].
    pub auth_data: JsonValue,
    /// The number of keys stored in the backup.
    pub count: u64,
    /// An opaque tag that changes whenever the backup contents change.
    pub etag: String,
    /// The server-assigned version of the backup.
    pub version: String,
}

/// The request body for creating a new backup version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupInfo {
    /// The backup algorithm.
    pub algorithm: String,
    /// Algorithm-dependent auth data.
    pub auth_data: JsonValue,
}

/// The auth data of a `m.megolm_backup.v1.curve25519-aes-sha2` backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupAuthData {
    /// The curve25519 public key room keys are encrypted to.
    pub public_key: String,
    /// Signatures over the canonical form of the auth data.
    #[serde(default, skip_serializing_if = "SignatureMap::is_empty")]
    pub signatures: SignatureMap,
    /// Unspecced fields other clients may have put here; kept so a
    /// serialization cycle doesn't lose them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// The crypto-relevant parts of a single sync response.
#[derive(Clone, Debug, Default)]
pub struct SyncChanges {
    /// To-device events delivered to us in the sync.
    pub to_device_events: Vec<JsonValue>,
    /// Users whose device lists changed since the last sync.
    pub changed_devices: Vec<OwnedUserId>,
    /// Users we no longer share an encrypted room with.
    pub left_devices: Vec<OwnedUserId>,
    /// Per-algorithm counts of our remaining uploaded one-time keys.
    pub one_time_key_counts: BTreeMap<String, u64>,
    /// The algorithms of our uploaded but unused fallback keys, when the
    /// server reports them.
    pub unused_fallback_keys: Option<Vec<String>>,
}

/// Serialize an object into the canonical JSON form that Matrix signatures
/// cover: `signatures` and `unsigned` removed, keys sorted.
pub fn canonical_signing_payload(object: &JsonValue) -> Result<String, serde_json::Error> {
    let mut object = object.clone();

    if let Some(map) = object.as_object_mut() {
        map.remove("signatures");
        map.remove("unsigned");
    }

    let canonical = CanonicalJsonValue::try_from(object)
        .map_err(|e| serde::ser::Error::custom(e.to_string()))?;

    serde_json::to_string(&canonical)
}
