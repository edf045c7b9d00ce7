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

//! The contract this crate requires of the opaque crypto machine.
//!
//! The machine owns every cryptographic primitive: the Olm account, pairwise
//! sessions, Megolm group sessions and the backup encryption. We never look
//! inside it; we initialize it from pickled state, feed it sync input, pump
//! its [outgoing request queue](CryptoMachine::outgoing_requests) and route
//! the server's responses back with
//! [`mark_request_as_sent`](CryptoMachine::mark_request_as_sent).

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::{
    DecryptedRoomEvent, EncryptedContent, EncryptionSettings, OutboundGroupSessionRecord,
    SignatureMap, SyncChanges,
};

/// An opaque failure inside the crypto machine.
#[derive(Error, Debug)]
pub enum MachineError {
    /// The machine was used before [`CryptoMachine::initialize`] completed.
    #[error("the crypto machine wasn't initialized yet")]
    NotInitialized,
    /// Unpickling the stored account failed, usually because the pickle key
    /// doesn't match.
    #[error("the stored account couldn't be unpickled: {0}")]
    Unpickling(String),
    /// The machine rejected or failed a domain operation.
    #[error("crypto machine operation failed: {0}")]
    Operation(String),
}

/// Everything the machine needs to restore or create its identity.
#[derive(Debug)]
pub struct MachineInitData<'a> {
    /// The user the machine acts as.
    pub user_id: &'a UserId,
    /// The device id of this login.
    pub device_id: &'a DeviceId,
    /// The key protecting all pickled material.
    pub pickle_key: &'a str,
    /// The pickled account from a previous run, if any. `None` makes the
    /// machine create a fresh identity.
    pub pickled_account: Option<String>,
}

/// The request types a machine may emit.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineRequestKind {
    KeysUpload,
    KeysQuery,
    KeysClaim,
    ToDevice,
    KeysBackup,
    SignatureUpload,
    RoomMessage,
}

/// A pending request the machine wants dispatched to the homeserver.
#[derive(Clone, Debug)]
pub struct OutgoingMachineRequest {
    /// Unique id of the request, echoed back when marking it as sent.
    pub request_id: OwnedTransactionId,
    /// The request itself.
    pub request: MachineRequest,
}

/// The body of a pending machine request.
#[derive(Clone, Debug)]
pub enum MachineRequest {
    /// Publish this device's identity and one-time keys.
    KeysUpload { body: JsonValue },
    /// Fetch peer device inventories.
    KeysQuery { body: JsonValue },
    /// Claim peer one-time keys.
    KeysClaim { body: JsonValue },
    /// Deliver payloads to specific devices.
    ToDevice { event_type: String, txn_id: OwnedTransactionId, messages: JsonValue },
    /// Upload a batch of room keys to the active backup.
    KeysBackup { version: String, rooms: JsonValue },
    /// Upload cross-signing signatures. Not supported by this client.
    SignatureUpload { body: JsonValue },
    /// Send a room message. Not supported by this client.
    RoomMessage { room_id: OwnedRoomId, event_type: String, content: JsonValue },
}

impl MachineRequest {
    /// The type tag of this request.
    pub fn kind(&self) -> MachineRequestKind {
        match self {
            Self::KeysUpload { .. } => MachineRequestKind::KeysUpload,
            Self::KeysQuery { .. } => MachineRequestKind::KeysQuery,
            Self::KeysClaim { .. } => MachineRequestKind::KeysClaim,
            Self::ToDevice { .. } => MachineRequestKind::ToDevice,
            Self::KeysBackup { .. } => MachineRequestKind::KeysBackup,
            Self::SignatureUpload { .. } => MachineRequestKind::SignatureUpload,
            Self::RoomMessage { .. } => MachineRequestKind::RoomMessage,
        }
    }
}

/// A recipient of a shared room key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareTarget {
    /// The user the key was encrypted to.
    pub user_id: OwnedUserId,
    /// The user's device the key was encrypted to.
    pub device_id: OwnedDeviceId,
}

/// The outcome of sharing a room key with a set of users.
#[derive(Clone, Debug)]
pub struct RoomKeyShare {
    /// The outbound session in use after the share; flagged current.
    pub session: OutboundGroupSessionRecord,
    /// The ratchet index new recipients can decrypt from.
    pub message_index: u32,
    /// The devices the key was shared with this time.
    pub shared_with: Vec<ShareTarget>,
    /// To-device requests that deliver the key; they must be dispatched
    /// before the session is used.
    pub requests: Vec<OutgoingMachineRequest>,
}

/// The opaque crypto machine collaborator.
///
/// Implementations wrap a real cryptographic engine; tests substitute the
/// scriptable [`MockMachine`](crate::testing::MockMachine). The machine is a
/// single-writer resource: callers serialize access through the
/// [`MachineDriver`](crate::MachineDriver) locks.
#[async_trait]
pub trait CryptoMachine: Debug + Send + Sync {
    /// Restore the machine from pickled state, or create a fresh identity.
    ///
    /// Returns the (re-)pickled account to persist.
    async fn initialize(&self, data: MachineInitData<'_>) -> Result<String, MachineError>;

    /// A snapshot of the machine's pending outgoing requests.
    async fn outgoing_requests(&self) -> Result<Vec<OutgoingMachineRequest>, MachineError>;

    /// Feed the server's response to a previously emitted request back into
    /// the machine.
    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        kind: MachineRequestKind,
        response: &JsonValue,
    ) -> Result<(), MachineError>;

    /// Add users whose device lists the machine should track.
    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), MachineError>;

    /// Produce a one-time-key claim request for devices we lack Olm sessions
    /// with, if any.
    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingMachineRequest>, MachineError>;

    /// Feed the crypto-relevant parts of a sync response into the machine.
    async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<(), MachineError>;

    /// Create or rotate the room's outbound session and encrypt it to every
    /// device of the given users.
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: EncryptionSettings,
    ) -> Result<RoomKeyShare, MachineError>;

    /// Encrypt a room event with the room's current outbound session.
    async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<EncryptedContent, MachineError>;

    /// Decrypt an `m.room.encrypted` event.
    async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &JsonValue,
    ) -> Result<DecryptedRoomEvent, MachineError>;

    /// Start encrypting room keys to the given backup public key.
    async fn enable_backup_v1(&self, public_key: &str, version: &str)
        -> Result<(), MachineError>;

    /// Stop backing up room keys and reset per-key backup state.
    async fn disable_backup(&self) -> Result<(), MachineError>;

    /// Encrypt one batch of not-yet-backed-up room keys.
    ///
    /// Returns `None` once every key is backed up. Each returned request must
    /// be dispatched and marked as sent before the next call makes progress.
    async fn backup_room_keys(&self) -> Result<Option<OutgoingMachineRequest>, MachineError>;

    /// Export an inbound group session in the room-key export format.
    ///
    /// The returned string is a JSON array of exported keys.
    async fn export_room_keys_for_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<String, MachineError>;

    /// Sign the canonical form of an object with our ed25519 identity key.
    async fn sign(&self, message: &str) -> Result<SignatureMap, MachineError>;
}
