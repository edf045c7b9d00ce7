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

use std::sync::Arc;

use ruma::OwnedRoomId;
use thiserror::Error;

use crate::{
    machine::{MachineError, MachineRequestKind},
    store::CryptoStoreError,
    transport::TransportError,
};

/// The errors the encryption subsystem surfaces to its callers.
///
/// Device-validation failures never appear here: a device the tracker
/// rejects is dropped with a warning, everything else continues. Transport
/// errors during a device-list refresh are likewise swallowed after logging,
/// the outdated flag keeps the retry alive.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A storage failure inside a device-list refresh that several callers
    /// were awaiting together.
    #[error("storage failed during a coalesced device-list refresh: {0}")]
    SharedStore(Arc<CryptoStoreError>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    /// An operation ran before [`prepare`](crate::CryptoClient::prepare)
    /// completed.
    #[error("the crypto client must be prepared before use")]
    UninitializedCrypto,

    /// Only `m.megolm_backup.v1.curve25519-aes-sha2` backups can be enabled.
    #[error("unsupported backup algorithm: {0}")]
    UnsupportedBackupAlgorithm(String),

    /// `backup_room_keys` was called while no backup is enabled.
    #[error("key backup is not enabled")]
    BackupNotEnabled,

    /// The machine emitted a request type this binding can't dispatch. This
    /// is a bug in the machine/adapter pairing, not a recoverable condition.
    #[error("the crypto machine produced an unsupported request type: {0:?}")]
    UnsupportedRequestType(MachineRequestKind),

    /// An event was handed to `encrypt_room_event` for a room without an
    /// encryption config.
    #[error("room {0} is not encrypted")]
    RoomNotEncrypted(OwnedRoomId),

    /// An event lacks a field the subsystem needs.
    #[error("the event is missing the `{0}` field")]
    MalformedEvent(&'static str),

    /// Backup info whose `auth_data` doesn't have the expected shape.
    #[error("the backup info is malformed: {0}")]
    InvalidBackupInfo(&'static str),

    /// A ciphertext re-used a (session, ratchet index) pair that an earlier,
    /// different event already consumed.
    #[error(
        "message index {message_index} of session {session_id} was already used by another event"
    )]
    ReplayDetected {
        /// The group session the replayed ciphertext belongs to.
        session_id: String,
        /// The re-used ratchet index.
        message_index: u32,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// The result type of the public crypto API.
pub type Result<T, E = CryptoError> = std::result::Result<T, E>;
