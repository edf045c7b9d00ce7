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

//! The slice of the client-server API the encryption subsystem consumes.
//!
//! The HTTP client, its retry policy and its auth handling live outside this
//! crate; this is only the contract. All endpoints use Bearer-token auth and
//! JSON bodies, errors carry the Matrix `{errcode, error}` shape.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use ruma::{
    events::room::member::MembershipState, OwnedDeviceId, OwnedUserId, RoomId, TransactionId,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::types::{KeyBackupInfo, KeyBackupVersion};

/// A standard Matrix error body.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MatrixApiError {
    /// The machine-readable error code, e.g. `M_NOT_FOUND`.
    pub errcode: String,
    /// The human-readable error message.
    #[serde(default)]
    pub error: Option<String>,
}

impl fmt::Display for MatrixApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(message) => write!(f, "{}: {message}", self.errcode),
            None => write!(f, "{}", self.errcode),
        }
    }
}

/// An HTTP-layer failure.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The homeserver answered with a Matrix error body.
    #[error("the homeserver returned an error: {0}")]
    Api(MatrixApiError),
    /// The request never produced a response.
    #[error("the request couldn't be sent: {0}")]
    Connection(String),
    /// The response couldn't be interpreted.
    #[error("malformed response from the homeserver")]
    Deserialization(#[from] serde_json::Error),
}

/// The result type of every transport call.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// The transport collaborator the encryption subsystem drives.
///
/// Implementations route each call to the corresponding client-server
/// endpoint. `M_NOT_FOUND` on the backup-version read is not an error and
/// must be mapped to `Ok(None)`.
#[async_trait]
pub trait CryptoTransport: Debug + Send + Sync {
    /// `GET /account/whoami`, reduced to the device id of this login.
    async fn whoami(&self) -> Result<OwnedDeviceId>;

    /// `POST /keys/upload`.
    async fn keys_upload(&self, body: &JsonValue) -> Result<JsonValue>;

    /// `POST /keys/query`.
    async fn keys_query(&self, body: &JsonValue) -> Result<JsonValue>;

    /// `POST /keys/claim`.
    async fn keys_claim(&self, body: &JsonValue) -> Result<JsonValue>;

    /// `PUT /sendToDevice/{eventType}/{txnId}`.
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TransactionId,
        messages: &JsonValue,
    ) -> Result<JsonValue>;

    /// `GET /room_keys/version`. `M_NOT_FOUND` means no backup exists and
    /// maps to `Ok(None)`.
    async fn get_key_backup_version(&self) -> Result<Option<KeyBackupVersion>>;

    /// `POST /room_keys/version`, returning the new backup version.
    async fn create_key_backup_version(&self, info: &KeyBackupInfo) -> Result<String>;

    /// `PUT /room_keys/keys?version=<version>`.
    async fn put_room_keys(&self, version: &str, rooms: &JsonValue) -> Result<JsonValue>;

    /// `GET /rooms/{roomId}/state/{eventType}/{stateKey}`, `None` when the
    /// event doesn't exist.
    async fn get_room_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<JsonValue>>;

    /// The members of a room with one of the given memberships.
    async fn get_room_members(
        &self,
        room_id: &RoomId,
        memberships: &[MembershipState],
    ) -> Result<Vec<OwnedUserId>>;
}
