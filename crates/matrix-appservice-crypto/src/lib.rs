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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations)]

mod backups;
mod client;
mod driver;
mod error;
mod events;
mod group_sessions;
pub mod machine;
pub mod store;
pub mod testing;
mod tracker;
pub mod transport;
pub mod types;

pub use backups::BackupManager;
pub use client::CryptoClient;
pub use driver::MachineDriver;
pub use error::{CryptoError, Result};
pub use events::{CryptoEvent, CryptoEvents};
pub use group_sessions::GroupSessionManager;
pub use machine::{
    CryptoMachine, MachineError, MachineInitData, MachineRequest, MachineRequestKind,
    OutgoingMachineRequest, RoomKeyShare, ShareTarget,
};
pub use ruma;
pub use store::{CryptoStore, CryptoStoreError, PickleKeyStore};
pub use tracker::DeviceTracker;
pub use transport::{CryptoTransport, MatrixApiError, TransportError};
pub use types::{
    DecryptedRoomEvent, DeviceKeys, EncryptedContent, EncryptionSettings, KeyBackupInfo,
    KeyBackupVersion, RoomEncryptionConfig, SyncChanges,
};
