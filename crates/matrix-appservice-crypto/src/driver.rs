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

//! The single-writer driver around the crypto machine.
//!
//! All request traffic between the machine and the homeserver flows through
//! here. One coarse lock (the *sync lock*) serializes everything that
//! touches the machine's request-producing surface; per-room locks keep room
//! key sharing for different rooms concurrent once tracked-user updates are
//! done.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex as StdMutex},
};

use dashmap::DashMap;
use ruma::{OwnedRoomId, OwnedUserId, RoomId};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    error::{CryptoError, Result},
    events::{CryptoEvent, CryptoEvents},
    machine::{CryptoMachine, MachineRequest, OutgoingMachineRequest},
    transport::CryptoTransport,
    types::SyncChanges,
};

/// Pumps the machine's outgoing-request queue and routes responses back.
pub struct MachineDriver {
    machine: Arc<dyn CryptoMachine>,
    transport: Arc<dyn CryptoTransport>,
    events: CryptoEvents,
    /// Serializes every call into the machine's request-producing surface.
    sync_lock: Arc<Mutex<()>>,
    room_locks: DashMap<OwnedRoomId, Arc<Mutex<()>>>,
    /// Users waiting to be flushed into the machine's tracked set.
    pending_tracked: StdMutex<BTreeSet<OwnedUserId>>,
    /// Serializes tracked-user flushes; a caller whose users were drained by
    /// the in-flight flush observes that flush's completion here.
    flush_lock: Mutex<()>,
}

impl std::fmt::Debug for MachineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineDriver").field("machine", &self.machine).finish()
    }
}

impl MachineDriver {
    pub fn new(
        machine: Arc<dyn CryptoMachine>,
        transport: Arc<dyn CryptoTransport>,
        events: CryptoEvents,
    ) -> Self {
        Self {
            machine,
            transport,
            events,
            sync_lock: Arc::new(Mutex::new(())),
            room_locks: DashMap::new(),
            pending_tracked: StdMutex::new(BTreeSet::new()),
            flush_lock: Mutex::new(()),
        }
    }

    /// The lock serializing access to the machine's request-producing
    /// surface.
    pub(crate) fn sync_lock(&self) -> Arc<Mutex<()>> {
        self.sync_lock.clone()
    }

    /// The lock serializing room key sharing for one room.
    pub(crate) fn room_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.room_locks
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one drive cycle: fetch the machine's pending requests and
    /// dispatch each of them.
    ///
    /// The machine produces a snapshot, so the queue is fetched once rather
    /// than drained in a loop.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        self.run_locked().await
    }

    pub(crate) async fn run_locked(&self) -> Result<()> {
        let requests = self.machine.outgoing_requests().await?;

        debug!(request_count = requests.len(), "Dispatching outgoing crypto requests");

        for request in requests {
            self.dispatch(request).await?;
        }

        Ok(())
    }

    /// Feed a sync response into the machine and flush whatever requests it
    /// produced in reaction.
    pub(crate) async fn receive_sync_changes(&self, changes: SyncChanges) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        self.machine.receive_sync_changes(changes).await?;
        self.run_locked().await
    }

    /// Add users to the machine's tracked set and establish any missing Olm
    /// sessions with their devices.
    ///
    /// Callers racing an in-flight flush coalesce into it: the second caller
    /// parks its users in the pending set, waits for the running flush, and
    /// only flushes itself whatever is still pending afterwards.
    pub async fn add_tracked_users(&self, users: impl IntoIterator<Item = OwnedUserId>) -> Result<()> {
        self.pending_tracked.lock().unwrap().extend(users);

        let _flush = self.flush_lock.lock().await;

        let batch: Vec<OwnedUserId> = {
            let mut pending = self.pending_tracked.lock().unwrap();
            std::mem::take(&mut *pending).into_iter().collect()
        };

        if batch.is_empty() {
            // The flush we just waited for covered our users.
            return Ok(());
        }

        debug!(user_count = batch.len(), "Flushing users into the machine's tracked set");

        let _sync = self.sync_lock.lock().await;
        self.machine.update_tracked_users(&batch).await?;
        self.run_locked().await?;

        if let Some(claim) = self.machine.get_missing_sessions(&batch).await? {
            self.dispatch(claim).await?;
        }

        Ok(())
    }

    /// Dispatch a single machine request to the homeserver and feed the
    /// response back.
    ///
    /// Locking is the caller's concern: the drive loop holds the sync lock,
    /// room key shares hold their room lock.
    pub(crate) async fn dispatch(&self, request: OutgoingMachineRequest) -> Result<()> {
        let kind = request.request.kind();

        let response = match request.request {
            MachineRequest::KeysUpload { body } => self.transport.keys_upload(&body).await?,
            MachineRequest::KeysQuery { body } => self.transport.keys_query(&body).await?,
            MachineRequest::KeysClaim { body } => self.transport.keys_claim(&body).await?,
            MachineRequest::ToDevice { event_type, txn_id, messages } => {
                self.transport.send_to_device(&event_type, &txn_id, &messages).await?
            }
            MachineRequest::KeysBackup { version, rooms } => {
                match self.transport.put_room_keys(&version, &rooms).await {
                    Ok(response) => response,
                    Err(error) => {
                        // Backups are best-effort: the keys stay queued in
                        // the machine and a later drain retries.
                        warn!(%error, "Failed to upload a room key batch");
                        self.events
                            .emit(CryptoEvent::BackupFailed { error: error.to_string() });
                        return Ok(());
                    }
                }
            }
            MachineRequest::SignatureUpload { .. } | MachineRequest::RoomMessage { .. } => {
                return Err(CryptoError::UnsupportedRequestType(kind));
            }
        };

        self.machine.mark_request_as_sent(&request.request_id, kind, &response).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, OwnedTransactionId, TransactionId};
    use serde_json::json;

    use super::MachineDriver;
    use crate::{
        error::CryptoError,
        events::CryptoEvents,
        machine::{CryptoMachine, MachineRequest, MachineRequestKind, OutgoingMachineRequest},
        testing::{MockMachine, MockTransport, RecordedRequest},
    };

    fn driver_with(
        machine: Arc<MockMachine>,
        transport: Arc<MockTransport>,
    ) -> MachineDriver {
        MachineDriver::new(machine, transport, CryptoEvents::new())
    }

    fn request(request: MachineRequest) -> OutgoingMachineRequest {
        OutgoingMachineRequest { request_id: TransactionId::new(), request }
    }

    #[tokio::test]
    async fn run_dispatches_and_marks_requests() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let upload = request(MachineRequest::KeysUpload { body: json!({ "device_keys": {} }) });
        let upload_id = upload.request_id.clone();
        machine.queue_request(upload);

        let driver = driver_with(machine.clone(), transport.clone());
        driver.run().await.unwrap();

        assert!(machine.outgoing_requests().await.unwrap().is_empty(), "the queue drained");

        let sent: Vec<OwnedTransactionId> =
            machine.sent_requests().iter().map(|(id, _, _)| id.clone()).collect();
        assert_eq!(sent, [upload_id]);

        assert_matches!(transport.recorded()[0], RecordedRequest::KeysUpload(_));
    }

    #[tokio::test]
    async fn unsupported_request_types_are_fatal() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        machine.queue_request(request(MachineRequest::SignatureUpload { body: json!({}) }));

        let driver = driver_with(machine, transport);
        let error = driver.run().await.unwrap_err();

        assert_matches!(
            error,
            CryptoError::UnsupportedRequestType(MachineRequestKind::SignatureUpload)
        );
    }

    #[tokio::test]
    async fn failed_backup_uploads_are_swallowed_and_reported() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.fail_put_room_keys(true);

        machine.queue_request(request(MachineRequest::KeysBackup {
            version: "1".to_owned(),
            rooms: json!({ "rooms": {} }),
        }));

        let events = CryptoEvents::new();
        let mut failures = events.subscribe();

        let driver = MachineDriver::new(machine.clone(), transport, events);
        driver.run().await.expect("backup failures must not fail the drive cycle");

        assert!(failures.try_recv().is_ok(), "a failure event was emitted");
        assert!(
            machine.sent_requests().is_empty(),
            "a failed backup must not be marked as sent"
        );
    }

    #[tokio::test]
    async fn tracked_user_flush_claims_missing_sessions() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let driver = driver_with(machine.clone(), transport.clone());
        driver
            .add_tracked_users([user_id!("@ping:localhost").to_owned()])
            .await
            .unwrap();

        assert!(machine
            .tracked_users()
            .contains(user_id!("@ping:localhost")));
        assert!(
            transport.recorded().iter().any(|r| matches!(r, RecordedRequest::KeysClaim(_))),
            "the flush claims one-time keys for missing sessions"
        );
    }

    #[tokio::test]
    async fn empty_pending_set_skips_the_machine() {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

        let driver = driver_with(machine.clone(), transport);
        driver.add_tracked_users([]).await.unwrap();

        assert!(machine.tracked_users().is_empty());
    }
}
