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

//! Per-room key preparation: who gets the room key, and with which settings.

use std::{collections::BTreeSet, sync::Arc};

use ruma::{
    events::room::{history_visibility::HistoryVisibility, member::MembershipState},
    OwnedUserId, RoomId,
};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{
    backups::BackupManager,
    driver::MachineDriver,
    error::Result,
    machine::CryptoMachine,
    store::CryptoStore,
    transport::CryptoTransport,
    types::{EncryptionSettings, RoomEncryptionConfig},
};

/// Prepares rooms for encryption and keeps the sent-session ledger.
pub struct GroupSessionManager {
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn CryptoTransport>,
    machine: Arc<dyn CryptoMachine>,
    driver: Arc<MachineDriver>,
    backups: Arc<BackupManager>,
}

impl std::fmt::Debug for GroupSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionManager").finish()
    }
}

impl GroupSessionManager {
    pub(crate) fn new(
        store: Arc<dyn CryptoStore>,
        transport: Arc<dyn CryptoTransport>,
        machine: Arc<dyn CryptoMachine>,
        driver: Arc<MachineDriver>,
        backups: Arc<BackupManager>,
    ) -> Self {
        Self { store, transport, machine, driver, backups }
    }

    /// Make sure every eligible device in the room has the current room key
    /// before an event is encrypted.
    ///
    /// Collects the room's members according to its history visibility,
    /// brings their device lists and Olm sessions up to date, shares the
    /// room key under the room's lock and records who received it.
    #[instrument(skip(self, config), fields(room_id = %room_id))]
    pub(crate) async fn prepare_encrypt(
        &self,
        room_id: &RoomId,
        config: &RoomEncryptionConfig,
    ) -> Result<()> {
        let visibility = match &config.history_visibility {
            Some(visibility) => visibility.clone(),
            None => self.fetch_history_visibility(room_id).await,
        };

        // Which memberships may read new messages, and therefore need the
        // key. Everything except `joined` also targets invitees.
        let memberships = match visibility {
            HistoryVisibility::WorldReadable
            | HistoryVisibility::Invited
            | HistoryVisibility::Shared => vec![MembershipState::Join, MembershipState::Invite],
            _ => vec![MembershipState::Join],
        };

        let mut members = BTreeSet::new();
        for membership in &memberships {
            match self
                .transport
                .get_room_members(room_id, std::slice::from_ref(membership))
                .await
            {
                Ok(found) => members.extend(found),
                Err(error) => {
                    warn!(
                        %membership,
                        %error,
                        "Failed to collect members for a membership, continuing with the others"
                    );
                }
            }
        }

        if members.is_empty() {
            debug!("No members to share the room key with");
            return Ok(());
        }

        // The machine rejects algorithms it doesn't implement, so the config
        // value is passed through untouched.
        let settings = EncryptionSettings::new(config, visibility);
        let members: Vec<OwnedUserId> = members.into_iter().collect();

        self.driver.add_tracked_users(members.clone()).await?;

        let room_lock = self.driver.room_lock(room_id);
        let _guard = room_lock.lock().await;

        let share = self.machine.share_room_key(room_id, &members, settings).await?;

        debug!(
            session_id = share.session.session_id.as_str(),
            recipient_count = share.shared_with.len(),
            "Sharing the room key"
        );

        for request in share.requests {
            self.driver.dispatch(request).await?;
        }

        self.store.store_outbound_group_session(&share.session).await?;

        for target in &share.shared_with {
            self.store
                .store_sent_room_key(
                    &share.session,
                    share.message_index,
                    &target.user_id,
                    &target.device_id,
                )
                .await?;
        }

        if self.backups.is_enabled() {
            let backups = self.backups.clone();
            tokio::spawn(async move {
                if let Err(error) = backups.backup_room_keys().await {
                    warn!(%error, "The backup drain after a room key share failed");
                }
            });
        }

        Ok(())
    }

    async fn fetch_history_visibility(&self, room_id: &RoomId) -> HistoryVisibility {
        #[derive(Deserialize)]
        struct HistoryVisibilityContent {
            history_visibility: HistoryVisibility,
        }

        match self
            .transport
            .get_room_state_event(room_id, "m.room.history_visibility", "")
            .await
        {
            Ok(Some(content)) => serde_json::from_value::<HistoryVisibilityContent>(content)
                .map(|c| c.history_visibility)
                .unwrap_or(HistoryVisibility::Joined),
            Ok(None) => HistoryVisibility::Joined,
            Err(error) => {
                warn!(%error, "Failed to fetch the room's history visibility, assuming joined");
                HistoryVisibility::Joined
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::GroupSessionManager;
    use crate::{
        backups::BackupManager,
        driver::MachineDriver,
        events::CryptoEvents,
        store::{CryptoStore, MemoryCryptoStore},
        testing::{MockMachine, MockTransport, RecordedRequest},
        types::RoomEncryptionConfig,
    };
    use ruma::EventEncryptionAlgorithm;

    struct Fixture {
        manager: GroupSessionManager,
        machine: Arc<MockMachine>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryCryptoStore>,
    }

    fn fixture() -> Fixture {
        let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        let store = Arc::new(MemoryCryptoStore::new());
        let events = CryptoEvents::new();

        let driver =
            Arc::new(MachineDriver::new(machine.clone(), transport.clone(), events.clone()));
        let backups = Arc::new(BackupManager::new(
            machine.clone(),
            transport.clone(),
            events,
            driver.sync_lock(),
            Arc::new(AtomicBool::new(true)),
        ));

        let manager = GroupSessionManager::new(
            store.clone(),
            transport.clone(),
            machine.clone(),
            driver,
            backups,
        );

        Fixture { manager, machine, transport, store }
    }

    fn config() -> RoomEncryptionConfig {
        RoomEncryptionConfig {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period_ms: None,
            rotation_period_msgs: None,
            history_visibility: None,
        }
    }

    #[tokio::test]
    async fn empty_rooms_share_nothing() {
        let f = fixture();

        f.manager.prepare_encrypt(room_id!("!empty:x"), &config()).await.unwrap();

        assert_eq!(f.machine.share_call_count(), 0);
    }

    #[tokio::test]
    async fn share_targets_invitees_for_shared_visibility() {
        let f = fixture();
        let room_id = room_id!("!r:x");

        f.transport.add_members(room_id, "join", &[user_id!("@joined:localhost")]);
        f.transport.add_members(room_id, "invite", &[user_id!("@invited:localhost")]);
        f.transport.set_state_event(
            room_id,
            "m.room.history_visibility",
            "",
            json!({ "history_visibility": "shared" }),
        );

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();

        let shared_with = f.machine.last_share_users();
        assert!(shared_with.contains(&user_id!("@joined:localhost").to_owned()));
        assert!(shared_with.contains(&user_id!("@invited:localhost").to_owned()));
    }

    #[tokio::test]
    async fn joined_visibility_skips_invitees() {
        let f = fixture();
        let room_id = room_id!("!r:x");

        f.transport.add_members(room_id, "join", &[user_id!("@joined:localhost")]);
        f.transport.add_members(room_id, "invite", &[user_id!("@invited:localhost")]);
        f.transport.set_state_event(
            room_id,
            "m.room.history_visibility",
            "",
            json!({ "history_visibility": "joined" }),
        );

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();

        let shared_with = f.machine.last_share_users();
        assert_eq!(shared_with, [user_id!("@joined:localhost").to_owned()]);
    }

    #[tokio::test]
    async fn membership_collection_failures_are_partial() {
        let f = fixture();
        let room_id = room_id!("!r:x");

        f.transport.add_members(room_id, "join", &[user_id!("@joined:localhost")]);
        f.transport.fail_invite_members(true);
        f.transport.set_state_event(
            room_id,
            "m.room.history_visibility",
            "",
            json!({ "history_visibility": "shared" }),
        );

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();

        assert_eq!(f.machine.last_share_users(), [user_id!("@joined:localhost").to_owned()]);
    }

    #[tokio::test]
    async fn sharing_updates_the_session_and_ledger() {
        let f = fixture();
        let room_id = room_id!("!r:x");

        f.transport.add_members(room_id, "join", &[user_id!("@ping:localhost")]);

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();

        let session =
            f.store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();
        assert!(session.is_current);

        let targets = f.machine.last_share_targets();
        assert!(!targets.is_empty());

        let ledger = f
            .store
            .get_last_sent_room_key(&targets[0].user_id, &targets[0].device_id, room_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.session_id, session.session_id);

        assert!(
            f.transport.recorded().iter().any(|r| matches!(r, RecordedRequest::ToDevice { .. })),
            "the room key went out as to-device messages"
        );

        // The tracked-user flush ran before the share.
        assert!(f.machine.tracked_users().contains(user_id!("@ping:localhost")));
    }

    #[tokio::test]
    async fn resharing_rotates_the_current_session() {
        let f = fixture();
        let room_id = room_id!("!r:x");

        f.transport.add_members(room_id, "join", &[user_id!("@ping:localhost")]);

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();
        let first = f.store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();

        f.manager.prepare_encrypt(room_id, &config()).await.unwrap();
        let second = f.store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();

        assert_ne!(first.session_id, second.session_id);

        let demoted =
            f.store.get_outbound_group_session(&first.session_id, room_id).await.unwrap().unwrap();
        assert!(!demoted.is_current);
    }
}
