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

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use ruma::{DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;

use super::{kv_keys, CryptoStore, Result, DEFAULT_NAMESPACE};
use crate::types::{
    DeviceKeys, InboundGroupSessionRecord, OlmSessionRecord, OutboundGroupSessionRecord,
    RoomEncryptionConfig, SentRoomKeyRecord,
};

type Namespace = String;

/// An in-memory store that forgets all the E2EE keys once it's dropped.
///
/// Namespaced views derived with
/// [`storage_for_user`](CryptoStore::storage_for_user) share the maps of the
/// store they were derived from.
#[derive(Debug, Clone)]
pub struct MemoryCryptoStore {
    namespace: Arc<str>,
    inner: Arc<MemoryStoreInner>,
}

impl Default for MemoryCryptoStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    kv: DashMap<(Namespace, String), String>,
    rooms: DashMap<OwnedRoomId, RoomEncryptionConfig>,
    outdated_users: DashMap<OwnedUserId, bool>,
    devices: DashMap<OwnedUserId, BTreeMap<OwnedDeviceId, (DeviceKeys, bool)>>,
    outbound_sessions: DashMap<(Namespace, OwnedRoomId), BTreeMap<String, OutboundGroupSessionRecord>>,
    sent_room_keys:
        DashMap<(Namespace, OwnedRoomId, OwnedUserId, OwnedDeviceId), Vec<SentRoomKeyRecord>>,
    olm_sessions: DashMap<(Namespace, OwnedUserId, OwnedDeviceId), Vec<OlmSessionRecord>>,
    inbound_sessions:
        DashMap<(Namespace, OwnedUserId, OwnedDeviceId, OwnedRoomId, String), InboundGroupSessionRecord>,
    event_indices: DashMap<(Namespace, OwnedRoomId, OwnedEventId), (String, u32)>,
    message_indices: DashMap<(Namespace, OwnedRoomId, String, u32), OwnedEventId>,
}

impl MemoryCryptoStore {
    /// Create a new, empty store using the default namespace.
    pub fn new() -> Self {
        Self { namespace: DEFAULT_NAMESPACE.into(), inner: Default::default() }
    }

    fn ns(&self) -> Namespace {
        self.namespace.as_ref().to_owned()
    }

    fn get_kv(&self, name: &str) -> Option<String> {
        self.inner.kv.get(&(self.ns(), name.to_owned())).map(|v| v.clone())
    }

    fn set_kv(&self, name: &str, value: String) {
        self.inner.kv.insert((self.ns(), name.to_owned()), value);
    }
}

#[async_trait]
impl CryptoStore for MemoryCryptoStore {
    async fn get_device_id(&self) -> Result<Option<OwnedDeviceId>> {
        Ok(self.get_kv(kv_keys::DEVICE_ID).map(Into::into))
    }

    async fn set_device_id(&self, device_id: &DeviceId) -> Result<()> {
        self.set_kv(kv_keys::DEVICE_ID, device_id.to_string());
        Ok(())
    }

    async fn get_pickle_key(&self) -> Result<Option<String>> {
        Ok(self.get_kv(kv_keys::PICKLE_KEY))
    }

    async fn set_pickle_key(&self, pickle_key: &str) -> Result<()> {
        self.set_kv(kv_keys::PICKLE_KEY, pickle_key.to_owned());
        Ok(())
    }

    async fn get_pickled_account(&self) -> Result<Option<String>> {
        Ok(self.get_kv(kv_keys::PICKLED_ACCOUNT))
    }

    async fn set_pickled_account(&self, pickled: &str) -> Result<()> {
        self.set_kv(kv_keys::PICKLED_ACCOUNT, pickled.to_owned());
        Ok(())
    }

    async fn store_room(&self, room_id: &RoomId, config: &RoomEncryptionConfig) -> Result<()> {
        self.inner.rooms.insert(room_id.to_owned(), config.clone());
        Ok(())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomEncryptionConfig>> {
        Ok(self.inner.rooms.get(room_id).map(|c| c.clone()))
    }

    async fn flag_users_outdated(&self, user_ids: &[OwnedUserId]) -> Result<()> {
        for user_id in user_ids {
            self.inner.outdated_users.insert(user_id.clone(), true);
        }
        Ok(())
    }

    async fn is_user_outdated(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.inner.outdated_users.get(user_id).map(|o| *o).unwrap_or(true))
    }

    async fn set_active_user_devices(
        &self,
        user_id: &UserId,
        devices: Vec<DeviceKeys>,
    ) -> Result<()> {
        let mut entry = self.inner.devices.entry(user_id.to_owned()).or_default();

        for (_, (_, active)) in entry.iter_mut() {
            *active = false;
        }

        for device in devices {
            entry.insert(device.device_id.clone(), (device, true));
        }

        drop(entry);
        self.inner.outdated_users.insert(user_id.to_owned(), false);

        Ok(())
    }

    async fn get_active_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        Ok(self
            .inner
            .devices
            .get(user_id)
            .map(|devices| {
                devices
                    .values()
                    .filter(|(_, active)| *active)
                    .map(|(device, _)| device.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceKeys>> {
        Ok(self
            .inner
            .devices
            .get(user_id)
            .map(|devices| {
                devices
                    .values()
                    .map(|(device, active)| {
                        let mut device = device.clone();
                        device.unsigned.extra.insert("active".to_owned(), JsonValue::from(*active));
                        device
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_active_user_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceKeys>> {
        Ok(self.inner.devices.get(user_id).and_then(|devices| {
            devices
                .get(device_id)
                .filter(|(_, active)| *active)
                .map(|(device, _)| device.clone())
        }))
    }

    async fn store_outbound_group_session(
        &self,
        session: &OutboundGroupSessionRecord,
    ) -> Result<()> {
        let mut entry = self
            .inner
            .outbound_sessions
            .entry((self.ns(), session.room_id.clone()))
            .or_default();

        if session.is_current {
            for existing in entry.values_mut() {
                existing.is_current = false;
            }
        }

        entry.insert(session.session_id.clone(), session.clone());

        Ok(())
    }

    async fn get_outbound_group_session(
        &self,
        session_id: &str,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        Ok(self
            .inner
            .outbound_sessions
            .get(&(self.ns(), room_id.to_owned()))
            .and_then(|sessions| sessions.get(session_id).cloned()))
    }

    async fn get_current_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSessionRecord>> {
        Ok(self
            .inner
            .outbound_sessions
            .get(&(self.ns(), room_id.to_owned()))
            .and_then(|sessions| sessions.values().find(|s| s.is_current).cloned()))
    }

    async fn store_sent_room_key(
        &self,
        session: &OutboundGroupSessionRecord,
        session_index: u32,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<()> {
        let mut entry = self
            .inner
            .sent_room_keys
            .entry((self.ns(), session.room_id.clone(), user_id.to_owned(), device_id.to_owned()))
            .or_default();

        let record =
            SentRoomKeyRecord { session_id: session.session_id.clone(), session_index };

        if !entry.contains(&record) {
            entry.push(record);
        }

        Ok(())
    }

    async fn get_last_sent_room_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<Option<SentRoomKeyRecord>> {
        Ok(self
            .inner
            .sent_room_keys
            .get(&(self.ns(), room_id.to_owned(), user_id.to_owned(), device_id.to_owned()))
            .and_then(|records| records.last().cloned()))
    }

    async fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session: &OlmSessionRecord,
    ) -> Result<()> {
        let mut entry = self
            .inner
            .olm_sessions
            .entry((self.ns(), user_id.to_owned(), device_id.to_owned()))
            .or_default();

        if let Some(existing) =
            entry.iter_mut().find(|s| s.session_id == session.session_id)
        {
            *existing = session.clone();
        } else {
            entry.push(session.clone());
        }

        Ok(())
    }

    async fn get_current_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<OlmSessionRecord>> {
        Ok(self
            .inner
            .olm_sessions
            .get(&(self.ns(), user_id.to_owned(), device_id.to_owned()))
            .and_then(|sessions| {
                sessions.iter().max_by_key(|s| s.last_decryption_ts).cloned()
            }))
    }

    async fn get_olm_sessions(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<OlmSessionRecord>> {
        let mut sessions = self
            .inner
            .olm_sessions
            .get(&(self.ns(), user_id.to_owned(), device_id.to_owned()))
            .map(|s| s.clone())
            .unwrap_or_default();

        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_decryption_ts));

        Ok(sessions)
    }

    async fn store_inbound_group_session(
        &self,
        session: &InboundGroupSessionRecord,
    ) -> Result<()> {
        self.inner.inbound_sessions.insert(
            (
                self.ns(),
                session.sender_user_id.clone(),
                session.sender_device_id.clone(),
                session.room_id.clone(),
                session.session_id.clone(),
            ),
            session.clone(),
        );
        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        sender_user_id: &UserId,
        sender_device_id: &DeviceId,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSessionRecord>> {
        Ok(self
            .inner
            .inbound_sessions
            .get(&(
                self.ns(),
                sender_user_id.to_owned(),
                sender_device_id.to_owned(),
                room_id.to_owned(),
                session_id.to_owned(),
            ))
            .map(|s| s.clone()))
    }

    async fn set_message_index_for_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        session_id: &str,
        message_index: u32,
    ) -> Result<()> {
        self.inner.event_indices.insert(
            (self.ns(), room_id.to_owned(), event_id.to_owned()),
            (session_id.to_owned(), message_index),
        );
        self.inner
            .message_indices
            .entry((self.ns(), room_id.to_owned(), session_id.to_owned(), message_index))
            .or_insert_with(|| event_id.to_owned());
        Ok(())
    }

    async fn get_event_for_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<OwnedEventId>> {
        Ok(self
            .inner
            .message_indices
            .get(&(self.ns(), room_id.to_owned(), session_id.to_owned(), message_index))
            .map(|e| e.clone()))
    }

    fn storage_for_user(&self, user_id: &UserId) -> Arc<dyn CryptoStore> {
        Arc::new(Self { namespace: user_id.as_str().into(), inner: self.inner.clone() })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryCryptoStore;

    async fn get_store() -> (MemoryCryptoStore, ()) {
        (MemoryCryptoStore::new(), ())
    }

    crate::cryptostore_integration_tests!();
}
