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

//! Tracking of peer device lists.
//!
//! The tracker keeps the `user_devices` table current. Every user carries an
//! `outdated` flag; reads through [`DeviceTracker::get_devices_for`] refresh
//! flagged users first. Refreshes validate what the server returned before
//! anything is stored: the server is in the adversary's reach, a device that
//! fails validation is dropped one device at a time without failing the
//! refresh.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use futures_util::{future::BoxFuture, future::Shared, FutureExt};
use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{
    error::{CryptoError, Result},
    store::{CryptoStore, CryptoStoreError},
    transport::CryptoTransport,
    types::{canonical_signing_payload, DeviceKeys},
};

/// Why a device from a `/keys/query` response was discarded. Never surfaced
/// to callers, only logged.
#[derive(Error, Debug)]
enum DeviceValidationError {
    #[error("the device record doesn't deserialize: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("the embedded user id doesn't match the owning user")]
    UserIdMismatch,
    #[error("the embedded device id doesn't match the claimed device")]
    DeviceIdMismatch,
    #[error("the device has no ed25519 identity key")]
    MissingEd25519,
    #[error("the device has no curve25519 key")]
    MissingCurve25519,
    #[error("the device id was seen before with a different ed25519 key")]
    Ed25519Changed,
    #[error("a key doesn't decode: {0}")]
    InvalidKey(String),
    #[error("the device carries no self-signature")]
    MissingSignature,
    #[error("the self-signature doesn't decode: {0}")]
    InvalidSignature(String),
    #[error("the self-signature doesn't verify: {0}")]
    SignatureVerification(String),
    #[error("the device doesn't canonicalize for signing: {0}")]
    Canonicalization(String),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), Arc<CryptoStoreError>>>>;

#[derive(Clone)]
struct InFlightRefresh {
    id: u64,
    future: SharedRefresh,
}

/// Maintains per-user device inventories.
pub struct DeviceTracker {
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn CryptoTransport>,
    in_flight: StdMutex<HashMap<OwnedUserId, InFlightRefresh>>,
    next_refresh_id: AtomicU64,
}

impl std::fmt::Debug for DeviceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTracker").field("store", &self.store).finish()
    }
}

impl DeviceTracker {
    pub fn new(store: Arc<dyn CryptoStore>, transport: Arc<dyn CryptoTransport>) -> Self {
        Self {
            store,
            transport,
            in_flight: StdMutex::new(HashMap::new()),
            next_refresh_id: AtomicU64::new(0),
        }
    }

    /// Get the active devices of each user, refreshing users whose device
    /// list is outdated first.
    ///
    /// Users without devices may be missing from the map or mapped to an
    /// empty list, callers must tolerate both.
    pub async fn get_devices_for(
        &self,
        user_ids: &[OwnedUserId],
    ) -> Result<HashMap<OwnedUserId, Vec<DeviceKeys>>> {
        let mut to_refresh = Vec::new();

        for user_id in user_ids {
            if self.store.is_user_outdated(user_id).await? {
                to_refresh.push(user_id.clone());
            }
        }

        self.update_users_device_lists(&to_refresh).await?;

        let mut devices = HashMap::new();
        for user_id in user_ids {
            devices.insert(user_id.clone(), self.store.get_active_user_devices(user_id).await?);
        }

        Ok(devices)
    }

    /// Flag the users' device lists as stale. With `resync` the refresh runs
    /// before this returns, otherwise it happens on the next read.
    pub async fn flag_users_outdated(&self, user_ids: &[OwnedUserId], resync: bool) -> Result<()> {
        self.store.flag_users_outdated(user_ids).await?;

        if resync {
            self.update_users_device_lists(user_ids).await?;
        }

        Ok(())
    }

    /// Refresh the device lists of the given users with one `/keys/query`.
    ///
    /// Overlapping refreshes coalesce: a caller whose users are already
    /// being refreshed first waits for every overlapping refresh, then runs
    /// its own, so it always observes its own read-after-write. A transport
    /// failure is logged and swallowed; the outdated flag stays set and a
    /// later refresh retries.
    pub async fn update_users_device_lists(&self, user_ids: &[OwnedUserId]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let overlapping: Vec<_> = {
            let in_flight = self.in_flight.lock().unwrap();
            user_ids.iter().filter_map(|u| in_flight.get(u).map(|r| r.future.clone())).collect()
        };

        for refresh in overlapping {
            // Only awaited for ordering; its outcome belongs to its caller.
            let _ = refresh.await;
        }

        let id = self.next_refresh_id.fetch_add(1, Ordering::SeqCst);
        let future = refresh_device_lists(
            self.store.clone(),
            self.transport.clone(),
            user_ids.to_vec(),
        )
        .boxed()
        .shared();

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for user_id in user_ids {
                in_flight
                    .insert(user_id.clone(), InFlightRefresh { id, future: future.clone() });
            }
        }

        let result = future.await;

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for user_id in user_ids {
                if in_flight.get(user_id).is_some_and(|r| r.id == id) {
                    in_flight.remove(user_id);
                }
            }
        }

        result.map_err(CryptoError::SharedStore)
    }
}

async fn refresh_device_lists(
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn CryptoTransport>,
    user_ids: Vec<OwnedUserId>,
) -> Result<(), Arc<CryptoStoreError>> {
    let mut query = serde_json::Map::new();
    for user_id in &user_ids {
        query.insert(user_id.to_string(), JsonValue::Array(Vec::new()));
    }
    let body = json!({ "device_keys": query });

    let response = match transport.keys_query(&body).await {
        Ok(response) => response,
        Err(error) => {
            // The users stay flagged, the next cycle retries.
            warn!(%error, "Failed to query device lists, keeping the users marked as outdated");
            return Ok(());
        }
    };

    let Some(device_keys) = response.get("device_keys").and_then(JsonValue::as_object) else {
        warn!("The device list response carries no device_keys object");
        return Ok(());
    };

    for (user_string, devices) in device_keys {
        let Ok(user_id) = UserId::parse(user_string.as_str()) else {
            warn!(user_id = user_string.as_str(), "Skipping a malformed user id in the response");
            continue;
        };

        if !user_ids.contains(&user_id) {
            warn!(
                user_id = %user_id,
                "The server returned devices for a user we didn't ask about, skipping them"
            );
            continue;
        }

        let Some(devices) = devices.as_object() else {
            warn!(user_id = %user_id, "Skipping a malformed device map in the response");
            continue;
        };

        let pinned_keys: HashMap<OwnedDeviceId, String> = store
            .get_all_user_devices(&user_id)
            .await
            .map_err(Arc::new)?
            .into_iter()
            .filter_map(|d| {
                let key = d.ed25519_key()?.to_owned();
                Some((d.device_id, key))
            })
            .collect();

        let mut validated = Vec::new();
        for (device_string, device) in devices {
            match validate_device(&user_id, device_string, device, &pinned_keys) {
                Ok(device) => validated.push(device),
                Err(error) => {
                    warn!(
                        user_id = %user_id,
                        device_id = device_string.as_str(),
                        %error,
                        "Discarding a device from the device list response"
                    );
                }
            }
        }

        debug!(
            user_id = %user_id,
            device_count = validated.len(),
            "Storing the refreshed device list"
        );

        store.set_active_user_devices(&user_id, validated).await.map_err(Arc::new)?;
    }

    Ok(())
}

/// Validate a single device record from a `/keys/query` response.
///
/// A device is accepted when its embedded ids match the enclosing keys, it
/// carries both an ed25519 and a curve25519 key, the ed25519 key matches the
/// one we may have pinned earlier for the same device id, and its
/// self-signature verifies over the canonical record.
fn validate_device(
    user_id: &UserId,
    device_id: &str,
    raw: &JsonValue,
    pinned_keys: &HashMap<OwnedDeviceId, String>,
) -> Result<DeviceKeys, DeviceValidationError> {
    let device: DeviceKeys = serde_json::from_value(raw.clone())?;

    if device.user_id != user_id {
        return Err(DeviceValidationError::UserIdMismatch);
    }

    if device.device_id != device_id {
        return Err(DeviceValidationError::DeviceIdMismatch);
    }

    let ed25519 = device.ed25519_key().ok_or(DeviceValidationError::MissingEd25519)?;
    let curve25519 = device.curve25519_key().ok_or(DeviceValidationError::MissingCurve25519)?;

    // Trust on first use: a device id never changes its identity key. A
    // mismatch means the server is replaying the id with new keys.
    if let Some(pinned) = pinned_keys.get(&device.device_id) {
        if pinned != ed25519 {
            return Err(DeviceValidationError::Ed25519Changed);
        }
    }

    let signing_key = Ed25519PublicKey::from_base64(ed25519)
        .map_err(|e| DeviceValidationError::InvalidKey(e.to_string()))?;
    Curve25519PublicKey::from_base64(curve25519)
        .map_err(|e| DeviceValidationError::InvalidKey(e.to_string()))?;

    let signature = device.self_signature().ok_or(DeviceValidationError::MissingSignature)?;
    let signature = Ed25519Signature::from_base64(signature)
        .map_err(|e| DeviceValidationError::InvalidSignature(e.to_string()))?;

    let canonical = canonical_signing_payload(raw)
        .map_err(|e| DeviceValidationError::Canonicalization(e.to_string()))?;

    signing_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|e| DeviceValidationError::SignatureVerification(e.to_string()))?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::DeviceTracker;
    use crate::{
        store::{CryptoStore, MemoryCryptoStore},
        testing::{MockTransport, TestDevice},
    };

    fn tracker_with(transport: Arc<MockTransport>) -> (DeviceTracker, Arc<MemoryCryptoStore>) {
        let store = Arc::new(MemoryCryptoStore::new());
        (DeviceTracker::new(store.clone(), transport), store)
    }

    #[tokio::test]
    async fn valid_devices_are_stored() {
        let user_id = user_id!("@ping:localhost");
        let device = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": { "@ping:localhost": { "HCDJLDXQHQ": device.signed_json() } }
        }));

        let (tracker, store) = tracker_with(transport);

        let devices = tracker.get_devices_for(&[user_id.to_owned()]).await.unwrap();
        assert_eq!(devices[user_id].len(), 1);
        assert_eq!(devices[user_id][0].device_id, "HCDJLDXQHQ");

        assert!(!store.is_user_outdated(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn changed_ed25519_key_is_rejected() {
        let user_id = user_id!("@ping:localhost");
        let original = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));

        let store = Arc::new(MemoryCryptoStore::new());
        store
            .set_active_user_devices(user_id, vec![original.device_keys()])
            .await
            .unwrap();
        store.flag_users_outdated(&[user_id.to_owned()]).await.unwrap();

        // Same device id, fresh keys, valid self-signature: only the pinned
        // ed25519 key gives the swap away.
        let impostor = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));
        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": { "@ping:localhost": { "HCDJLDXQHQ": impostor.signed_json() } }
        }));

        let tracker = DeviceTracker::new(store.clone(), transport);
        let devices = tracker.get_devices_for(&[user_id.to_owned()]).await.unwrap();

        assert!(devices[user_id].is_empty(), "the swapped device must not become active");

        let all = store.get_all_user_devices(user_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].ed25519_key(),
            original.device_keys().ed25519_key(),
            "the pinned record stays untouched"
        );
    }

    #[tokio::test]
    async fn mismatched_user_id_is_rejected() {
        let user_id = user_id!("@ping:localhost");

        // A device claiming to belong to someone else, next to a valid one.
        let foreign = TestDevice::generate(user_id!("@wrong:example.org"), device_id!("HCDJLDXQHQ"));
        let valid = TestDevice::generate(user_id, device_id!("OTHERDEV"));

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": {
                "@ping:localhost": {
                    "HCDJLDXQHQ": foreign.signed_json(),
                    "OTHERDEV": valid.signed_json(),
                }
            }
        }));

        let (tracker, _store) = tracker_with(transport);

        let devices = tracker.get_devices_for(&[user_id.to_owned()]).await.unwrap();
        let devices = &devices[user_id];
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "OTHERDEV");
    }

    #[tokio::test]
    async fn tampered_record_fails_the_signature_check() {
        let user_id = user_id!("@ping:localhost");
        let device = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));

        let mut tampered = device.signed_json();
        tampered["unsigned"] = json!({ "device_display_name": "unsigned is fair game" });
        tampered["algorithms"] = json!(["m.megolm.v1.aes-sha2", "m.fake.algorithm"]);

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": { "@ping:localhost": { "HCDJLDXQHQ": tampered } }
        }));

        let (tracker, _store) = tracker_with(transport);

        let devices = tracker.get_devices_for(&[user_id.to_owned()]).await.unwrap();
        assert!(devices[user_id].is_empty(), "a signed-content change must invalidate the device");
    }

    #[tokio::test]
    async fn unrequested_users_are_skipped() {
        let user_id = user_id!("@ping:localhost");
        let device = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));
        let stranger = TestDevice::generate(user_id!("@stranger:localhost"), device_id!("STRANGERD"));

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": {
                "@ping:localhost": { "HCDJLDXQHQ": device.signed_json() },
                "@stranger:localhost": { "STRANGERD": stranger.signed_json() },
            }
        }));

        let (tracker, store) = tracker_with(transport);

        tracker.update_users_device_lists(&[user_id.to_owned()]).await.unwrap();

        assert!(store
            .get_active_user_devices(user_id!("@stranger:localhost"))
            .await
            .unwrap()
            .is_empty());
        assert!(
            store.is_user_outdated(user_id!("@stranger:localhost")).await.unwrap(),
            "unrelated users must not be touched"
        );
    }

    #[tokio::test]
    async fn transport_errors_leave_users_outdated() {
        let user_id = user_id!("@ping:localhost");

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.fail_keys_query(true);

        let (tracker, store) = tracker_with(transport);
        store.flag_users_outdated(&[user_id.to_owned()]).await.unwrap();

        tracker
            .update_users_device_lists(&[user_id.to_owned()])
            .await
            .expect("a transport failure must not reject the caller");

        assert!(store.is_user_outdated(user_id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_cleanly() {
        let user_id = user_id!("@ping:localhost");
        let device = TestDevice::generate(user_id, device_id!("HCDJLDXQHQ"));

        let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));
        transport.set_keys_query_response(json!({
            "device_keys": { "@ping:localhost": { "HCDJLDXQHQ": device.signed_json() } }
        }));

        let (tracker, store) = tracker_with(transport.clone());
        let users = vec![user_id.to_owned()];

        let (first, second) = tokio::join!(
            tracker.update_users_device_lists(&users),
            tracker.update_users_device_lists(&users),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(store.get_active_user_devices(user_id).await.unwrap().len(), 1);
        assert!(tracker.in_flight.lock().unwrap().is_empty());
    }
}
