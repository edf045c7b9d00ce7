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

//! Property tests over the store invariants, driven against the in-memory
//! backend. The SQL backends share their semantics through the common
//! integration suite.

use std::sync::Arc;

use matrix_appservice_crypto::{
    ruma::{device_id, user_id, OwnedRoomId, RoomId},
    store::{CryptoStore, MemoryCryptoStore},
    types::{OlmSessionRecord, OutboundGroupSessionRecord},
};
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("the test runtime builds")
        .block_on(future)
}

fn room(index: u8) -> OwnedRoomId {
    RoomId::parse(format!("!room{index}:localhost")).unwrap()
}

fn outbound(room_id: &RoomId, session_id: String, is_current: bool) -> OutboundGroupSessionRecord {
    OutboundGroupSessionRecord {
        session_id,
        room_id: room_id.to_owned(),
        pickled: "pickle".to_owned(),
        is_current,
        uses_left: None,
        expires_ts: None,
    }
}

proptest! {
    // However sessions are stored, a room never has more than one current
    // outbound session, and the current one is the last stored with the flag.
    #[test]
    fn at_most_one_current_outbound_session(
        writes in prop::collection::vec((0u8..3, 0u8..5, any::<bool>()), 1..40)
    ) {
        block_on(async move {
            let store = MemoryCryptoStore::new();
            let mut last_current: Vec<Option<String>> = vec![None, None, None];

            for (room_index, session_index, is_current) in writes {
                let room_id = room(room_index);
                let session_id = format!("session{session_index}");

                store
                    .store_outbound_group_session(&outbound(&room_id, session_id.clone(), is_current))
                    .await
                    .unwrap();

                if is_current {
                    last_current[room_index as usize] = Some(session_id.clone());
                } else if last_current[room_index as usize].as_deref() == Some(&session_id) {
                    // Re-storing the current session without the flag demotes it.
                    last_current[room_index as usize] = None;
                }
            }

            for room_index in 0..3u8 {
                let current = store
                    .get_current_outbound_group_session(&room(room_index))
                    .await
                    .unwrap();

                prop_assert_eq!(
                    current.map(|s| s.session_id),
                    last_current[room_index as usize].clone()
                );
            }

            Ok(())
        })?;
    }

    // The current Olm session is the one with the newest decryption
    // timestamp, independent of insertion order.
    #[test]
    fn current_olm_session_is_the_newest(
        timestamps in prop::collection::vec(0i64..1_000_000, 1..20)
    ) {
        block_on(async move {
            let store = MemoryCryptoStore::new();
            let user_id = user_id!("@ping:localhost");
            let device_id = device_id!("HCDJLDXQHQ");

            for (index, ts) in timestamps.iter().enumerate() {
                let session = OlmSessionRecord {
                    session_id: format!("session{index}"),
                    pickled: "pickle".to_owned(),
                    last_decryption_ts: *ts,
                };
                store.store_olm_session(user_id, device_id, &session).await.unwrap();
            }

            let newest = *timestamps.iter().max().unwrap();
            let current =
                store.get_current_olm_session(user_id, device_id).await.unwrap().unwrap();
            prop_assert_eq!(current.last_decryption_ts, newest);

            let sessions = store.get_olm_sessions(user_id, device_id).await.unwrap();
            let returned: Vec<i64> = sessions.iter().map(|s| s.last_decryption_ts).collect();
            let mut sorted = timestamps.clone();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            prop_assert_eq!(returned, sorted);

            Ok(())
        })?;
    }

    // The first event to claim a (session, ratchet index) pair keeps it; a
    // namespaced view never observes another namespace's claims.
    #[test]
    fn message_indices_pin_the_first_event(
        indices in prop::collection::vec(0u32..8, 1..30)
    ) {
        block_on(async move {
            let store = MemoryCryptoStore::new();
            let view = store.storage_for_user(user_id!("@virtual:localhost"));
            let room_id = room(0);

            let mut first_claim: Vec<Option<String>> = vec![None; 8];

            for (write, index) in indices.iter().enumerate() {
                let event_id = format!("$event{write}");
                store
                    .set_message_index_for_event(
                        &room_id,
                        <&matrix_appservice_crypto::ruma::EventId>::try_from(event_id.as_str())
                            .unwrap(),
                        "session",
                        *index,
                    )
                    .await
                    .unwrap();

                first_claim[*index as usize].get_or_insert(event_id);
            }

            for index in 0u32..8 {
                let stored = store
                    .get_event_for_message_index(&room_id, "session", index)
                    .await
                    .unwrap()
                    .map(|e| e.to_string());
                prop_assert_eq!(stored, first_claim[index as usize].clone());

                prop_assert_eq!(
                    view.get_event_for_message_index(&room_id, "session", index).await.unwrap(),
                    None
                );
            }

            Ok(())
        })?;
    }
}

#[derive(Debug)]
struct _AssertStoreIsObjectSafe(Arc<dyn CryptoStore>);
