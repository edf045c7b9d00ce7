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

//! End-to-end flows through the public `CryptoClient` surface, with the
//! machine and transport replaced by their scriptable test doubles.

use std::sync::Arc;

use matrix_appservice_crypto::{
    ruma::{device_id, room_id, user_id, EventEncryptionAlgorithm},
    store::MemoryCryptoStore,
    testing::{MockMachine, MockTransport, RecordedRequest},
    types::{KeyBackupInfo, MEGOLM_BACKUP_V1},
    CryptoClient,
};
use serde_json::json;

struct TestSetup {
    client: CryptoClient,
    machine: Arc<MockMachine>,
    transport: Arc<MockTransport>,
}

async fn prepared_client() -> TestSetup {
    let store = Arc::new(MemoryCryptoStore::new());
    let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
    let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

    let room_id = room_id!("!encrypted:localhost");
    transport.set_state_event(
        room_id,
        "m.room.encryption",
        "",
        json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "rotation_period_ms": 604800000,
            "rotation_period_msgs": 100,
        }),
    );
    transport.add_members(room_id, "join", &[user_id!("@bot:localhost"), user_id!("@ping:localhost")]);

    let client =
        CryptoClient::new(user_id!("@bot:localhost"), store, machine.clone(), transport.clone());
    client.prepare(vec![room_id.to_owned()]).await.unwrap();

    TestSetup { client, machine, transport }
}

fn put_room_keys(transport: &MockTransport) -> Vec<(String, serde_json::Value)> {
    transport
        .recorded()
        .into_iter()
        .filter_map(|r| match r {
            RecordedRequest::PutRoomKeys { version, rooms } => Some((version, rooms)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn encrypting_produces_a_full_envelope() {
    let setup = prepared_client().await;
    let room_id = room_id!("!encrypted:localhost");

    let content = json!({ "msgtype": "m.text", "body": "hello" });
    let encrypted =
        setup.client.encrypt_room_event(room_id, "m.room.message", &content).await.unwrap();

    assert_eq!(encrypted.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);
    assert!(!encrypted.sender_key.is_empty());
    assert!(!encrypted.ciphertext.is_empty());
    assert!(!encrypted.session_id.is_empty());
    assert_eq!(encrypted.device_id, device_id!("BOTDEV"));

    // The room key went out before the event was encrypted.
    assert!(setup
        .transport
        .recorded()
        .iter()
        .any(|r| matches!(r, RecordedRequest::ToDevice { .. })));
}

#[tokio::test]
async fn encrypted_events_decrypt_back_to_the_original() {
    let setup = prepared_client().await;
    let room_id = room_id!("!encrypted:localhost");

    let content = json!({ "msgtype": "m.text", "body": "round trip" });
    let encrypted =
        setup.client.encrypt_room_event(room_id, "m.room.message", &content).await.unwrap();

    let mut event = json!({
        "event_id": "$roundtrip",
        "type": "m.room.encrypted",
        "content": serde_json::to_value(&encrypted).unwrap(),
    });
    event["content"]["message_index"] = json!(1);

    let decrypted = setup.client.decrypt_room_event(room_id, &event).await.unwrap();
    assert_eq!(decrypted.cleartext["type"], "m.room.message");
    assert_eq!(decrypted.cleartext["content"], content);
    assert_eq!(decrypted.session_id, encrypted.session_id);
}

#[tokio::test]
async fn backup_creation_roundtrips_through_the_server() {
    let setup = prepared_client().await;

    let info = KeyBackupInfo {
        algorithm: MEGOLM_BACKUP_V1.to_owned(),
        auth_data: json!({ "public_key": "backup_public_key" }),
    };

    let version = setup.client.sign_and_create_key_backup_version(info).await.unwrap();
    assert_eq!(version, "1");

    let fetched = setup.client.get_key_backup_version().await.unwrap().unwrap();
    assert_eq!(fetched.version, "1");
    assert_eq!(fetched.count, 0);
    assert_eq!(fetched.etag, "etag0");
    assert_eq!(fetched.algorithm, MEGOLM_BACKUP_V1);

    // Our own signature landed in the stored auth data.
    let signature = fetched.auth_data["signatures"]["@bot:localhost"]["ed25519:BOTDEV"]
        .as_str()
        .unwrap();
    assert!(!signature.is_empty());
}

#[tokio::test]
async fn backup_drains_follow_session_rotation() {
    let setup = prepared_client().await;
    let room_id = room_id!("!encrypted:localhost");

    // First encrypt creates the first session.
    setup
        .client
        .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "one" }))
        .await
        .unwrap();
    let first_session = setup.machine.current_session_id(room_id).unwrap();

    // Creating and enabling the backup uploads everything pending.
    let info = KeyBackupInfo {
        algorithm: MEGOLM_BACKUP_V1.to_owned(),
        auth_data: json!({ "public_key": "backup_public_key" }),
    };
    setup.client.sign_and_create_key_backup_version(info).await.unwrap();
    let version = setup.client.get_key_backup_version().await.unwrap().unwrap();
    setup.client.enable_key_backup(&version).await.unwrap();

    let puts = put_room_keys(&setup.transport);
    assert_eq!(puts.len(), 1);
    assert!(
        puts[0].1["rooms"]["!encrypted:localhost"]["sessions"][&first_session].is_object(),
        "the first session was uploaded when the backup was enabled"
    );

    // A second encrypt rotates to a new session; draining uploads it.
    setup
        .client
        .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "two" }))
        .await
        .unwrap();
    let second_session = setup.machine.current_session_id(room_id).unwrap();
    assert_ne!(first_session, second_session);

    setup.client.backup_room_keys().await.unwrap();

    let puts = put_room_keys(&setup.transport);
    assert!(
        puts.iter().any(|(_, rooms)| {
            rooms["rooms"]["!encrypted:localhost"]["sessions"][&second_session].is_object()
        }),
        "the rotated session was uploaded"
    );

    // After disabling, new sessions stay local.
    setup.client.disable_key_backup().await.unwrap();
    let puts_before = put_room_keys(&setup.transport).len();

    setup
        .client
        .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "three" }))
        .await
        .unwrap();

    assert_eq!(
        put_room_keys(&setup.transport).len(),
        puts_before,
        "no uploads happen after the backup is disabled"
    );

    let counts = setup.client.get_key_backup_version().await.unwrap().unwrap();
    assert_eq!(counts.count, 2, "both shared sessions ended up in the backup");
}

#[tokio::test]
async fn exported_room_keys_describe_the_session() {
    let setup = prepared_client().await;
    let room_id = room_id!("!encrypted:localhost");

    setup
        .client
        .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "export me" }))
        .await
        .unwrap();
    let session_id = setup.machine.current_session_id(room_id).unwrap();

    let export = setup.client.export_room_keys_for_session(room_id, &session_id).await.unwrap();

    let export = export.as_array().expect("the export is a JSON array");
    assert_eq!(export.len(), 1);
    assert_eq!(export[0]["room_id"], "!encrypted:localhost");
    assert_eq!(export[0]["session_id"], session_id.as_str());
    assert!(!export[0]["session_key"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn the_sent_session_ledger_tracks_recipients() {
    let store = Arc::new(MemoryCryptoStore::new());
    let machine = Arc::new(MockMachine::new(user_id!("@bot:localhost")));
    let transport = Arc::new(MockTransport::new(device_id!("BOTDEV")));

    let room_id = room_id!("!encrypted:localhost");
    transport.set_state_event(
        room_id,
        "m.room.encryption",
        "",
        json!({ "algorithm": "m.megolm.v1.aes-sha2" }),
    );
    transport.add_members(room_id, "join", &[user_id!("@ping:localhost")]);

    let client = CryptoClient::new(
        user_id!("@bot:localhost"),
        store.clone(),
        machine.clone(),
        transport,
    );
    client.prepare(vec![]).await.unwrap();

    client
        .encrypt_room_event(room_id, "m.room.message", &json!({ "body": "ledger" }))
        .await
        .unwrap();

    use matrix_appservice_crypto::store::CryptoStore;

    let session = store.get_current_outbound_group_session(room_id).await.unwrap().unwrap();
    let target = &machine.last_share_targets()[0];

    let ledger = store
        .get_last_sent_room_key(&target.user_id, &target.device_id, room_id)
        .await
        .unwrap()
        .expect("the share was recorded");
    assert_eq!(ledger.session_id, session.session_id);
    assert_eq!(ledger.session_index, 0);
}
