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

//! Out-of-band notifications the subsystem emits.

use tokio::sync::broadcast;

/// Events interested callers can subscribe to.
#[derive(Clone, Debug)]
pub enum CryptoEvent {
    /// A room-key backup upload failed. Backups are best-effort: the upload
    /// isn't retried until the next backup drain.
    BackupFailed {
        /// A human-readable description of the failure.
        error: String,
    },
}

/// A broadcast bus for [`CryptoEvent`]s.
///
/// Emitting never blocks; events sent while nobody subscribes are dropped.
#[derive(Clone, Debug)]
pub struct CryptoEvents {
    sender: broadcast::Sender<CryptoEvent>,
}

impl Default for CryptoEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoEvents {
    const CAPACITY: usize = 64;

    /// Create a fresh event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CryptoEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: CryptoEvent) {
        // An error only means there are no receivers right now.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let events = CryptoEvents::new();
        let mut receiver = events.subscribe();

        events.emit(CryptoEvent::BackupFailed { error: "boom".to_owned() });

        let CryptoEvent::BackupFailed { error } = receiver.recv().await.unwrap();
        assert_eq!(error, "boom");
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let events = CryptoEvents::new();
        events.emit(CryptoEvent::BackupFailed { error: "boom".to_owned() });
    }
}
