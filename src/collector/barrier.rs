// Copyright 2025 ix-exporter developers
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

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Join counter armed with one unit per participant.
///
/// Arrivals past zero are ignored, so a participant that reports twice cannot
/// release a waiter early in a later round.
#[derive(Debug)]
pub struct JoinCounter {
    pending: AtomicUsize,
    notify: Notify,
}

impl JoinCounter {
    pub fn new(participants: usize) -> Self {
        Self {
            pending: AtomicUsize::new(participants),
            notify: Notify::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Record one arrival. Returns true for the arrival that reached zero.
    pub fn arrive(&self) -> bool {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Resolve once every participant has arrived.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the check so an arrival in between is not lost.
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_zero_participants_is_ready() {
        let counter = JoinCounter::new(0);
        tokio::time::timeout(Duration::from_millis(100), counter.wait())
            .await
            .unwrap();
        assert!(!counter.arrive());
    }

    #[tokio::test]
    async fn test_wait_until_all_arrive() {
        let counter = Arc::new(JoinCounter::new(2));
        let waiter = tokio::spawn({
            let counter = counter.clone();
            async move { counter.wait().await }
        });

        assert!(!counter.arrive());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(counter.arrive());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.pending(), 0);
    }

    #[test]
    fn test_extra_arrivals_saturate() {
        let counter = JoinCounter::new(1);
        assert!(counter.arrive());
        assert!(!counter.arrive());
        assert_eq!(counter.pending(), 0);
    }
}
