//! Alert gating.
//!
//! Operators depend on this contract: at most one notification per distinct
//! error kind per cooldown window (five minutes by default), however many
//! items are abandoned with that kind in the meantime. The gate sits in
//! front of the fire-and-forget notifier; the pipeline never depends on
//! delivery succeeding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::clients::Notifier;
use crate::model::ErrorKind;

pub struct AlertGate {
    notifier: Arc<dyn Notifier>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<ErrorKind, Instant>>,
}

impl AlertGate {
    pub fn new(notifier: Arc<dyn Notifier>, cooldown: Duration) -> Self {
        Self {
            notifier,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Send a notification unless one for the same kind went out within the
    /// cooldown. Returns whether anything was sent.
    pub async fn alert(&self, kind: ErrorKind, title: &str, message: &str) -> bool {
        if !self.should_send(kind, Instant::now()) {
            debug!(kind = %kind, "alert suppressed by cooldown");
            return false;
        }
        self.notifier.notify(title, message).await;
        true
    }

    fn should_send(&self, kind: ErrorKind, now: Instant) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        match last_sent.get(&kind) {
            Some(prev) if now.duration_since(*prev) < self.cooldown => false,
            _ => {
                last_sent.insert(kind, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _title: &str, _message: &str) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gate(cooldown: Duration) -> (AlertGate, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicUsize::new(0),
        });
        (
            AlertGate::new(notifier.clone(), cooldown),
            notifier,
        )
    }

    #[tokio::test]
    async fn same_kind_is_suppressed_within_cooldown() {
        let (gate, notifier) = gate(Duration::from_secs(300));

        assert!(gate.alert(ErrorKind::Auth, "t", "m").await);
        assert!(!gate.alert(ErrorKind::Auth, "t", "m").await);
        assert!(!gate.alert(ErrorKind::Auth, "t", "m").await);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_kinds_are_gated_independently() {
        let (gate, notifier) = gate(Duration::from_secs(300));

        assert!(gate.alert(ErrorKind::Auth, "t", "m").await);
        assert!(gate.alert(ErrorKind::Network, "t", "m").await);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sends_again_after_cooldown() {
        let (gate, _) = gate(Duration::from_millis(0));
        assert!(gate.should_send(ErrorKind::Auth, Instant::now()));
        assert!(gate.should_send(
            ErrorKind::Auth,
            Instant::now() + Duration::from_millis(1)
        ));
    }
}
