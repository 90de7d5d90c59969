use std::sync::Arc;
use std::time::Duration;

use tern_core::event::{self, EventBus, EventPayload, EventSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const HISTORY_CHANGED_CHANNEL: &str = "xmpp.mam.history.changed";

/// Coalesces bursts of archive deliveries into a single history-changed event.
#[derive(Clone)]
pub struct HistoryNotifier {
    tx: mpsc::UnboundedSender<()>,
}

impl HistoryNotifier {
    /// Spawn the debounce task. It stops once every notifier clone is dropped.
    pub fn spawn(
        event_bus: Option<Arc<dyn EventBus>>,
        quiet_period: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce(rx, event_bus, quiet_period));
        (Self { tx }, task)
    }

    pub fn notify(&self) {
        let _ = self.tx.send(());
    }
}

async fn debounce(
    mut rx: mpsc::UnboundedReceiver<()>,
    event_bus: Option<Arc<dyn EventBus>>,
    quiet_period: Duration,
) {
    while rx.recv().await.is_some() {
        let mut coalesced = 1_u32;
        loop {
            match tokio::time::timeout(quiet_period, rx.recv()).await {
                Ok(Some(())) => coalesced += 1,
                Ok(None) => {
                    publish(event_bus.as_deref(), coalesced);
                    return;
                }
                Err(_) => break,
            }
        }
        publish(event_bus.as_deref(), coalesced);
    }
}

fn publish(event_bus: Option<&dyn EventBus>, coalesced: u32) {
    debug!(coalesced, "archive history changed");
    if let Some(bus) = event_bus {
        event::emit(
            bus,
            HISTORY_CHANGED_CHANNEL,
            EventSource::System("mam".into()),
            EventPayload::HistoryChanged,
        );
    }
}

#[cfg(test)]
mod tests {
    use tern_core::event::BroadcastEventBus;

    use super::*;

    fn bus() -> Arc<BroadcastEventBus> {
        Arc::new(BroadcastEventBus::default())
    }

    fn spawn_notifier(bus: &Arc<BroadcastEventBus>) -> (HistoryNotifier, JoinHandle<()>) {
        let bus: Arc<dyn EventBus> = bus.clone();
        HistoryNotifier::spawn(Some(bus), Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_event() {
        let bus = bus();
        let mut sub = bus.subscribe(HISTORY_CHANGED_CHANNEL).unwrap();
        let (notifier, _task) = spawn_notifier(&bus);

        notifier.notify();
        tokio::time::sleep(Duration::from_millis(5)).await;
        notifier.notify();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = sub.try_recv().expect("one history event");
        assert!(matches!(event.payload, EventPayload::HistoryChanged));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn separated_notifications_emit_separately() {
        let bus = bus();
        let mut sub = bus.subscribe(HISTORY_CHANGED_CHANNEL).unwrap();
        let (notifier, _task) = spawn_notifier(&bus);

        notifier.notify();
        tokio::time::sleep(Duration::from_millis(30)).await;
        notifier.notify();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_emitted_without_notifications() {
        let bus = bus();
        let mut sub = bus.subscribe(HISTORY_CHANGED_CHANNEL).unwrap();
        let (_notifier, _task) = spawn_notifier(&bus);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_burst_is_flushed_when_notifiers_drop() {
        let bus = bus();
        let mut sub = bus.subscribe(HISTORY_CHANGED_CHANNEL).unwrap();
        let (notifier, task) = spawn_notifier(&bus);

        notifier.notify();
        drop(notifier);
        task.await.unwrap();

        assert!(sub.try_recv().is_some());
    }
}
