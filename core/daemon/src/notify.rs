//! Event fan-out for scan session observers.
//!
//! Publishing never blocks and never fails: with no subscribers an event only
//! lands in the history ring, and a slow subscriber lags (and is told how many
//! events it missed) instead of holding up the scan loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use toolcrib_protocol::ScanEvent;

#[derive(Clone)]
pub struct NotificationSink {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<ScanEvent>,
    history: Mutex<History>,
    history_capacity: usize,
}

#[derive(Default)]
struct History {
    events: VecDeque<ScanEvent>,
    last_sequence: u64,
}

impl NotificationSink {
    pub fn new(broadcast_capacity: usize, history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        let (tx, _rx) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                history: Mutex::new(History {
                    events: VecDeque::with_capacity(history_capacity),
                    last_sequence: 0,
                }),
                history_capacity,
            }),
        }
    }

    /// Stamps `event` with the next sequence number and the current time, then
    /// hands it to history and live subscribers.
    pub fn publish(&self, mut event: ScanEvent) -> ScanEvent {
        let mut history = self.lock_history();
        history.last_sequence += 1;
        event.sequence = history.last_sequence;
        event.emitted_at = Utc::now();

        if history.events.len() == self.inner.history_capacity {
            history.events.pop_front();
        }
        history.events.push_back(event.clone());

        // Err only means nobody is listening.
        let _ = self.inner.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.inner.tx.subscribe()
    }

    /// Subscribes and returns the retained events newer than `since`. Nothing
    /// is duplicated or lost between the two.
    pub fn subscribe_since(&self, since: u64) -> (broadcast::Receiver<ScanEvent>, Vec<ScanEvent>) {
        let history = self.lock_history();
        let rx = self.inner.tx.subscribe();
        let backlog = history
            .events
            .iter()
            .filter(|event| event.sequence > since)
            .cloned()
            .collect();
        (rx, backlog)
    }

    pub fn last_sequence(&self) -> u64 {
        self.lock_history().last_sequence
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, History> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolcrib_protocol::ScanEventKind;

    fn event(message: &str) -> ScanEvent {
        ScanEvent::new(ScanEventKind::StateReset, message)
    }

    #[test]
    fn publish_without_subscribers_keeps_history() {
        let sink = NotificationSink::new(4, 4);
        let first = sink.publish(event("one"));
        let second = sink.publish(event("two"));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(sink.last_sequence(), 2);
        assert_eq!(sink.subscribe_since(1).1.len(), 1);
        assert_eq!(sink.receiver_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let sink = NotificationSink::new(4, 2);
        for index in 0..5 {
            sink.publish(event(&format!("event {}", index)));
        }

        let (_rx, history) = sink.subscribe_since(0);
        let sequences: Vec<u64> = history.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
    }

    #[test]
    fn subscribers_receive_in_order() {
        let sink = NotificationSink::new(8, 8);
        let mut rx = sink.subscribe();

        sink.publish(event("one"));
        sink.publish(event("two"));

        assert_eq!(rx.try_recv().unwrap().message, "one");
        assert_eq!(rx.try_recv().unwrap().message, "two");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lagging_subscriber_is_told_how_many_it_missed() {
        let sink = NotificationSink::new(2, 8);
        let mut rx = sink.subscribe();
        for index in 0..5 {
            sink.publish(event(&format!("event {}", index)));
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(missed)) => assert_eq!(missed, 3),
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().sequence, 4);
    }

    #[test]
    fn subscribe_since_splits_backlog_and_live() {
        let sink = NotificationSink::new(8, 8);
        sink.publish(event("one"));
        sink.publish(event("two"));

        let (mut rx, backlog) = sink.subscribe_since(1);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].message, "two");

        sink.publish(event("three"));
        assert_eq!(rx.try_recv().unwrap().sequence, 3);
    }
}
