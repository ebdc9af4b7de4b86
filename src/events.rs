use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::response::Response;

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// the control connection was (re)established
    Connect,
    /// the control connection or a passive data connection went idle past
    ///  the configured timeout
    Timeout,
    Error(String),
    /// low-level event: every parsed response, including greetings and the
    ///  suppressed transfer terminals - should be uninteresting for typical
    ///  consumers
    Data(Response),
    Progress(ProgressData),
}

#[derive(Clone, Debug)]
pub struct ProgressData {
    pub filename: String,
    pub action: TransferAction,
    /// known up front for uploads with a sized source, unknown for downloads
    pub total: Option<u64>,
    pub transferred: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferAction {
    Get,
    Put,
}

#[async_trait::async_trait]
pub trait SessionEventListener: Sync + Send {
    async fn on_session_event(&self, event: SessionEvent);
}

/// Handle for unsubscribing a listener again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

/// Fans session events out to subscribed listeners.
///
/// Delivery is sequential and in subscription order: an event is awaited
///  through every listener before the next event is taken from the queue,
///  so each listener observes events exactly in emission order. A listener
///  that wants concurrency spawns its own work.
pub struct SessionEventNotifier {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SessionEventListener>)>>,
    next_id: AtomicU64,
}

impl SessionEventNotifier {
    pub fn new() -> SessionEventNotifier {
        SessionEventNotifier {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn try_remove_listener(&self, id: ListenerId) -> anyhow::Result<()> {
        let mut listeners = self.listeners.lock().unwrap();
        let count_before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        if listeners.len() == count_before {
            bail!("no listener subscribed under {:?}", id);
        }
        Ok(())
    }

    /// Drains the event queue until every [`EventSink`] is gone.
    pub async fn run_loop(&self, mut recv: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = recv.recv().await {
            let listeners = self.listeners.lock().unwrap().clone();
            for (_, listener) in listeners {
                listener.on_session_event(event.clone()).await;
            }
        }
    }
}

impl Default for SessionEventNotifier {
    fn default() -> Self {
        SessionEventNotifier::new()
    }
}

/// Cheap cloneable handle for emitting events from anywhere inside the
///  session, including non-async contexts. Emission never blocks protocol
///  work: when the queue is full the event is dropped.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}
impl EventSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> EventSink {
        EventSink { tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            trace!("dropping session event - queue full or notifier gone: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    struct Recorder {
        seen: Mutex<Vec<SessionEvent>>,
    }

    #[async_trait::async_trait]
    impl SessionEventListener for Recorder {
        async fn on_session_event(&self, event: SessionEvent) {
            self.seen.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_listener_registration_and_in_order_delivery() {
        let notifier = Arc::new(SessionEventNotifier::new());
        let (tx, rx) = mpsc::channel(8);
        {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_loop(rx).await });
        }

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let id = notifier.add_listener(recorder.clone());

        let sink = EventSink::new(tx);
        sink.emit(SessionEvent::Connect);
        sink.emit(SessionEvent::Timeout);

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let seen = recorder.seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert!(matches!(seen[0], SessionEvent::Connect));
            assert!(matches!(seen[1], SessionEvent::Timeout));
        }

        assert!(notifier.try_remove_listener(id).is_ok());
        assert!(notifier.try_remove_listener(id).is_err());
    }

    #[test]
    fn test_listener_ids_stay_distinct() {
        let notifier = SessionEventNotifier::new();
        let a = notifier.add_listener(Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        }));
        let b = notifier.add_listener(Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        }));
        assert_ne!(a, b);

        assert!(notifier.try_remove_listener(a).is_ok());
        assert!(notifier.try_remove_listener(a).is_err());
        assert!(notifier.try_remove_listener(b).is_ok());
    }
}
