use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Application-visible notifications. They are queued by the network tasks
///  and handed to listeners only when the host calls [EventQueue::tick], so
///  listener code never runs on a network task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// client: handshake started
    Connecting,
    /// client: handshake completed, session established
    Connected,
    /// the session ended - voluntarily, by denial, or by error
    Disconnected,
    PeerConnected(u8),
    PeerDisconnected(u8),
    PeerListChanged,
    ServerListChanged,
    DataReceived {
        module_id: Bytes,
        sender_id: u8,
        payload: Bytes,
    },
    LogMessage {
        severity: Severity,
        timestamp: SystemTime,
        text: String,
    },
}

pub trait TransportEventListener: Send + Sync {
    fn on_transport_event(&self, event: TransportEvent);
}

/// Queue between the network tasks and the host's main thread. Events
///  accumulate until the host drains them with [EventQueue::tick].
pub struct EventQueue {
    queue: Mutex<VecDeque<TransportEvent>>,
    listeners: Mutex<FxHashMap<Uuid, Arc<dyn TransportEventListener>>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            queue: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportEventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.lock().unwrap()
            .insert(id, listener);
        id
    }

    pub fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.lock().unwrap()
            .remove(listener_id)
        {
            None => Err(anyhow!("tried to remove a listener that was not (no longer?) registered: {}", listener_id)),
            Some(_) => Ok(()),
        }
    }

    pub fn push(&self, event: TransportEvent) {
        self.queue.lock().unwrap()
            .push_back(event);
    }

    /// convenience for the log upcall; mirrored into tracing
    pub fn log(&self, severity: Severity, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Info => info!("{}", text),
            Severity::Warning => warn!("{}", text),
            Severity::Error => error!("{}", text),
        }
        self.push(TransportEvent::LogMessage {
            severity,
            timestamp: SystemTime::now(),
            text,
        });
    }

    /// Drain all pending events into the registered listeners. Called by the
    ///  host environment, typically once per frame or loop iteration.
    pub fn tick(&self) {
        loop {
            let event = match self.queue.lock().unwrap().pop_front() {
                Some(event) => event,
                None => return,
            };

            let listeners = self.listeners.lock().unwrap()
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for listener in listeners {
                listener.on_transport_event(event.clone());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
