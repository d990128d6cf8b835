//! Process-scoped event notifier.
//!
//! Created once at startup, cloned into every component that emits events,
//! and closed at shutdown. Closing drops the broadcast sender so that every
//! subscriber observes the end of the stream.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::Event;

#[derive(Clone)]
pub struct Notifier {
    sender: Arc<RwLock<Option<broadcast::Sender<Event>>>>,
}

impl Notifier {
    /// Open a notifier buffering up to `capacity` events per subscriber.
    pub fn open(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// Publish an event. Returns false when closed or nobody is listening.
    pub fn notify(&self, event: Event) -> bool {
        let Ok(guard) = self.sender.read() else {
            return false;
        };
        match guard.as_ref() {
            Some(sender) => {
                let kind = event.kind;
                let delivered = sender.send(event).is_ok();
                debug!(?kind, delivered, "event published");
                delivered
            }
            None => false,
        }
    }

    /// Subscribe to future events. A closed notifier yields a receiver that
    /// reports `Closed` immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        if let Ok(guard) = self.sender.read()
            && let Some(sender) = guard.as_ref()
        {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(1);
        drop(sender);
        receiver
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.write()
            && guard.take().is_some()
        {
            debug!("notifier closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().map(|g| g.is_none()).unwrap_or(true)
    }
}
