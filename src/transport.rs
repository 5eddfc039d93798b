use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;

/// The pub/sub capability a routing node needs from its transport: connect
/// once, publish to one channel, broadcast to several, and receive a
/// stream of raw payloads addressed to this node's own channel.
///
/// A real backend (Redis, XMPP, anything with a channel-keyed pub/sub
/// model) is an external collaborator and out of scope here; this crate
/// ships [`InProcessBus`], a fully functional single-process
/// implementation used for tests and single-host demos.
pub trait Transport: Send + Sync {
    fn connect(&self) -> Result<(), TransportError>;
    fn close(&self) -> Result<(), TransportError>;
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn broadcast(&self, channels: &[String], payload: &[u8]) -> Result<(), TransportError>;
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;
}

type Mailboxes = HashMap<String, Sender<Vec<u8>>>;

/// A keyed channel bus shared by every node in a single process. Each node
/// registers its own channel name and gets back an [`InProcessBus`] handle
/// bound to it; `publish`/`broadcast` look up peer channels in the shared
/// registry.
#[derive(Clone)]
pub struct BusRegistry {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BusRegistry {
    pub fn new() -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, channel: impl Into<String>) -> InProcessBus {
        let channel = channel.into();
        let (tx, rx) = std::sync::mpsc::channel();
        self.mailboxes.lock().unwrap().insert(channel.clone(), tx);
        InProcessBus {
            my_channel: channel,
            registry: self.mailboxes.clone(),
            inbox: Mutex::new(rx),
        }
    }
}

pub struct InProcessBus {
    my_channel: String,
    registry: Arc<Mutex<Mailboxes>>,
    inbox: Mutex<Receiver<Vec<u8>>>,
}

impl Transport for InProcessBus {
    fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.registry.lock().unwrap().remove(&self.my_channel);
        Ok(())
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mailboxes = self.registry.lock().unwrap();
        let Some(sender) = mailboxes.get(channel) else {
            return Err(TransportError::ChannelUnknown(channel.to_string()));
        };
        sender
            .send(payload.to_vec())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn broadcast(&self, channels: &[String], payload: &[u8]) -> Result<(), TransportError> {
        for channel in channels {
            // Best-effort: one stale peer shouldn't stop delivery to the rest.
            let _ = self.publish(channel, payload);
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let inbox = self.inbox.lock().unwrap();
        match inbox.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::NotConnected),
        }
    }
}
