use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Opaque per-connection identity, issued once per connection.
pub type ClientId = u64;

/// The hub's view of one connected party. Holds the only sender for the
/// client's outbound queue: removing the handle from the hub drops the
/// sender, which closes the queue and stops the write pump.
pub struct ClientHandle {
    pub id: ClientId,
    pub tx: mpsc::Sender<Vec<u8>>,
}

pub enum HubEvent {
    Join(ClientHandle),
    Leave(ClientId),
    Broadcast { from: ClientId, payload: Vec<u8> },
}

/// Single authority over membership and fan-out. All mutation happens on
/// the one task driving [`Hub::run`], so no locking is needed.
pub struct Hub {
    members: HashMap<ClientId, ClientHandle>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Drain events until every sender is gone. Spawn as a tokio task.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HubEvent>) {
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
        debug!("hub stopped");
    }

    fn apply(&mut self, event: HubEvent) {
        match event {
            HubEvent::Join(handle) => self.join(handle),
            HubEvent::Leave(id) => self.leave(id),
            HubEvent::Broadcast { from, payload } => self.broadcast(from, payload),
        }
    }

    fn join(&mut self, handle: ClientHandle) {
        info!(id = handle.id, total = self.members.len() + 1, "+client");
        self.members.insert(handle.id, handle);
    }

    /// Idempotent: the handle is dropped (and its queue closed) at most
    /// once, on the first Leave that finds it registered.
    fn leave(&mut self, id: ClientId) {
        if self.members.remove(&id).is_some() {
            info!(id, total = self.members.len(), "-client");
        }
    }

    /// Fan the payload out to every member except the sender. A member
    /// whose queue is full gets evicted instead of stalling the rest.
    fn broadcast(&mut self, from: ClientId, payload: Vec<u8>) {
        let mut evicted = Vec::new();
        for (id, handle) in &self.members {
            if *id == from {
                continue;
            }
            if handle.tx.try_send(payload.clone()).is_err() {
                evicted.push(*id);
            }
        }
        for id in evicted {
            info!(id, "dropping slow client");
            self.leave(id);
        }
    }

    #[cfg(test)]
    fn contains(&self, id: ClientId) -> bool {
        self.members.contains_key(&id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.members.len()
    }
}
