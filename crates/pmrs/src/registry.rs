use crate::error::RegisterError;
use crate::metrics::counters;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pmr_common::types::{self, reason};
use pmr_common::{Forwarded, Reply, Username};
use tokio::sync::mpsc;

/// Process-unique connection identifier.
pub type ConnId = u64;

/// Work queued to a connection's task by other connections.
#[derive(Debug)]
pub enum Outbound {
    /// A control reply produced on behalf of this connection (ack or error).
    Reply(Reply),
    /// A message to write to this connection's socket.
    Forward(Forward),
}

/// A message in flight from one connection to another.
#[derive(Debug)]
pub struct Forward {
    /// Payload to write to the recipient.
    pub frame: Forwarded,
    /// Name the sender addressed.
    pub to: Username,
    /// Slot reserved in the sender's queue for the `delivered` ack or the
    /// failure reply. Settling a forward never competes for queue space.
    pub reply: mpsc::OwnedPermit<Outbound>,
}

impl Forward {
    /// Tell the sender the forward reached the recipient's socket.
    pub fn acknowledge(self) {
        counters::messages_relayed_total();
        let ack = Reply::delivered(self.to, types::now());
        self.reply.send(Outbound::Reply(ack));
    }

    /// Tell the sender the recipient went away before the forward was written.
    pub fn bounce(self) {
        counters::messages_dropped_total("offline");
        self.reply
            .send(Outbound::Reply(Reply::error(reason::RECIPIENT_OFFLINE)));
    }
}

/// Handle held in the registry, used to queue work for a connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Connection this handle belongs to.
    pub id: ConnId,
    /// Channel sender for the connection's outbound queue.
    pub tx: mpsc::Sender<Outbound>,
}

/// Concurrent name → connection registry.
#[derive(Debug, Default)]
pub struct Registry {
    routes: DashMap<Username, ConnHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `handle` unless the name is already held.
    ///
    /// The presence check and the insert happen under one shard lock, so two
    /// racing registrations for the same name cannot both succeed. Returns the
    /// registry size after insertion.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Taken`] if another entry holds the name.
    pub fn try_insert(&self, name: &str, handle: ConnHandle) -> Result<usize, RegisterError> {
        match self.routes.entry(name.to_owned()) {
            Entry::Occupied(_) => return Err(RegisterError::Taken(name.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }
        // The shard guard must be released before len() locks every shard.
        Ok(self.routes.len())
    }

    /// Remove `name` only if it is still held by connection `id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if(&self, name: &str, id: ConnId) -> bool {
        self.routes.remove_if(name, |_k, v| v.id == id).is_some()
    }

    /// Look up a connection handle by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ConnHandle> {
        self.routes.get(name).map(|entry| entry.value().clone())
    }

    /// Run `f` against the handle for `name` while holding its shard lock.
    ///
    /// A concurrent [`Registry::remove_if`] for the same name cannot interleave
    /// with `f`. `f` must not call back into the registry.
    pub fn with_handle<R>(&self, name: &str, f: impl FnOnce(&ConnHandle) -> R) -> Option<R> {
        self.routes.get(name).map(|entry| f(entry.value()))
    }

    /// Connection currently holding `name`, if any.
    #[must_use]
    pub fn holder(&self, name: &str) -> Option<ConnId> {
        self.routes.get(name).map(|entry| entry.value().id)
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no name is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
