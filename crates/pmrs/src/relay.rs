//! Name binding and message dispatch.
//!
//! Each connection owns a [`Session`] that moves through
//! `Unregistered → Registered → Closed`. The [`Relay`] applies client frames
//! to sessions against the shared [`Registry`] and produces the reply the
//! connection task writes back to its own socket. Forwards are queued on the
//! recipient's channel; the recipient's task writes them and settles the
//! sender's ack.

use crate::config::{ReregisterPolicy, ServerConfig};
use crate::error::RegisterError;
use crate::metrics::{counters, gauges};
use crate::registry::{ConnHandle, ConnId, Forward, Outbound, Registry};
use pmr_common::types::{self, reason};
use pmr_common::{ClientFrame, Forwarded, Reply, Username};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

/// Lifecycle of a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no name bound.
    Unregistered,
    /// Bound to a name held in the registry.
    Registered(Username),
    /// Torn down. Terminal.
    Closed,
}

/// Per-connection state owned by the connection task.
#[derive(Debug)]
pub struct Session {
    id: ConnId,
    state: SessionState,
    tx: mpsc::Sender<Outbound>,
}

impl Session {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bound name, if registered.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered(name) => Some(name.as_str()),
            _ => None,
        }
    }

    fn handle(&self) -> ConnHandle {
        ConnHandle {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

/// Shared relay: the registry plus the dispatch rules applied to it.
#[derive(Debug)]
pub struct Relay {
    registry: Registry,
    policy: ReregisterPolicy,
    max_message_bytes: usize,
    queue_capacity: usize,
    next_id: AtomicU64,
}

impl Relay {
    /// Create a relay with an empty registry.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            policy: config.reregister,
            max_message_bytes: config.max_message_bytes,
            queue_capacity: config.queue_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// The name registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start a session for a newly accepted connection.
    ///
    /// Returns the session and the receiving half of its outbound queue.
    /// Nothing is registered until the client sends a registration frame.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        debug!(conn_id = id, "session opened");
        (
            Session {
                id,
                state: SessionState::Unregistered,
                tx,
            },
            rx,
        )
    }

    /// Apply one raw client frame to `session`.
    ///
    /// Returns the reply to send back on the same connection, or `None` when
    /// the frame needs no immediate answer: a queued forward (settled later
    /// through the sender's queue), an unrecognized shape, or an ignored
    /// re-registration.
    pub fn handle_frame(&self, session: &mut Session, data: &[u8]) -> Option<Reply> {
        if session.state == SessionState::Closed {
            debug!(conn_id = session.id, "frame on closed session dropped");
            return None;
        }

        let frame = match ClientFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = session.id, error = %e, "malformed frame");
                counters::frames_rejected_total("invalid_format");
                return Some(Reply::error(reason::INVALID_FORMAT));
            }
        };

        match frame {
            ClientFrame::Register { username } => self.register(session, username),
            ClientFrame::Send { to, message } => self.send(session, to, message),
            ClientFrame::Unrecognized => {
                debug!(conn_id = session.id, "ignoring frame of unrecognized shape");
                None
            }
        }
    }

    fn register(&self, session: &mut Session, username: Username) -> Option<Reply> {
        let current = match &session.state {
            SessionState::Unregistered => None,
            SessionState::Registered(name) => Some(name.clone()),
            SessionState::Closed => return None,
        };

        let Some(current) = current else {
            return Some(self.bind(session, username));
        };

        match self.policy {
            ReregisterPolicy::Reject => {
                counters::registrations_total("already_registered");
                Some(Reply::error(reason::ALREADY_REGISTERED))
            }
            ReregisterPolicy::Ignore => {
                debug!(conn_id = session.id, name = %current, "ignoring re-registration");
                None
            }
            ReregisterPolicy::Rebind if current == username => {
                Some(Reply::registered(username, self.registry.len()))
            }
            ReregisterPolicy::Rebind => {
                let reply = self.bind(session, username);
                if session.name() != Some(current.as_str()) {
                    self.registry.remove_if(&current, session.id);
                    gauges::set_users_registered(self.registry.len());
                    info!(conn_id = session.id, old = %current, "released previous name");
                    if let Reply::Registered { username, .. } = reply {
                        return Some(Reply::registered(username, self.registry.len()));
                    }
                }
                Some(reply)
            }
        }
    }

    /// Claim `username` for `session`, leaving the session untouched on conflict.
    fn bind(&self, session: &mut Session, username: Username) -> Reply {
        match self.registry.try_insert(&username, session.handle()) {
            Ok(online) => {
                counters::registrations_total("registered");
                gauges::set_users_registered(online);
                info!(conn_id = session.id, name = %username, online, "user registered");
                session.state = SessionState::Registered(username.clone());
                Reply::registered(username, online)
            }
            Err(RegisterError::Taken(name)) => {
                counters::registrations_total("taken");
                debug!(conn_id = session.id, name = %name, "username already in use");
                Reply::error(reason::USERNAME_TAKEN)
            }
        }
    }

    fn send(&self, session: &Session, to: Username, message: String) -> Option<Reply> {
        let Some(from) = session.name() else {
            counters::frames_rejected_total("unregistered");
            return Some(Reply::error(reason::REGISTER_FIRST));
        };

        if message.len() > self.max_message_bytes {
            counters::messages_dropped_total("oversize");
            return Some(Reply::error(reason::MESSAGE_TOO_LARGE));
        }

        // Reserve the sender's slot for the eventual ack or bounce up front.
        let Ok(reply) = session.tx.clone().try_reserve_owned() else {
            counters::messages_dropped_total("sender_busy");
            debug!(from = %from, to = %to, "sender queue full");
            return Some(Reply::error(reason::RECIPIENT_BUSY));
        };

        let fwd = Forward {
            frame: Forwarded {
                from: from.to_owned(),
                message,
                timestamp: types::now(),
            },
            to: to.clone(),
            reply,
        };

        // Enqueue under the recipient's shard lock so a concurrent teardown
        // either sees this forward in its queue or we see the name gone.
        let outcome = self
            .registry
            .with_handle(&to, |handle| (handle.id, handle.tx.try_send(Outbound::Forward(fwd))));

        match outcome {
            None => {
                counters::messages_dropped_total("offline");
                debug!(from = %from, to = %to, "recipient not found");
                Some(Reply::error(reason::RECIPIENT_OFFLINE))
            }
            Some((_, Ok(()))) => {
                debug!(from = %from, to = %to, "message queued for recipient");
                None
            }
            Some((_, Err(TrySendError::Full(_)))) => {
                counters::messages_dropped_total("busy");
                debug!(from = %from, to = %to, "recipient queue full");
                Some(Reply::error(reason::RECIPIENT_BUSY))
            }
            Some((id, Err(TrySendError::Closed(_)))) => {
                counters::messages_dropped_total("offline");
                self.registry.remove_if(&to, id);
                Some(Reply::error(reason::RECIPIENT_OFFLINE))
            }
        }
    }

    /// Tear down `session` after a clean close or a transport error.
    ///
    /// Releases the bound name, then closes the outbound queue and bounces any
    /// forwards still waiting in it back to their senders. Calling this more
    /// than once is a no-op.
    pub fn close_session(&self, session: &mut Session, queue: &mut mpsc::Receiver<Outbound>) {
        let previous = std::mem::replace(&mut session.state, SessionState::Closed);
        match previous {
            SessionState::Closed => return,
            SessionState::Registered(name) => {
                if self.registry.remove_if(&name, session.id) {
                    gauges::set_users_registered(self.registry.len());
                }
                info!(conn_id = session.id, name = %name, "user disconnected");
            }
            SessionState::Unregistered => {
                debug!(conn_id = session.id, "unregistered client disconnected");
            }
        }

        queue.close();
        let mut bounced = 0usize;
        while let Ok(out) = queue.try_recv() {
            if let Outbound::Forward(fwd) = out {
                fwd.bounce();
                bounced += 1;
            }
        }
        if bounced > 0 {
            debug!(conn_id = session.id, bounced, "bounced undelivered forwards");
        }
    }
}
