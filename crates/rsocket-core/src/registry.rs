//! Tracks live connections for resume routing and coordinated shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rsocket_frame::ResumeToken;
use tracing::{debug, info};

use crate::command::{Command, Mailbox};
use crate::connection::RSocketStateMachine;
use crate::error::StreamCompletionSignal;

/// A connection shared between its event loop and observers.
pub type SharedConnection = Arc<Mutex<RSocketStateMachine>>;

/// Lock a shared connection, recovering from a poisoned lock.
pub fn lock_connection(connection: &SharedConnection) -> MutexGuard<'_, RSocketStateMachine> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

struct Entry {
    connection: Weak<Mutex<RSocketStateMachine>>,
    mailbox: Mailbox,
    owner: Option<ThreadId>,
    token: Option<ResumeToken>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
    drained: Condvar,
    next_id: AtomicU64,
}

/// Set of live connections. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

/// Held by a registered connection; removes it from the registry on close.
pub(crate) struct RegistryLink {
    registry: Weak<Inner>,
    id: ConnectionId,
}

impl RegistryLink {
    pub(crate) fn release(self) {
        if let Some(inner) = self.registry.upgrade() {
            ConnectionRegistry { inner }.remove(self.id);
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. It removes itself when it closes.
    ///
    /// `owner` is the thread driving the connection, if known.
    pub fn register(&self, connection: &SharedConnection, owner: Option<ThreadId>) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (mailbox, token, closed) = {
            let mut guard = lock_connection(connection);
            guard.attach_registry(RegistryLink {
                registry: Arc::downgrade(&self.inner),
                id,
            });
            (guard.mailbox(), guard.resume_token().cloned(), guard.is_closed())
        };
        if closed {
            return id;
        }
        self.entries().insert(
            id,
            Entry {
                connection: Arc::downgrade(connection),
                mailbox,
                owner,
                token,
            },
        );
        debug!(connection = %id, "connection registered");
        id
    }

    pub fn set_owner(&self, id: ConnectionId, owner: ThreadId) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.owner = Some(owner);
        }
    }

    pub fn remove(&self, id: ConnectionId) {
        let mut entries = self.entries();
        if entries.remove(&id).is_some() {
            debug!(connection = %id, remaining = entries.len(), "connection unregistered");
        }
        if entries.is_empty() {
            self.inner.drained.notify_all();
        }
    }

    /// Mailbox of the connection that was set up with `token`.
    pub fn find_by_token(&self, token: &ResumeToken) -> Option<Mailbox> {
        self.entries()
            .values()
            .find(|entry| entry.token.as_ref() == Some(token))
            .map(|entry| entry.mailbox.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Close every connection and wait until all have unregistered.
    ///
    /// Connections owned by the calling thread are closed directly; others
    /// are asked to close through their mailbox. Returns `false` if the
    /// timeout expired first.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        let current = thread::current().id();
        let targets: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, entry)| (*id, entry.connection.clone(), entry.mailbox.clone(), entry.owner))
            .collect();
        info!(connections = targets.len(), "shutting down connections");

        for (id, connection, mailbox, owner) in targets {
            let Some(connection) = connection.upgrade() else {
                self.remove(id);
                continue;
            };
            let close_directly = owner == Some(current);
            if close_directly {
                if let Ok(mut guard) = connection.try_lock() {
                    guard.close("connection registry shutting down", StreamCompletionSignal::SocketClosed);
                    continue;
                }
            }
            let posted = mailbox.post(Command::Close {
                reason: "connection registry shutting down".to_string(),
                signal: StreamCompletionSignal::SocketClosed,
            });
            if !posted {
                lock_connection(&connection).close("connection registry shutting down", StreamCompletionSignal::SocketClosed);
            }
        }

        let entries = self.entries();
        let (entries, result) = self
            .inner
            .drained
            .wait_timeout_while(entries, timeout, |entries| !entries.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let drained = !result.timed_out() || entries.is_empty();
        debug!(drained, remaining = entries.len(), "registry shutdown finished");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RejectingHandler;
    use crate::params::{ConnectionConfig, ConnectionRole, SetupParameters};
    use crate::transport::MemoryTransport;

    fn server_connection(params: &SetupParameters) -> SharedConnection {
        let mut machine = RSocketStateMachine::new(
            ConnectionRole::Acceptor,
            ConnectionConfig::default(),
            Box::new(RejectingHandler),
        );
        let (transport, _peer) = MemoryTransport::new();
        machine
            .connect_server(Box::new(transport), params)
            .expect("server connect should succeed");
        Arc::new(Mutex::new(machine))
    }

    #[test]
    fn close_unregisters_connection() {
        let registry = ConnectionRegistry::new();
        let connection = server_connection(&SetupParameters::default());
        registry.register(&connection, None);
        assert_eq!(registry.len(), 1);

        lock_connection(&connection).close("done", StreamCompletionSignal::ConnectionEnd);
        assert!(registry.is_empty());
    }

    #[test]
    fn finds_resumable_connection_by_token() {
        let registry = ConnectionRegistry::new();
        let params = SetupParameters::resumable();
        let connection = server_connection(&params);
        registry.register(&connection, None);

        assert!(registry.find_by_token(&params.token).is_some());
        assert!(registry.find_by_token(&ResumeToken::generate()).is_none());
    }

    #[test]
    fn shutdown_closes_owned_connections_synchronously() {
        let registry = ConnectionRegistry::new();
        let first = server_connection(&SetupParameters::default());
        let second = server_connection(&SetupParameters::default());
        let owner = thread::current().id();
        registry.register(&first, Some(owner));
        registry.register(&second, Some(owner));

        assert!(registry.shutdown_and_wait(Duration::from_secs(1)));
        assert!(lock_connection(&first).is_closed());
        assert!(lock_connection(&second).is_closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn shutdown_times_out_when_owner_never_runs() {
        let registry = ConnectionRegistry::new();
        let connection = server_connection(&SetupParameters::default());
        let id = registry.register(&connection, None);
        let other_thread = thread::spawn(|| thread::current().id())
            .join()
            .expect("helper thread should finish");
        registry.set_owner(id, other_thread);

        let mut machine = lock_connection(&connection);
        let _inbox = machine.take_inbox();
        drop(machine);

        assert!(!registry.shutdown_and_wait(Duration::from_millis(50)));
        assert_eq!(registry.len(), 1);
    }
}
