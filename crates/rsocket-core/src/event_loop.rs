//! Threads that drive a connection: one event loop plus one reader per transport.

use std::io;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rsocket_frame::{FrameError, FrameReader};
use rsocket_transport::SocketStream;
use tracing::{debug, trace};

use crate::command::{Command, Inbox, Mailbox, TransportId};
use crate::connection::RSocketStateMachine;
use crate::error::{RSocketError, Result, StreamCompletionSignal};
use crate::registry::{lock_connection, ConnectionId, ConnectionRegistry, SharedConnection};

/// A connection running on its own event-loop thread.
pub struct ConnectionHandle {
    connection: SharedConnection,
    mailbox: Mailbox,
    id: Option<ConnectionId>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    pub fn post(&self, command: Command) -> bool {
        self.mailbox.post(command)
    }

    /// Registry id, when spawned with a registry.
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the event loop to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct EventLoop;

impl EventLoop {
    /// Move `machine` onto a new thread that applies posted commands and
    /// keepalive deadlines until the connection closes.
    pub fn spawn(
        mut machine: RSocketStateMachine,
        name: &str,
        registry: Option<&ConnectionRegistry>,
    ) -> Result<ConnectionHandle> {
        let inbox = machine
            .take_inbox()
            .ok_or_else(|| RSocketError::Io(io::Error::other("connection is already driven")))?;
        let mailbox = machine.mailbox();
        let connection = Arc::new(Mutex::new(machine));
        let id = registry.map(|registry| registry.register(&connection, None));

        let thread = thread::Builder::new().name(name.to_string()).spawn({
            let connection = Arc::clone(&connection);
            move || run(&connection, &inbox)
        })?;
        if let (Some(registry), Some(id)) = (registry, id) {
            registry.set_owner(id, thread.thread().id());
        }
        debug!(name, "event loop started");
        Ok(ConnectionHandle {
            connection,
            mailbox,
            id,
            thread: Some(thread),
        })
    }
}

fn run(connection: &SharedConnection, inbox: &Inbox) {
    loop {
        let deadline = {
            let guard = lock_connection(connection);
            if guard.is_closed() {
                break;
            }
            guard.next_timeout()
        };
        let command = inbox.recv_deadline(deadline);

        let mut guard = lock_connection(connection);
        match command {
            Ok(command) => {
                trace!(?command, "applying command");
                guard.handle_command(command);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                guard.close("mailbox closed", StreamCompletionSignal::ConnectionEnd);
            }
        }
        guard.handle_timeout(Instant::now());
    }
    debug!("event loop finished");
}

/// Read frames from `reader` and post them to `mailbox` until the socket ends.
pub fn spawn_reader(
    mut reader: FrameReader<SocketStream>,
    transport: TransportId,
    mailbox: Mailbox,
) -> Result<JoinHandle<()>> {
    let thread = thread::Builder::new()
        .name(format!("rsocket-reader-{transport}"))
        .spawn(move || loop {
            match reader.read_frame() {
                Ok(frame) => {
                    if !mailbox.post(Command::Inbound { transport, frame }) {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => {
                    mailbox.post(Command::TransportClosed {
                        transport,
                        error: None,
                    });
                    break;
                }
                Err(err) => {
                    debug!(%transport, error = %err, "transport read failed");
                    mailbox.post(Command::TransportClosed {
                        transport,
                        error: Some(err.to_string()),
                    });
                    break;
                }
            }
        })?;
    Ok(thread)
}
