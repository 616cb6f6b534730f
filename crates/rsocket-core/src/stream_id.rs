use rsocket_frame::StreamId;

use crate::error::{RSocketError, Result};
use crate::params::ConnectionRole;

/// Largest stream id handed out locally.
pub const MAX_STREAM_ID: StreamId = i32::MAX as StreamId - 2;

/// Why a peer-chosen stream id was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerStreamIdError {
    #[error("stream id 0 belongs to the connection")]
    Zero,
    #[error("stream id {0} has the local parity")]
    WrongParity(StreamId),
    #[error("stream id {id} is not above the last peer stream id {last}")]
    NotIncreasing { id: StreamId, last: StreamId },
}

/// Hands out local stream ids and validates the peer's.
///
/// Initiators use odd ids starting at 1, acceptors even ids starting at 2.
#[derive(Debug, Clone)]
pub struct StreamIdAllocator {
    next: StreamId,
    last_peer: StreamId,
}

impl StreamIdAllocator {
    pub fn new(role: ConnectionRole) -> Self {
        Self {
            next: if role.is_initiator() { 1 } else { 2 },
            last_peer: 0,
        }
    }

    pub fn next_stream_id(&mut self) -> Result<StreamId> {
        let id = self.next;
        if id > MAX_STREAM_ID {
            return Err(RSocketError::StreamIdsExhausted);
        }
        self.next += 2;
        Ok(id)
    }

    pub fn peek_next(&self) -> StreamId {
        self.next
    }

    /// Continue numbering after `largest_used`, never going backwards.
    pub fn set_next_after(&mut self, largest_used: StreamId) {
        let candidate = if self.is_local(largest_used) {
            largest_used.saturating_add(2)
        } else {
            largest_used.saturating_add(1)
        };
        self.next = self.next.max(candidate);
    }

    pub fn is_local(&self, id: StreamId) -> bool {
        id % 2 == self.next % 2
    }

    /// Accept a stream id opened by the peer.
    ///
    /// Ids must have the peer's parity and strictly increase.
    pub fn register_peer_stream_id(&mut self, id: StreamId) -> std::result::Result<(), PeerStreamIdError> {
        if id == 0 {
            return Err(PeerStreamIdError::Zero);
        }
        if self.is_local(id) {
            return Err(PeerStreamIdError::WrongParity(id));
        }
        if id <= self.last_peer {
            return Err(PeerStreamIdError::NotIncreasing {
                id,
                last: self.last_peer,
            });
        }
        self.last_peer = id;
        Ok(())
    }

    pub fn last_peer_stream_id(&self) -> StreamId {
        self.last_peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_and_acceptor_use_opposite_parity() {
        let mut client = StreamIdAllocator::new(ConnectionRole::Initiator);
        let mut server = StreamIdAllocator::new(ConnectionRole::Acceptor);
        assert_eq!(client.next_stream_id().expect("client id should allocate"), 1);
        assert_eq!(client.next_stream_id().expect("client id should allocate"), 3);
        assert_eq!(server.next_stream_id().expect("server id should allocate"), 2);
        assert_eq!(server.next_stream_id().expect("server id should allocate"), 4);
    }

    #[test]
    fn peer_ids_must_increase_with_peer_parity() {
        let mut server = StreamIdAllocator::new(ConnectionRole::Acceptor);
        assert_eq!(server.register_peer_stream_id(1), Ok(()));
        assert_eq!(server.register_peer_stream_id(5), Ok(()));
        assert_eq!(
            server.register_peer_stream_id(3),
            Err(PeerStreamIdError::NotIncreasing { id: 3, last: 5 })
        );
        assert_eq!(server.register_peer_stream_id(5), Err(PeerStreamIdError::NotIncreasing { id: 5, last: 5 }));
        assert_eq!(server.register_peer_stream_id(6), Err(PeerStreamIdError::WrongParity(6)));
        assert_eq!(server.register_peer_stream_id(0), Err(PeerStreamIdError::Zero));
        assert_eq!(server.last_peer_stream_id(), 5);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut client = StreamIdAllocator::new(ConnectionRole::Initiator);
        client.set_next_after(MAX_STREAM_ID);
        assert!(matches!(client.next_stream_id(), Err(RSocketError::StreamIdsExhausted)));
    }

    #[test]
    fn set_next_after_keeps_parity_and_never_rewinds() {
        let mut client = StreamIdAllocator::new(ConnectionRole::Initiator);
        client.set_next_after(7);
        assert_eq!(client.peek_next(), 9);
        client.set_next_after(0);
        assert_eq!(client.peek_next(), 9);
        client.set_next_after(10);
        assert_eq!(client.peek_next(), 11);
    }
}
