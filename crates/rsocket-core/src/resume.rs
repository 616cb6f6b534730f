//! Position accounting and the warm-resume frame buffer.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use rsocket_frame::{FrameType, ResumePosition, StreamId};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::streams::StreamType;

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    Local,
    Remote,
}

/// What cold resumption needs to rebuild one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResumeInfo {
    pub stream_type: StreamType,
    pub origin: RequestOrigin,
    pub token: String,
    pub consumer_allowance: u32,
}

/// Frames that count toward resume positions.
pub fn is_tracked_frame(frame_type: FrameType) -> bool {
    matches!(
        frame_type,
        FrameType::RequestChannel
            | FrameType::RequestStream
            | FrameType::RequestResponse
            | FrameType::RequestFnf
            | FrameType::RequestN
            | FrameType::Cancel
            | FrameType::Error
            | FrameType::Payload
    )
}

/// Ledger of sent and received positions used by RESUME negotiation.
///
/// Positions are cumulative byte counts of tracked frames only.
pub trait ResumeManager: Send {
    /// `consumer_allowance` is `None` when the stream's current allowance is
    /// not known at this point; the saved value is then left as is.
    fn track_sent_frame(
        &mut self,
        frame: &Bytes,
        frame_type: FrameType,
        stream_id: StreamId,
        consumer_allowance: Option<u32>,
    );

    fn track_received_frame(
        &mut self,
        len: usize,
        frame_type: FrameType,
        stream_id: StreamId,
        consumer_allowance: Option<u32>,
    );

    /// Record the allowance a live stream has left for its consumer.
    fn update_stream_allowance(&mut self, stream_id: StreamId, consumer_allowance: u32);

    /// Drop buffered frames the peer has acknowledged.
    fn reset_up_to_position(&mut self, position: ResumePosition);

    fn is_position_available(&self, position: ResumePosition) -> bool;

    /// Buffered frames starting at `position`, in send order.
    fn frames_from_position(&self, position: ResumePosition) -> Vec<Bytes>;

    fn first_sent_position(&self) -> ResumePosition;

    fn last_sent_position(&self) -> ResumePosition;

    fn implied_position(&self) -> ResumePosition;

    fn on_stream_open(&mut self, stream_id: StreamId, stream_type: StreamType, origin: RequestOrigin, token: String);

    fn on_stream_closed(&mut self, stream_id: StreamId);

    fn stream_resume_infos(&self) -> &BTreeMap<StreamId, StreamResumeInfo>;

    fn largest_used_stream_id(&self) -> StreamId;

    fn snapshot(&self) -> ResumeSnapshot;
}

/// In-memory ledger bounded by a byte capacity.
#[derive(Debug)]
pub struct WarmResumeManager {
    frames: VecDeque<(ResumePosition, Bytes)>,
    first_sent_position: ResumePosition,
    last_sent_position: ResumePosition,
    implied_position: ResumePosition,
    capacity: usize,
    size: usize,
    streams: BTreeMap<StreamId, StreamResumeInfo>,
    largest_used_stream_id: StreamId,
}

impl WarmResumeManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            first_sent_position: 0,
            last_sent_position: 0,
            implied_position: 0,
            capacity,
            size: 0,
            streams: BTreeMap::new(),
            largest_used_stream_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.size
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    /// Rebuild a ledger from a snapshot, e.g. one persisted for cold resumption.
    pub fn from_snapshot(snapshot: ResumeSnapshot) -> Self {
        let frames: VecDeque<(ResumePosition, Bytes)> = snapshot
            .frames
            .into_iter()
            .map(|frame| (frame.position, Bytes::from(frame.bytes)))
            .collect();
        let size = frames.iter().map(|(_, bytes)| bytes.len()).sum();
        Self {
            frames,
            first_sent_position: snapshot.first_sent_position,
            last_sent_position: snapshot.last_sent_position,
            implied_position: snapshot.implied_position,
            capacity: snapshot.capacity,
            size,
            streams: snapshot.streams,
            largest_used_stream_id: snapshot.largest_used_stream_id,
        }
    }

    fn add_frame(&mut self, frame: &Bytes) {
        self.size += frame.len();
        while self.size > self.capacity && !self.frames.is_empty() {
            self.evict_frame();
        }
        self.frames.push_back((self.last_sent_position, frame.clone()));
    }

    fn evict_frame(&mut self) {
        let position = match self.frames.get(1) {
            Some((position, _)) => *position,
            None => self.last_sent_position,
        };
        self.reset_up_to_position(position);
    }

}

impl ResumeManager for WarmResumeManager {
    fn track_sent_frame(
        &mut self,
        frame: &Bytes,
        frame_type: FrameType,
        stream_id: StreamId,
        consumer_allowance: Option<u32>,
    ) {
        if !is_tracked_frame(frame_type) {
            return;
        }
        if let Some(allowance) = consumer_allowance {
            self.update_stream_allowance(stream_id, allowance);
        }
        let len = frame.len() as ResumePosition;
        if frame.len() > self.capacity {
            // Too large to buffer: everything before it becomes unreplayable.
            debug!(frame_len = frame.len(), capacity = self.capacity, "frame exceeds resume buffer");
            self.reset_up_to_position(self.last_sent_position);
            self.last_sent_position += len;
            self.first_sent_position += len;
            return;
        }
        self.add_frame(frame);
        self.last_sent_position += len;
        trace!(
            %frame_type,
            stream_id,
            position = self.last_sent_position,
            "tracked sent frame"
        );
    }

    fn track_received_frame(
        &mut self,
        len: usize,
        frame_type: FrameType,
        stream_id: StreamId,
        consumer_allowance: Option<u32>,
    ) {
        if !is_tracked_frame(frame_type) {
            return;
        }
        if let Some(allowance) = consumer_allowance {
            self.update_stream_allowance(stream_id, allowance);
        }
        self.implied_position += len as ResumePosition;
    }

    fn reset_up_to_position(&mut self, position: ResumePosition) {
        if position <= self.first_sent_position {
            return;
        }
        let position = if position > self.last_sent_position {
            warn!(
                position,
                last_sent = self.last_sent_position,
                "peer acknowledged a position that was never sent"
            );
            self.last_sent_position
        } else {
            position
        };
        while let Some((frame_position, bytes)) = self.frames.front() {
            if *frame_position >= position {
                break;
            }
            self.size -= bytes.len();
            self.frames.pop_front();
        }
        self.first_sent_position = position;
    }

    fn is_position_available(&self, position: ResumePosition) -> bool {
        position == self.last_sent_position
            || self
                .frames
                .binary_search_by_key(&position, |(frame_position, _)| *frame_position)
                .is_ok()
    }

    fn frames_from_position(&self, position: ResumePosition) -> Vec<Bytes> {
        match self
            .frames
            .binary_search_by_key(&position, |(frame_position, _)| *frame_position)
        {
            Ok(index) => self.frames.range(index..).map(|(_, bytes)| bytes.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn first_sent_position(&self) -> ResumePosition {
        self.first_sent_position
    }

    fn last_sent_position(&self) -> ResumePosition {
        self.last_sent_position
    }

    fn implied_position(&self) -> ResumePosition {
        self.implied_position
    }

    fn on_stream_open(&mut self, stream_id: StreamId, stream_type: StreamType, origin: RequestOrigin, token: String) {
        self.largest_used_stream_id = self.largest_used_stream_id.max(stream_id);
        self.streams.insert(
            stream_id,
            StreamResumeInfo {
                stream_type,
                origin,
                token,
                consumer_allowance: 0,
            },
        );
    }

    fn on_stream_closed(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    fn update_stream_allowance(&mut self, stream_id: StreamId, consumer_allowance: u32) {
        if let Some(info) = self.streams.get_mut(&stream_id) {
            info.consumer_allowance = consumer_allowance;
        }
    }

    fn stream_resume_infos(&self) -> &BTreeMap<StreamId, StreamResumeInfo> {
        &self.streams
    }

    fn largest_used_stream_id(&self) -> StreamId {
        self.largest_used_stream_id
    }

    fn snapshot(&self) -> ResumeSnapshot {
        ResumeSnapshot {
            first_sent_position: self.first_sent_position,
            last_sent_position: self.last_sent_position,
            implied_position: self.implied_position,
            capacity: self.capacity,
            frames: self
                .frames
                .iter()
                .map(|(position, bytes)| SnapshotFrame {
                    position: *position,
                    bytes: bytes.to_vec(),
                })
                .collect(),
            streams: self.streams.clone(),
            largest_used_stream_id: self.largest_used_stream_id,
        }
    }
}

/// One buffered frame inside a [`ResumeSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub position: ResumePosition,
    pub bytes: Vec<u8>,
}

/// Serializable copy of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub first_sent_position: ResumePosition,
    pub last_sent_position: ResumePosition,
    pub implied_position: ResumePosition,
    pub capacity: usize,
    pub frames: Vec<SnapshotFrame>,
    pub streams: BTreeMap<StreamId, StreamResumeInfo>,
    pub largest_used_stream_id: StreamId,
}

impl ResumeSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
