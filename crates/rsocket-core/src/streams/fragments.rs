use bytes::BytesMut;
use rsocket_frame::{FrameFlags, Payload};

/// Reassembles FOLLOWS fragments into one payload.
///
/// NEXT and COMPLETE are remembered from any fragment.
#[derive(Debug, Default)]
pub(crate) struct FragmentAccumulator {
    data: BytesMut,
    metadata: Option<BytesMut>,
    fragments: usize,
    flags: FrameFlags,
}

impl FragmentAccumulator {
    pub(crate) fn is_empty(&self) -> bool {
        self.fragments == 0
    }

    pub(crate) fn add(&mut self, payload: Payload, flags: FrameFlags) {
        self.fragments += 1;
        self.data.extend_from_slice(&payload.data);
        if let Some(metadata) = payload.metadata {
            self.metadata
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&metadata);
        }
        self.flags |= flags & (FrameFlags::NEXT | FrameFlags::COMPLETE);
    }

    /// Take the reassembled payload with its accumulated NEXT/COMPLETE flags.
    pub(crate) fn consume(&mut self) -> (Payload, FrameFlags) {
        let taken = std::mem::take(self);
        let payload = Payload {
            data: taken.data.freeze(),
            metadata: taken.metadata.map(BytesMut::freeze),
        };
        (payload, taken.flags)
    }
}

/// Split a payload into pieces of at most `max` bytes, metadata first.
pub(crate) fn split_payload(payload: Payload, max: usize) -> Vec<Payload> {
    let max = max.max(1);
    if payload.len() <= max {
        return vec![payload];
    }

    let mut fragments = Vec::new();
    let mut data = payload.data;
    let mut metadata = payload.metadata;
    while fragments.is_empty() || !data.is_empty() || metadata.is_some() {
        let mut budget = max;
        let fragment_metadata = metadata.take().map(|mut remaining| {
            let n = remaining.len().min(budget);
            budget -= n;
            let part = remaining.split_to(n);
            if !remaining.is_empty() {
                metadata = Some(remaining);
            }
            part
        });
        let n = data.len().min(budget);
        fragments.push(Payload {
            data: data.split_to(n),
            metadata: fragment_metadata,
        });
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(fragments: Vec<Payload>) -> Payload {
        let mut acc = FragmentAccumulator::default();
        for fragment in fragments {
            acc.add(fragment, FrameFlags::empty());
        }
        acc.consume().0
    }

    #[test]
    fn small_payloads_are_not_split() {
        let payload = Payload::with_metadata("data", "meta");
        assert_eq!(split_payload(payload.clone(), 8), vec![payload]);
    }

    #[test]
    fn metadata_is_sent_before_data() {
        let payload = Payload::with_metadata("0123456789", "abcdef");
        let fragments = split_payload(payload.clone(), 4);
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[0].metadata.as_deref(), Some(&b"abcd"[..]));
        assert!(fragments[0].data.is_empty());
        assert_eq!(fragments[1].metadata.as_deref(), Some(&b"ef"[..]));
        assert_eq!(&fragments[1].data[..], b"01");
        assert_eq!(fragments[2].metadata, None);
        assert!(fragments.iter().all(|f| f.len() <= 4));
        assert_eq!(reassemble(fragments), payload);
    }

    #[test]
    fn data_only_payload_reassembles_without_metadata() {
        let payload = Payload::new(vec![7u8; 1000]);
        let fragments = split_payload(payload.clone(), 64);
        assert_eq!(fragments.len(), 16);
        assert_eq!(reassemble(fragments), payload);
    }

    #[test]
    fn accumulator_keeps_flags_from_any_fragment() {
        let mut acc = FragmentAccumulator::default();
        assert!(acc.is_empty());
        acc.add(Payload::from("a"), FrameFlags::FOLLOWS | FrameFlags::NEXT);
        acc.add(Payload::from("b"), FrameFlags::COMPLETE);
        assert!(!acc.is_empty());
        let (payload, flags) = acc.consume();
        assert_eq!(payload, Payload::from("ab"));
        assert_eq!(flags, FrameFlags::NEXT | FrameFlags::COMPLETE);
        assert!(acc.is_empty());
    }
}
