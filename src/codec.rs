//! tokio-util codec for eventsock frames.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::frame::{decode_frame, encode_frame_into};
use crate::reassembly::StreamReassembler;
use crate::types::{EventSockError, Packet};

/// Codec turning a byte stream into [`Packet`]s and back.
///
/// Decoding drains the whole read buffer into a [`StreamReassembler`] on
/// every call, so the framed reader never holds bytes the reassembler has
/// not seen. Malformed frames are dropped here and never reach the caller.
#[derive(Debug, Default)]
pub struct EventCodec {
    reassembler: StreamReassembler,
    /// Completed bodies not yet handed out.
    ready: VecDeque<Bytes>,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            reassembler: StreamReassembler::with_max_frame_len(max_frame_len),
            ready: VecDeque::new(),
        }
    }

    fn next_packet(&mut self) -> Option<Packet> {
        while let Some(body) = self.ready.pop_front() {
            match decode_frame(&body) {
                Ok(packet) => return Some(packet),
                Err(reason) => debug!(len = body.len(), %reason, "dropping malformed frame"),
            }
        }
        None
    }
}

impl Decoder for EventCodec {
    type Item = Packet;
    type Error = EventSockError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(packet) = self.next_packet() {
            return Ok(Some(packet));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let chunk = src.split();
        self.ready.extend(self.reassembler.feed(&chunk));
        Ok(self.next_packet())
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let packet = self.decode(buf)?;
        if packet.is_none() && self.reassembler.is_accumulating() {
            debug!(
                pending = self.reassembler.pending_len(),
                "stream ended inside a frame, discarding it"
            );
            self.reassembler.clear();
        }
        Ok(packet)
    }
}

impl Encoder<Packet> for EventCodec {
    type Error = EventSockError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_into(&item.event_type, item.payload.as_deref(), dst)
    }
}
