//! Incremental reassembly of frame bodies from a byte stream.
//!
//! Bytes arrive in arbitrary chunks. [`StreamReassembler`] scans each chunk
//! once and hands back every frame body completed by it, keeping at most one
//! partial body between calls.
//!
//! The scanner has two states:
//! - `Idle`: no open frame, interior bytes are ignored
//! - `Accumulating`: a start byte was seen, interior bytes belong to the body
//!
//! A start byte while accumulating, or an end byte while idle, is a framing
//! error. Both discard whatever was open and return to `Idle`; the stream
//! resynchronizes at the next start byte that arrives while idle.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::types::{FRAME_END, FRAME_START};

/// Default upper bound for a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
}

/// Turns arbitrary byte chunks into complete frame bodies.
#[derive(Debug)]
pub struct StreamReassembler {
    /// Partial body carried over from previous chunks.
    pending: BytesMut,
    state: State,
    max_frame_len: usize,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Bodies growing past `max_frame_len` bytes are discarded.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            state: State::Idle,
            max_frame_len,
        }
    }

    /// Consume a chunk and return the frame bodies it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        // Start of the not yet copied run of body bytes inside `chunk`.
        let mut run_start = 0;

        for (i, &byte) in chunk.iter().enumerate() {
            match (byte, self.state) {
                (FRAME_START, State::Idle) => {
                    self.state = State::Accumulating;
                    run_start = i + 1;
                }
                (FRAME_START, State::Accumulating) => {
                    debug!(
                        discarded = self.pending.len() + (i - run_start),
                        "start delimiter inside an open frame, discarding it"
                    );
                    self.reset();
                }
                (FRAME_END, State::Accumulating) => {
                    let run = &chunk[run_start..i];
                    if self.pending.len() + run.len() > self.max_frame_len {
                        self.discard_oversized(run.len());
                        continue;
                    }
                    self.pending.extend_from_slice(run);
                    frames.push(self.pending.split().freeze());
                    self.state = State::Idle;
                }
                (FRAME_END, State::Idle) => {
                    debug!("end delimiter without an open frame, ignoring it");
                }
                _ => {}
            }
        }

        if self.state == State::Accumulating {
            let run = &chunk[run_start..];
            if self.pending.len() + run.len() > self.max_frame_len {
                self.discard_oversized(run.len());
            } else {
                self.pending.extend_from_slice(run);
            }
        }

        frames
    }

    fn discard_oversized(&mut self, extra: usize) {
        warn!(
            len = self.pending.len() + extra,
            max = self.max_frame_len,
            "frame exceeds maximum length, discarding it"
        );
        self.reset();
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.state = State::Idle;
    }

    /// Number of bytes held for the incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while a frame is open and waiting for its end delimiter.
    pub fn is_accumulating(&self) -> bool {
        self.state == State::Accumulating
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.reset();
        self.pending = BytesMut::new();
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}
