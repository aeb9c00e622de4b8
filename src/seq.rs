//! Sequence-number and window bookkeeping.
//!
//! All arithmetic is modulo 32768 (15-bit sequence fields). Comparisons and
//! range computations go through [`seq_distance`] only; native ordering on
//! raw sequence numbers is never valid near the wrap boundary.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{ApciError, ApciResult};
use crate::frame::SEQ_MODULO;
use crate::timers::TimerHandle;

/// Forward distance from `from` to `to` in sequence space, `(to - from) mod 32768`.
pub(crate) fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from) & (SEQ_MODULO - 1)
}

/// One transmitted, not-yet-acknowledged I-frame: its response deadline and
/// the callers waiting for the peer's acknowledgment.
#[derive(Debug)]
pub(crate) struct OutstandingFrame {
    waiters: Vec<oneshot::Sender<ApciResult<()>>>,
    #[allow(dead_code)] // held for its Drop, which disarms the deadline
    response_timer: TimerHandle,
}

impl OutstandingFrame {
    pub(crate) fn new(
        waiters: Vec<oneshot::Sender<ApciResult<()>>>,
        response_timer: TimerHandle,
    ) -> Self {
        Self {
            waiters,
            response_timer,
        }
    }

    /// Acknowledged by the peer: disarm t1 and signal success.
    pub(crate) fn resolve_acked(self) {
        for waiter in self.waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Connection went down before the acknowledgment arrived.
    pub(crate) fn resolve_closed(self) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(ApciError::ConnectionClosed));
        }
    }
}

/// Owns the three sequence counters, the outstanding-frame set and the
/// forced-acknowledgment counter. Pure bookkeeping: blocking for window
/// admission and all I/O live in the connection engine.
#[derive(Debug)]
pub(crate) struct SeqTracker {
    /// Sequence number assigned to the next outgoing data frame
    send_seq: u16,
    /// Sequence number expected on the next incoming data frame
    recv_seq: u16,
    /// Exclusive lower edge of the outstanding set
    acked_up_to: u16,
    /// Received data frames not yet covered by an outgoing acknowledgment
    unacked_in: u16,
    send_window: u16,
    recv_window: u16,
    /// Keys form the contiguous wrap-around range `[acked_up_to, send_seq)`
    outstanding: HashMap<u16, OutstandingFrame>,
}

impl SeqTracker {
    pub(crate) fn new(send_window: u16, recv_window: u16) -> Self {
        Self {
            send_seq: 0,
            recv_seq: 0,
            acked_up_to: 0,
            unacked_in: 0,
            send_window,
            recv_window,
            outstanding: HashMap::new(),
        }
    }

    pub(crate) fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    /// Reserve the next send sequence number, or `None` while the send
    /// window is full.
    pub(crate) fn reserve_send(&mut self) -> Option<u16> {
        if self.outstanding.len() >= self.send_window as usize {
            return None;
        }
        let seq = self.send_seq;
        self.send_seq = (self.send_seq + 1) % SEQ_MODULO;
        Some(seq)
    }

    /// Register a transmitted I-frame under its reserved sequence number.
    pub(crate) fn register_outstanding(&mut self, seq: u16, frame: OutstandingFrame) {
        self.outstanding.insert(seq, frame);
    }

    /// Account for a received data frame. Out-of-order frames are fatal,
    /// never buffered or reordered.
    pub(crate) fn on_data_received(&mut self, seq: u16) -> ApciResult<()> {
        if seq != self.recv_seq {
            return Err(ApciError::SequenceMismatch {
                expected: self.recv_seq,
                got: seq,
            });
        }
        self.recv_seq = (self.recv_seq + 1) % SEQ_MODULO;
        self.unacked_in += 1;
        Ok(())
    }

    /// True once enough data frames have arrived that an acknowledgment
    /// must be forced out.
    pub(crate) fn needs_forced_ack(&self) -> bool {
        self.unacked_in >= self.recv_window
    }

    pub(crate) fn has_unacked_in(&self) -> bool {
        self.unacked_in > 0
    }

    /// An ack-bearing frame (I or S) was transmitted, whatever the reason.
    pub(crate) fn ack_sent(&mut self) {
        self.unacked_in = 0;
    }

    /// Process a received acknowledgment: remove and return every
    /// outstanding entry in `[acked_up_to, ack)`. An ack outside the sent
    /// range, or for a frame with no entry, is fatal.
    pub(crate) fn on_ack_received(&mut self, ack: u16) -> ApciResult<Vec<OutstandingFrame>> {
        let span = seq_distance(self.acked_up_to, self.send_seq);
        if seq_distance(self.acked_up_to, ack) > span {
            return Err(ApciError::StrayAck { seq: ack });
        }

        let mut resolved = Vec::new();
        let mut seq = self.acked_up_to;
        while seq != ack {
            match self.outstanding.remove(&seq) {
                Some(frame) => resolved.push(frame),
                None => return Err(ApciError::StrayAck { seq }),
            }
            seq = (seq + 1) % SEQ_MODULO;
        }
        self.acked_up_to = ack;
        Ok(resolved)
    }

    /// Attach an extra completion signal to the newest outstanding frame.
    /// Returns the sender back when nothing is outstanding.
    pub(crate) fn attach_to_newest(
        &mut self,
        waiter: oneshot::Sender<ApciResult<()>>,
    ) -> Option<oneshot::Sender<ApciResult<()>>> {
        if self.outstanding.is_empty() {
            return Some(waiter);
        }
        let newest = self.send_seq.wrapping_sub(1) & (SEQ_MODULO - 1);
        match self.outstanding.get_mut(&newest) {
            Some(frame) => {
                frame.waiters.push(waiter);
                None
            }
            None => Some(waiter),
        }
    }

    /// Drain the outstanding set for shutdown.
    pub(crate) fn take_outstanding(&mut self) -> Vec<OutstandingFrame> {
        self.outstanding.drain().map(|(_, frame)| frame).collect()
    }

    #[cfg(test)]
    fn with_counters(send_window: u16, recv_window: u16, seq: u16) -> Self {
        let mut tracker = Self::new(send_window, recv_window);
        tracker.send_seq = seq;
        tracker.recv_seq = seq;
        tracker.acked_up_to = seq;
        tracker
    }
}
