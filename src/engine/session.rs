//! # Per-invocation session state.
//!
//! A session correlates one caller channel with (eventually) one slave
//! span. Before assignment, caller writes accumulate in a bounded outbox;
//! on attach the outbox is replayed to the slave in order, and further
//! writes append behind whatever is still unflushed.
//!
//! ## Ordering guarantee
//! Frames written before dispatch reach the slave strictly before frames
//! written after dispatch; nothing is reordered and nothing is dropped
//! unless the session closes with an error.
//!
//! ## Non-blocking discipline
//! Frames move to the slave with `try_send` only. A slave channel that
//! stays full pushes back into the outbox, and an outbox past its cap
//! closes the session with `BackpressureExceeded` - the same failure a
//! stuck queue produces pre-assignment.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{Frame, UpstreamFrame};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Admitted, awaiting an idle slave.
    Queued,
    /// Paired with a slave; frames flow.
    Assigned,
    /// Closed cleanly (worker choke).
    ClosedOk,
    /// Closed with an error.
    ClosedError,
    /// Cancelled by the caller.
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::ClosedOk | SessionState::ClosedError | SessionState::Cancelled
        )
    }
}

/// Result of accepting one caller frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Buffered or forwarded; session healthy.
    Accepted,
    /// Outbox cap exceeded; the engine must close the session.
    Overflow,
    /// Session already terminal; frame dropped.
    Closed,
}

/// One end-to-end invocation against an app.
pub(crate) struct Session {
    pub id: u64,
    pub event: String,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    state: SessionState,
    upstream: mpsc::UnboundedSender<UpstreamFrame>,
    /// Slave sink plus owning slave id while assigned.
    downstream: Option<(Uuid, mpsc::Sender<Frame>)>,
    /// Frames not yet handed to the slave, oldest first.
    outbox: VecDeque<Frame>,
    outbox_cap: usize,
    /// Caller finished its input stream.
    choked: bool,
}

impl Session {
    pub fn new(
        id: u64,
        event: String,
        upstream: mpsc::UnboundedSender<UpstreamFrame>,
        deadline: Option<Instant>,
        outbox_cap: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            event,
            created_at: now,
            deadline,
            state: SessionState::Queued,
            upstream,
            downstream: None,
            outbox: VecDeque::new(),
            outbox_cap: outbox_cap.max(1),
            choked: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The slave currently serving this session, if any.
    pub fn assigned_slave(&self) -> Option<Uuid> {
        self.downstream.as_ref().map(|(id, _)| *id)
    }

    /// Accepts one payload frame from the caller.
    pub fn write(&mut self, data: Vec<u8>) -> WriteOutcome {
        if self.state.is_terminal() {
            return WriteOutcome::Closed;
        }
        if self.outbox.len() >= self.outbox_cap {
            return WriteOutcome::Overflow;
        }
        self.outbox.push_back(Frame::Chunk {
            span: self.id,
            data,
        });
        self.pump();
        WriteOutcome::Accepted
    }

    /// Caller finished writing; a choke follows the last buffered chunk.
    pub fn choke(&mut self) {
        if self.state.is_terminal() || self.choked {
            return;
        }
        self.choked = true;
        self.outbox.push_back(Frame::Choke { span: self.id });
        self.pump();
    }

    /// Pairs the session with a slave: open frame first, then the buffered
    /// backlog, in order.
    pub fn attach(&mut self, slave: Uuid, sink: mpsc::Sender<Frame>) {
        debug_assert_eq!(self.state, SessionState::Queued);
        self.outbox.push_front(Frame::Open {
            span: self.id,
            event: self.event.clone(),
        });
        self.downstream = Some((slave, sink));
        self.state = SessionState::Assigned;
        self.pump();
    }

    /// Flushes as much of the outbox as the slave channel accepts right
    /// now. Safe to call any time; the engine calls it once per tick for
    /// assigned sessions.
    pub fn pump(&mut self) {
        let Some((_, sink)) = &self.downstream else {
            return;
        };
        while let Some(frame) = self.outbox.front() {
            match sink.try_send(frame.clone()) {
                Ok(()) => {
                    self.outbox.pop_front();
                }
                Err(_) => break,
            }
        }
    }

    /// Relays a worker payload frame to the caller.
    pub fn relay_chunk(&self, data: Vec<u8>) {
        let _ = self.upstream.send(UpstreamFrame::Chunk(data));
    }

    /// Closes cleanly: worker signalled end-of-stream.
    pub fn close_ok(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::ClosedOk;
        self.downstream = None;
        self.outbox.clear();
        let _ = self.upstream.send(UpstreamFrame::Choke);
    }

    /// Closes with an error; the reason is the caller's last frame.
    pub fn close_error(&mut self, reason: SessionError) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::ClosedError;
        self.downstream = None;
        self.outbox.clear();
        let _ = self.upstream.send(UpstreamFrame::Error(reason));
    }

    /// Cancels the session. Idempotent; returns the slave to notify if the
    /// session was assigned (the engine sends the abort).
    pub fn cancel(&mut self) -> Option<(Uuid, mpsc::Sender<Frame>)> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = SessionState::Cancelled;
        self.outbox.clear();
        self.downstream.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(cap: usize) -> (Session, mpsc::UnboundedReceiver<UpstreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = Session::new(7, "echo".into(), tx, None, cap, Instant::now());
        (s, rx)
    }

    #[test]
    fn buffered_writes_replay_in_order_on_attach() {
        let (mut s, _rx) = session(8);
        assert_eq!(s.write(b"one".to_vec()), WriteOutcome::Accepted);
        assert_eq!(s.write(b"two".to_vec()), WriteOutcome::Accepted);
        s.choke();

        let (sink, mut slave_rx) = mpsc::channel(16);
        s.attach(Uuid::new_v4(), sink);

        let open = slave_rx.try_recv().unwrap();
        assert!(matches!(open, Frame::Open { span: 7, ref event } if event == "echo"));
        assert!(matches!(slave_rx.try_recv().unwrap(), Frame::Chunk { ref data, .. } if data == b"one"));
        assert!(matches!(slave_rx.try_recv().unwrap(), Frame::Chunk { ref data, .. } if data == b"two"));
        assert!(matches!(slave_rx.try_recv().unwrap(), Frame::Choke { span: 7 }));
    }

    #[test]
    fn writes_after_attach_flow_directly() {
        let (mut s, _rx) = session(8);
        let (sink, mut slave_rx) = mpsc::channel(16);
        s.attach(Uuid::new_v4(), sink);
        let _ = slave_rx.try_recv(); // open

        s.write(b"later".to_vec());
        assert!(matches!(slave_rx.try_recv().unwrap(), Frame::Chunk { ref data, .. } if data == b"later"));
    }

    #[test]
    fn overflow_is_reported_at_the_cap() {
        let (mut s, _rx) = session(2);
        assert_eq!(s.write(b"a".to_vec()), WriteOutcome::Accepted);
        assert_eq!(s.write(b"b".to_vec()), WriteOutcome::Accepted);
        assert_eq!(s.write(b"c".to_vec()), WriteOutcome::Overflow);
    }

    #[test]
    fn saturated_slave_channel_backs_up_into_outbox() {
        let (mut s, _rx) = session(2);
        let (sink, _slave_rx) = mpsc::channel(1);
        s.attach(Uuid::new_v4(), sink); // open takes the only slot

        assert_eq!(s.write(b"a".to_vec()), WriteOutcome::Accepted);
        assert_eq!(s.write(b"b".to_vec()), WriteOutcome::Accepted);
        assert_eq!(s.write(b"c".to_vec()), WriteOutcome::Overflow);
    }

    #[test]
    fn close_ok_emits_choke_upstream_once() {
        let (mut s, mut rx) = session(4);
        s.close_ok();
        s.close_ok();
        assert_eq!(rx.try_recv().unwrap(), UpstreamFrame::Choke);
        assert!(rx.try_recv().is_err());
        assert_eq!(s.write(b"x".to_vec()), WriteOutcome::Closed);
    }

    #[test]
    fn cancel_is_idempotent_and_reports_the_bound_slave() {
        let (mut s, mut rx) = session(4);
        let (sink, _slave_rx) = mpsc::channel(4);
        let slave = Uuid::new_v4();
        s.attach(slave, sink);

        let bound = s.cancel().unwrap();
        assert_eq!(bound.0, slave);
        assert!(s.cancel().is_none());
        assert_eq!(s.state(), SessionState::Cancelled);
        // No upstream frame for a caller-initiated cancel.
        assert!(rx.try_recv().is_err());
    }
}
