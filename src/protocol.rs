//! # Frame vocabulary for worker and upstream channels.
//!
//! Two channels meet in the engine, and both are frame-oriented:
//!
//! - The **worker channel** (engine ↔ worker) carries [`Frame`]s. Control
//!   frames (`Handshake`, `Heartbeat`, `Terminate`) concern the worker as a
//!   whole; the rest are keyed by a 64-bit span id and belong to one
//!   session.
//! - The **upstream channel** (engine → caller) carries [`UpstreamFrame`]s
//!   for exactly one session, so no span key is needed.
//!
//! ## Rules
//! - `Open` carries the event name and starts a span; `Choke` ends it
//!   cleanly; `Error` ends it with a failure.
//! - Frames within one span are strictly ordered end-to-end.
//! - A worker serves one span at a time; interleaved spans are a protocol
//!   violation.
//!
//! The frames are serde-tagged so transport implementations (e.g. the
//! newline-delimited JSON stdio codec in
//! [`ProcessIsolate`](crate::isolate::ProcessIsolate)) can encode them
//! directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// One frame on the worker channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Worker → engine: first frame after boot; doubles as the first
    /// heartbeat.
    Handshake {
        /// The slave id the worker was spawned with.
        slave: Uuid,
    },
    /// Worker → engine: liveness signal.
    Heartbeat,
    /// Engine → worker: polite stop request; the worker should finish its
    /// current span and exit.
    Terminate,
    /// Engine → worker: start of a session span.
    Open {
        /// Span id (equals the session id).
        span: u64,
        /// Event name the caller invoked.
        event: String,
    },
    /// Payload frame, either direction.
    Chunk {
        /// Span id.
        span: u64,
        /// Opaque payload bytes.
        data: Vec<u8>,
    },
    /// Clean end-of-stream for a span, either direction.
    Choke {
        /// Span id.
        span: u64,
    },
    /// Failure on a span, either direction.
    Error {
        /// Span id.
        span: u64,
        /// Application-defined error code.
        code: u32,
        /// Human-readable message.
        message: String,
    },
}

impl Frame {
    /// Returns the span id for session-scoped frames, `None` for control
    /// frames.
    pub fn span(&self) -> Option<u64> {
        match self {
            Frame::Open { span, .. }
            | Frame::Chunk { span, .. }
            | Frame::Choke { span }
            | Frame::Error { span, .. } => Some(*span),
            Frame::Handshake { .. } | Frame::Heartbeat | Frame::Terminate => None,
        }
    }
}

/// One frame delivered to a session's caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// Response payload from the worker.
    Chunk(Vec<u8>),
    /// Clean end-of-stream; the session closed ok.
    Choke,
    /// The session closed with an error; always the last frame.
    Error(SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    // The JSON tags are the wire contract for stdio workers; changing
    // them breaks every deployed slave binary.
    #[test]
    fn frame_tags_are_stable() {
        let open = serde_json::to_value(Frame::Open {
            span: 3,
            event: "ping".into(),
        })
        .unwrap();
        assert_eq!(open["type"], "open");
        assert_eq!(open["span"], 3);

        let parsed: Frame =
            serde_json::from_str(r#"{"type":"chunk","span":3,"data":[104,105]}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::Chunk {
                span: 3,
                data: b"hi".to_vec()
            }
        );

        let heartbeat: Frame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, Frame::Heartbeat);
        assert_eq!(heartbeat.span(), None);
    }
}
