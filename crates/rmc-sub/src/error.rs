// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the subscriber engine.
//!
//! Protocol-level breaches (`OutOfRange`, `UnexpectedPublisher`,
//! `ProtocolViolation`, `MalformedPayload`) are surfaced to the caller, who
//! decides whether to log and continue or to abort. `Timeout` and
//! `SelfLoopback` are scheduling signals, see [`Error::is_control_flow`].

use std::fmt;
use std::io;

/// Sequence-integrity breach detected by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Traffic arrived for a publisher that already completed.
    AfterCompletion {
        /// Last pid accepted before completion.
        max_received: u64,
        /// Offending pid.
        pid: u64,
    },
    /// The declared maximum differs from the one recorded on the first packet.
    DeclaredMaxChanged {
        /// Maximum recorded on activation.
        expected: u64,
        /// Maximum carried by the offending packet.
        declared: u64,
    },
    /// The pid is not exactly one greater than the last accepted pid.
    OutOfOrder {
        /// Pid that would have been accepted.
        wanted: u64,
        /// Pid that arrived.
        got: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::AfterCompletion { max_received, pid } => write!(
                f,
                "traffic after completion (completed at {}, got {})",
                max_received, pid
            ),
            Violation::DeclaredMaxChanged { expected, declared } => write!(
                f,
                "declared maximum changed from {} to {}",
                expected, declared
            ),
            Violation::OutOfOrder { wanted, got } => {
                write!(f, "non-consecutive pid (wanted {}, got {})", wanted, got)
            }
        }
    }
}

/// Errors returned by subscriber engine operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Stale or unknown handle passed to an accessor.
    InvalidArgument(&'static str),
    /// Configuration rejected by validation.
    Config(String),

    // ========================================================================
    // Protocol errors
    // ========================================================================
    /// Publisher identifier outside the configured expectation table.
    OutOfRange {
        /// Offending identifier.
        node_id: u32,
        /// Size of the expectation table.
        table_size: usize,
    },
    /// Traffic from a publisher that was not marked expected.
    UnexpectedPublisher(u32),
    /// Sequence-integrity breach for a publisher.
    ProtocolViolation {
        /// Publisher the breach was detected on.
        node_id: u32,
        /// What went wrong.
        violation: Violation,
    },
    /// Application payload does not parse into the expected fields.
    MalformedPayload(String),
    /// Datagram or stream frame does not decode.
    MalformedPacket(&'static str),
    /// Packet with this pid is already held or was already delivered.
    DuplicatePacket {
        /// Publisher context id.
        publisher: u32,
        /// Duplicated pid.
        pid: u64,
    },

    // ========================================================================
    // Control flow
    // ========================================================================
    /// Readiness wait elapsed without events.
    Timeout,
    /// Packet originated from this same context.
    SelfLoopback,

    // ========================================================================
    // Resource / lifecycle errors
    // ========================================================================
    /// All unicast slots are in use.
    ConnectionLimit(usize),
    /// Context is shutting down and accepts no new work.
    ShuttingDown,
    /// I/O error from the transport or readiness primitive.
    Io(io::Error),
}

impl Error {
    /// True for outcomes that are normal scheduling signals, not failures.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Error::Timeout | Error::SelfLoopback)
    }

    /// True for sequence-integrity and payload errors raised by the verifier.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. }
                | Error::UnexpectedPublisher(_)
                | Error::ProtocolViolation { .. }
                | Error::MalformedPayload(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::OutOfRange {
                node_id,
                table_size,
            } => write!(
                f,
                "Node id {} is out of range (0-{})",
                node_id,
                table_size.saturating_sub(1)
            ),
            Error::UnexpectedPublisher(node_id) => {
                write!(f, "Node id {} is not expected", node_id)
            }
            Error::ProtocolViolation { node_id, violation } => {
                write!(f, "Protocol violation on node id {}: {}", node_id, violation)
            }
            Error::MalformedPayload(payload) => write!(
                f,
                "Payload [{}] could not be scanned as <node_id>:<pid>:<max>",
                payload
            ),
            Error::MalformedPacket(what) => write!(f, "Malformed packet: {}", what),
            Error::DuplicatePacket { publisher, pid } => {
                write!(f, "Duplicate packet {} from publisher {:#010x}", pid, publisher)
            }
            Error::Timeout => write!(f, "Timed out"),
            Error::SelfLoopback => write!(f, "Loopback packet from own context"),
            Error::ConnectionLimit(max) => {
                write!(f, "Connection limit reached ({} slots in use)", max)
            }
            Error::ShuttingDown => write!(f, "Context is shutting down"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result alias for subscriber engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flow_classification() {
        assert!(Error::Timeout.is_control_flow());
        assert!(Error::SelfLoopback.is_control_flow());
        assert!(!Error::UnexpectedPublisher(0).is_control_flow());
        assert!(!Error::ShuttingDown.is_control_flow());
    }

    #[test]
    fn test_protocol_classification() {
        let violation = Error::ProtocolViolation {
            node_id: 1,
            violation: Violation::OutOfOrder { wanted: 2, got: 3 },
        };
        assert!(violation.is_protocol());
        assert!(Error::MalformedPayload("abc".into()).is_protocol());
        assert!(!Error::MalformedPacket("short").is_protocol());
        assert!(!Error::Timeout.is_protocol());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::OutOfRange {
            node_id: 5,
            table_size: 4,
        };
        assert_eq!(err.to_string(), "Node id 5 is out of range (0-3)");

        let err = Error::ProtocolViolation {
            node_id: 1,
            violation: Violation::OutOfOrder { wanted: 2, got: 3 },
        };
        assert_eq!(
            err.to_string(),
            "Protocol violation on node id 1: non-consecutive pid (wanted 2, got 3)"
        );
    }

    #[test]
    fn test_io_source() {
        use std::error::Error as _;
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(err.source().is_some());
        assert!(Error::Timeout.source().is_none());
    }
}
