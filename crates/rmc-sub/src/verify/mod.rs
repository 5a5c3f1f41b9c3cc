// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence integrity verifier.
//!
//! Per-publisher state machine checking that pids arrive consecutively and
//! that every publisher reaches the maximum it declared.
//!
//! ```text
//! Inactive ──expect()──> NotStarted ──first packet──> InProgress ──pid == max──> Completed
//! ```
//!
//! Guards for an incoming `(node_id, pid, declared_max)`, in order:
//!
//! 1. `node_id` outside the table -> `OutOfRange`
//! 2. `Inactive` -> `UnexpectedPublisher`
//! 3. `Completed` -> `ProtocolViolation(AfterCompletion)`
//! 4. `NotStarted` -> record `declared_max`, `max_received = 0`, continue as `InProgress`
//! 5. `InProgress` -> `declared_max` unchanged and `pid == max_received + 1`
//!
//! A rejected packet never changes the table.

mod payload;

pub use payload::PayloadTriplet;

use crate::error::{Error, Result, Violation};

/// Verification state of one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Traffic from this publisher is a violation.
    Inactive,
    /// Expected but not yet seen.
    NotStarted,
    /// Receiving.
    InProgress { max_expected: u64, max_received: u64 },
    /// Every declared packet received.
    Completed { max_expected: u64 },
}

/// Result of a successfully verified packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Accepted; the publisher still has packets to go.
    Accepted,
    /// This packet completed its publisher.
    PublisherCompleted,
    /// This packet completed the last outstanding publisher.
    AllDone,
}

/// Expectation table indexed by node id.
#[derive(Debug, Clone)]
pub struct SequenceVerifier {
    table: Vec<Expectation>,
}

impl SequenceVerifier {
    /// Table of `size` publishers, all `Inactive`.
    pub fn new(size: usize) -> Self {
        Self {
            table: vec![Expectation::Inactive; size],
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Mark `node_id` as expected.
    ///
    /// Publishers already receiving keep their state.
    pub fn expect(&mut self, node_id: u32) -> Result<()> {
        let slot = self.slot_mut(node_id)?;
        if *slot == Expectation::Inactive {
            *slot = Expectation::NotStarted;
        }
        Ok(())
    }

    #[must_use]
    pub fn state(&self, node_id: u32) -> Option<Expectation> {
        self.table.get(node_id as usize).copied()
    }

    /// True when every expected publisher completed.
    ///
    /// A table with nothing expected is trivially done.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.table
            .iter()
            .all(|e| matches!(e, Expectation::Inactive | Expectation::Completed { .. }))
    }

    /// Number of expected publishers that have not completed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table
            .iter()
            .filter(|e| matches!(e, Expectation::NotStarted | Expectation::InProgress { .. }))
            .count()
    }

    /// Parse and verify a raw payload.
    pub fn verify_payload(&mut self, payload: &[u8]) -> Result<Progress> {
        let triplet = PayloadTriplet::parse(payload)?;
        self.verify(triplet)
    }

    /// Run one packet through the state machine.
    pub fn verify(&mut self, packet: PayloadTriplet) -> Result<Progress> {
        let node_id = packet.node_id;
        let breach = |violation| Error::ProtocolViolation { node_id, violation };

        let (max_expected, max_received) = match *self.slot_mut(node_id)? {
            Expectation::Inactive => return Err(Error::UnexpectedPublisher(node_id)),
            Expectation::Completed { max_expected } => {
                return Err(breach(Violation::AfterCompletion {
                    max_received: max_expected,
                    pid: packet.pid,
                }))
            }
            Expectation::NotStarted => (packet.max_expected, 0),
            Expectation::InProgress {
                max_expected,
                max_received,
            } => (max_expected, max_received),
        };

        if packet.max_expected != max_expected {
            return Err(breach(Violation::DeclaredMaxChanged {
                expected: max_expected,
                declared: packet.max_expected,
            }));
        }
        let wanted = max_received + 1;
        if packet.pid != wanted {
            return Err(breach(Violation::OutOfOrder {
                wanted,
                got: packet.pid,
            }));
        }

        let slot = self.slot_mut(node_id)?;
        if packet.pid == max_expected {
            *slot = Expectation::Completed { max_expected };
            log::debug!("[VERIFY] Node {} completed at pid {}", node_id, packet.pid);
            if self.all_done() {
                return Ok(Progress::AllDone);
            }
            return Ok(Progress::PublisherCompleted);
        }

        *slot = Expectation::InProgress {
            max_expected,
            max_received: packet.pid,
        };
        Ok(Progress::Accepted)
    }

    fn slot_mut(&mut self, node_id: u32) -> Result<&mut Expectation> {
        let table_size = self.table.len();
        self.table
            .get_mut(node_id as usize)
            .ok_or(Error::OutOfRange {
                node_id,
                table_size,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_expecting(size: usize, nodes: &[u32]) -> SequenceVerifier {
        let mut verifier = SequenceVerifier::new(size);
        for &node in nodes {
            verifier.expect(node).unwrap();
        }
        verifier
    }

    #[test]
    fn test_single_publisher_completes() {
        let mut verifier = verifier_expecting(4, &[2]);
        assert!(!verifier.all_done());

        assert_eq!(verifier.verify_payload(b"2:1:3").unwrap(), Progress::Accepted);
        assert_eq!(
            verifier.state(2),
            Some(Expectation::InProgress {
                max_expected: 3,
                max_received: 1
            })
        );
        assert_eq!(verifier.verify_payload(b"2:2:3").unwrap(), Progress::Accepted);
        assert_eq!(verifier.verify_payload(b"2:3:3").unwrap(), Progress::AllDone);
        assert_eq!(verifier.state(2), Some(Expectation::Completed { max_expected: 3 }));
        assert!(verifier.all_done());
    }

    #[test]
    fn test_node_outside_table() {
        let mut verifier = verifier_expecting(4, &[]);
        assert!(matches!(
            verifier.verify_payload(b"5:1:1"),
            Err(Error::OutOfRange {
                node_id: 5,
                table_size: 4
            })
        ));
        assert!(verifier.expect(4).is_err());
    }

    #[test]
    fn test_unexpected_publisher() {
        let mut verifier = verifier_expecting(4, &[1]);
        assert!(matches!(
            verifier.verify_payload(b"0:1:3"),
            Err(Error::UnexpectedPublisher(0))
        ));
    }

    #[test]
    fn test_gap_is_violation() {
        let mut verifier = verifier_expecting(4, &[1]);
        verifier.verify_payload(b"1:1:5").unwrap();
        assert!(matches!(
            verifier.verify_payload(b"1:3:5"),
            Err(Error::ProtocolViolation {
                node_id: 1,
                violation: Violation::OutOfOrder { wanted: 2, got: 3 }
            })
        ));
        // Rejected packet leaves the record untouched.
        assert_eq!(
            verifier.state(1),
            Some(Expectation::InProgress {
                max_expected: 5,
                max_received: 1
            })
        );
    }

    #[test]
    fn test_first_packet_must_be_pid_one() {
        let mut verifier = verifier_expecting(2, &[0]);
        assert!(matches!(
            verifier.verify_payload(b"0:4:9"),
            Err(Error::ProtocolViolation {
                violation: Violation::OutOfOrder { wanted: 1, got: 4 },
                ..
            })
        ));
        assert_eq!(verifier.state(0), Some(Expectation::NotStarted));
    }

    #[test]
    fn test_declared_max_must_not_change() {
        let mut verifier = verifier_expecting(2, &[1]);
        verifier.verify_payload(b"1:1:5").unwrap();
        assert!(matches!(
            verifier.verify_payload(b"1:2:6"),
            Err(Error::ProtocolViolation {
                violation: Violation::DeclaredMaxChanged {
                    expected: 5,
                    declared: 6
                },
                ..
            })
        ));
    }

    #[test]
    fn test_traffic_after_completion() {
        let mut verifier = verifier_expecting(2, &[0, 1]);
        assert_eq!(
            verifier.verify_payload(b"0:1:1").unwrap(),
            Progress::PublisherCompleted
        );
        assert!(!verifier.all_done());
        assert_eq!(verifier.outstanding(), 1);

        for payload in [&b"0:2:1"[..], b"0:1:1"] {
            assert!(matches!(
                verifier.verify_payload(payload),
                Err(Error::ProtocolViolation {
                    violation: Violation::AfterCompletion { .. },
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_malformed_payload_leaves_table_untouched() {
        let mut verifier = verifier_expecting(4, &[2]);
        let before = verifier.clone().table;
        assert!(matches!(
            verifier.verify_payload(b"abc"),
            Err(Error::MalformedPayload(_))
        ));
        assert_eq!(verifier.table, before);
    }
}
