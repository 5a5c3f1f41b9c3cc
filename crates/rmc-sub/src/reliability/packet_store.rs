// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet store for received publisher packets.
//!
//! Owns every packet from arrival until its acknowledgement has been sent.
//! The payload buffer is released as soon as the application marks the packet
//! dispatched; only the acknowledgement bookkeeping survives past that point.
//!
//! ```text
//! submit() ──> Received ──mark_dispatched()──> Dispatched ──mark_acknowledged()──> (removed)
//!              [payload]                       [no payload]
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Acknowledgement lifecycle of a stored packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Held, payload available, not yet handed to the application.
    Received,
    /// Delivered to the application, acknowledgement not yet sent.
    Dispatched,
    /// Acknowledgement sent; record is about to be released.
    Acknowledged,
}

/// Handle to a stored packet: publisher context id plus pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketRef {
    publisher: u32,
    pid: u64,
}

impl PacketRef {
    pub fn new(publisher: u32, pid: u64) -> Self {
        Self { publisher, pid }
    }

    #[must_use]
    pub fn publisher(&self) -> u32 {
        self.publisher
    }

    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid
    }
}

/// Borrowed view of a dispatch-ready packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub publisher: u32,
    pub pid: u64,
    pub payload: &'a [u8],
}

impl Packet<'_> {
    #[must_use]
    pub fn handle(&self) -> PacketRef {
        PacketRef::new(self.publisher, self.pid)
    }
}

#[derive(Debug)]
struct StoredPacket {
    payload: Option<Vec<u8>>,
    state: AckState,
}

/// Received packets keyed by publisher, ordered by pid.
#[derive(Debug, Default)]
pub struct PacketStore {
    publishers: HashMap<u32, BTreeMap<u64, StoredPacket>>,
    payload_bytes: usize,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a received packet.
    ///
    /// Fails with `DuplicatePacket` when the pid is already held.
    pub fn submit(&mut self, publisher: u32, pid: u64, payload: Vec<u8>) -> Result<PacketRef> {
        let packets = self.publishers.entry(publisher).or_default();
        if packets.contains_key(&pid) {
            return Err(Error::DuplicatePacket { publisher, pid });
        }
        self.payload_bytes += payload.len();
        packets.insert(
            pid,
            StoredPacket {
                payload: Some(payload),
                state: AckState::Received,
            },
        );
        Ok(PacketRef::new(publisher, pid))
    }

    #[must_use]
    pub fn contains(&self, packet: PacketRef) -> bool {
        self.record(packet).is_some()
    }

    #[must_use]
    pub fn state(&self, packet: PacketRef) -> Option<AckState> {
        self.record(packet).map(|stored| stored.state)
    }

    /// Borrow a packet whose payload is still held.
    #[must_use]
    pub fn get(&self, packet: PacketRef) -> Option<Packet<'_>> {
        let stored = self.record(packet)?;
        let payload = stored.payload.as_deref()?;
        Some(Packet {
            publisher: packet.publisher,
            pid: packet.pid,
            payload,
        })
    }

    /// Release the payload and move the packet to `Dispatched`.
    pub fn mark_dispatched(&mut self, packet: PacketRef) -> Result<()> {
        let stored = self
            .publishers
            .get_mut(&packet.publisher)
            .and_then(|packets| packets.get_mut(&packet.pid))
            .ok_or(Error::InvalidArgument("unknown packet"))?;
        if stored.state != AckState::Received {
            return Err(Error::InvalidArgument("packet already dispatched"));
        }
        if let Some(payload) = stored.payload.take() {
            self.payload_bytes -= payload.len();
        }
        stored.state = AckState::Dispatched;
        Ok(())
    }

    /// Release the remaining bookkeeping of a dispatched packet.
    pub fn mark_acknowledged(&mut self, packet: PacketRef) -> Result<()> {
        let packets = self
            .publishers
            .get_mut(&packet.publisher)
            .ok_or(Error::InvalidArgument("unknown packet"))?;
        match packets.get(&packet.pid).map(|stored| stored.state) {
            Some(AckState::Dispatched) => {
                packets.remove(&packet.pid);
                self.prune(packet.publisher);
                Ok(())
            }
            Some(_) => Err(Error::InvalidArgument("packet not dispatched")),
            None => Err(Error::InvalidArgument("unknown packet")),
        }
    }

    /// Acknowledge every dispatched packet of `publisher` up to and including
    /// `pid`. Returns how many records were released.
    pub fn acknowledge_through(&mut self, publisher: u32, pid: u64) -> usize {
        let acked: Vec<u64> = match self.publishers.get(&publisher) {
            Some(packets) => packets
                .range(..=pid)
                .filter(|(_, stored)| stored.state == AckState::Dispatched)
                .map(|(&pid, _)| pid)
                .collect(),
            None => return 0,
        };
        let mut released = 0;
        for pid in acked {
            if self.mark_acknowledged(PacketRef::new(publisher, pid)).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// True when `publisher` still has packets waiting for the application.
    #[must_use]
    pub fn has_undispatched(&self, publisher: u32) -> bool {
        self.publishers.get(&publisher).is_some_and(|packets| {
            packets
                .values()
                .any(|stored| stored.state == AckState::Received)
        })
    }

    /// Drop received-but-undispatched packets of `publisher` with pid at or
    /// below `pid`. Returns how many were dropped.
    pub fn discard_through(&mut self, publisher: u32, pid: u64) -> usize {
        let Some(packets) = self.publishers.get_mut(&publisher) else {
            return 0;
        };
        let doomed: Vec<u64> = packets
            .range(..=pid)
            .filter(|(_, stored)| stored.state == AckState::Received)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in &doomed {
            if let Some(stored) = packets.remove(pid) {
                self.payload_bytes -= stored.payload.map_or(0, |p| p.len());
            }
        }
        self.prune(publisher);
        doomed.len()
    }

    /// Drop every undispatched packet across all publishers.
    pub fn discard_undispatched(&mut self) -> usize {
        let publishers: Vec<u32> = self.publishers.keys().copied().collect();
        publishers
            .into_iter()
            .map(|publisher| self.discard_through(publisher, u64::MAX))
            .sum()
    }

    /// Forget everything held for `publisher`.
    pub fn discard_publisher(&mut self, publisher: u32) -> usize {
        let Some(packets) = self.publishers.remove(&publisher) else {
            return 0;
        };
        for stored in packets.values() {
            self.payload_bytes -= stored.payload.as_ref().map_or(0, Vec::len);
        }
        packets.len()
    }

    /// Number of packet records held, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.publishers.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Bytes of payload currently buffered.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    fn record(&self, packet: PacketRef) -> Option<&StoredPacket> {
        self.publishers
            .get(&packet.publisher)
            .and_then(|packets| packets.get(&packet.pid))
    }

    fn prune(&mut self, publisher: u32) {
        if self
            .publishers
            .get(&publisher)
            .is_some_and(BTreeMap::is_empty)
        {
            self.publishers.remove(&publisher);
        }
    }
}
