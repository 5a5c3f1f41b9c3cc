// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch queue: per-publisher ordering over the packet store.
//!
//! A packet is dispatch-ready only when its pid is exactly one greater than
//! the last pid dispatched for its publisher. Anything above that stays held
//! in the store until the gap closes or [`DispatchQueue::declare_lost`] moves
//! the baseline past it.
//!
//! # Example
//!
//! ```
//! use rmc_sub::reliability::{DispatchQueue, PacketStore};
//!
//! let mut store = PacketStore::new();
//! let mut queue = DispatchQueue::new(false);
//!
//! for pid in [2, 1] {
//!     queue.admit(7, pid).unwrap();
//!     store.submit(7, pid, vec![pid as u8]).unwrap();
//! }
//!
//! let first = queue.next_ready(7, &store).unwrap();
//! assert_eq!(first.pid, 1);
//! queue.mark_dispatched(first.handle(), &mut store).unwrap();
//! assert_eq!(queue.next_ready(7, &store).unwrap().pid, 2);
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;

use super::packet_store::{AckState, Packet, PacketRef, PacketStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Highest contiguous pid handed to the application (0 = none yet).
    last_dispatched: u64,
}

/// Per-publisher delivery cursors.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    cursors: BTreeMap<u32, Cursor>,
    join_mid_stream: bool,
    /// Publisher served last by `next_ready_any`, for round-robin fairness.
    last_served: Option<u32>,
}

impl DispatchQueue {
    /// `join_mid_stream` makes the first pid seen from a new publisher its
    /// delivery start instead of pid 1.
    pub fn new(join_mid_stream: bool) -> Self {
        Self {
            join_mid_stream,
            ..Self::default()
        }
    }

    /// Check an arriving pid against the publisher's cursor.
    ///
    /// Creates the cursor on first contact. Pids already delivered yield
    /// `DuplicatePacket`.
    pub fn admit(&mut self, publisher: u32, pid: u64) -> Result<()> {
        let join_mid_stream = self.join_mid_stream;
        let cursor = self.cursors.entry(publisher).or_insert_with(|| {
            let last_dispatched = if join_mid_stream {
                pid.saturating_sub(1)
            } else {
                0
            };
            log::debug!(
                "[DISPATCH] New publisher {:#010x}, delivery starts after pid {}",
                publisher,
                last_dispatched
            );
            Cursor { last_dispatched }
        });
        if pid <= cursor.last_dispatched {
            return Err(Error::DuplicatePacket { publisher, pid });
        }
        Ok(())
    }

    /// Highest contiguous pid dispatched for `publisher`.
    #[must_use]
    pub fn last_dispatched(&self, publisher: u32) -> Option<u64> {
        self.cursors.get(&publisher).map(|c| c.last_dispatched)
    }

    /// Next dispatch-ready packet for `publisher`, if any.
    ///
    /// Repeated calls return the same packet until it is marked dispatched.
    #[must_use]
    pub fn next_ready<'s>(&self, publisher: u32, store: &'s PacketStore) -> Option<Packet<'s>> {
        let cursor = self.cursors.get(&publisher)?;
        let next = cursor.last_dispatched.checked_add(1)?;
        store.get(PacketRef::new(publisher, next))
    }

    /// Next dispatch-ready packet from any publisher, rotating the starting
    /// publisher on each call.
    #[must_use]
    pub fn next_ready_any<'s>(&mut self, store: &'s PacketStore) -> Option<Packet<'s>> {
        let after = match self.last_served {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let before = match self.last_served {
            Some(id) => Bound::Included(id),
            None => Bound::Excluded(0),
        };
        let order: Vec<u32> = self
            .cursors
            .range((after, Bound::Unbounded))
            .chain(self.cursors.range((Bound::Unbounded, before)))
            .map(|(&id, _)| id)
            .collect();

        let packet = order
            .into_iter()
            .find_map(|publisher| self.next_ready(publisher, store))?;
        self.last_served = Some(packet.publisher);
        Some(packet)
    }

    /// Hand a packet to the application: advance the cursor and release the
    /// payload.
    ///
    /// Only the current dispatch-ready packet of its publisher is accepted.
    pub fn mark_dispatched(&mut self, packet: PacketRef, store: &mut PacketStore) -> Result<()> {
        let cursor = self
            .cursors
            .get_mut(&packet.publisher())
            .ok_or(Error::InvalidArgument("unknown publisher"))?;
        if cursor.last_dispatched.checked_add(1) != Some(packet.pid())
            || store.state(packet) != Some(AckState::Received)
        {
            return Err(Error::InvalidArgument("packet is not dispatch-ready"));
        }
        store.mark_dispatched(packet)?;
        cursor.last_dispatched = packet.pid();
        Ok(())
    }

    /// Give up on every pid up to `up_to_pid` for `publisher`.
    ///
    /// Held packets in the skipped range are dropped; the first held packet
    /// above it becomes dispatch-ready. Returns the number of dropped packets.
    pub fn declare_lost(
        &mut self,
        publisher: u32,
        up_to_pid: u64,
        store: &mut PacketStore,
    ) -> Result<usize> {
        let cursor = self
            .cursors
            .get_mut(&publisher)
            .ok_or(Error::InvalidArgument("unknown publisher"))?;
        if up_to_pid <= cursor.last_dispatched {
            return Ok(0);
        }
        let dropped = store.discard_through(publisher, up_to_pid);
        log::debug!(
            "[DISPATCH] Publisher {:#010x}: pids {}..={} declared lost ({} held packets dropped)",
            publisher,
            cursor.last_dispatched + 1,
            up_to_pid,
            dropped
        );
        cursor.last_dispatched = up_to_pid;
        Ok(dropped)
    }
}
