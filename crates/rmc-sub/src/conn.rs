// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection index: maps small indices to the shared multicast descriptor or
//! to individual unicast backchannel connections.
//!
//! Unicast slots live in a generation-tagged arena. Closing a connection bumps
//! the slot generation, so a [`SlotId`] held from a previous occupant no longer
//! resolves once the slot is reused.
//!
//! ```text
//!  ConnIndex::Multicast ──> multicast receive descriptor (fixed, never a slot)
//!  ConnIndex::Unicast(SlotId { index, generation }) ──> slots[index] if generation matches
//! ```

use std::net::SocketAddr;

use crate::readiness::{Descriptor, Interest};

/// Reserved token value for the multicast descriptor; unicast tokens are
/// offset by one so they never collide with it.
const MULTICAST_TOKEN: u64 = 0;

/// Generations older than the current one by more than this are treated as
/// never issued rather than closed.
const MAX_GENERATION_LAG: u32 = u32::MAX / 2;

/// Generation-tagged unicast slot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Slot position in `[0, max_connections)`.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Connection index as seen by the readiness host and the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnIndex {
    /// The shared multicast receive descriptor.
    Multicast,
    /// One unicast backchannel connection.
    Unicast(SlotId),
}

impl ConnIndex {
    /// Encode into an opaque integer suitable for poll tokens.
    #[must_use]
    pub fn to_token(self) -> u64 {
        match self {
            ConnIndex::Multicast => MULTICAST_TOKEN,
            ConnIndex::Unicast(slot) => {
                (u64::from(slot.generation) << 32) | (u64::from(slot.index) + 1)
            }
        }
    }

    /// Decode a value produced by [`ConnIndex::to_token`].
    #[must_use]
    pub fn from_token(token: u64) -> Self {
        if token == MULTICAST_TOKEN {
            ConnIndex::Multicast
        } else {
            ConnIndex::Unicast(SlotId {
                index: (token & 0xffff_ffff).wrapping_sub(1) as u32,
                generation: (token >> 32) as u32,
            })
        }
    }
}

/// Unicast connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect issued, waiting for the first writable notification.
    Connecting,
    /// Usable for reads and writes.
    Established,
    /// Draining queued output before close.
    Closing,
    /// Closed and its slot vacated; reported for handles of former occupants.
    Closed,
}

/// One unicast backchannel connection.
#[derive(Debug)]
pub struct Connection {
    /// OS descriptor owned by the transport.
    pub descriptor: Descriptor,
    /// Remote publisher backchannel address.
    pub remote_addr: SocketAddr,
    /// Publisher context id served by this connection.
    pub publisher: u32,
    pub state: ConnectionState,
    /// Interest currently registered with the readiness host.
    pub interest: Interest,
    /// Outgoing bytes not yet accepted by the transport.
    pub send_queue: Vec<u8>,
    /// Offset of the first unsent byte in `send_queue`.
    pub send_offset: usize,
    /// Partial inbound stream frame.
    pub recv_buffer: Vec<u8>,
}

impl Connection {
    pub fn new(descriptor: Descriptor, remote_addr: SocketAddr, publisher: u32) -> Self {
        Self {
            descriptor,
            remote_addr,
            publisher,
            state: ConnectionState::Connecting,
            interest: Interest::READABLE.add(Interest::WRITABLE),
            send_queue: Vec::new(),
            send_offset: 0,
            recv_buffer: Vec::new(),
        }
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn pending_output(&self) -> &[u8] {
        &self.send_queue[self.send_offset..]
    }

    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        self.send_offset < self.send_queue.len()
    }

    /// Append bytes to the send queue.
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.send_queue.extend_from_slice(bytes);
    }

    /// Record that `written` bytes left the queue.
    pub fn consume_output(&mut self, written: usize) {
        self.send_offset = (self.send_offset + written).min(self.send_queue.len());
        if self.send_offset == self.send_queue.len() {
            self.send_queue.clear();
            self.send_offset = 0;
        }
    }

    /// Interest this connection needs given its state and queue.
    #[must_use]
    pub fn wanted_interest(&self) -> Interest {
        match self.state {
            ConnectionState::Connecting => Interest::READABLE.add(Interest::WRITABLE),
            _ if self.has_pending_output() => Interest::READABLE.add(Interest::WRITABLE),
            _ => Interest::READABLE,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    connection: Option<Connection>,
}

/// Fixed-capacity, generation-tagged table of unicast connections.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ConnectionTable {
    /// Create a table with `capacity` unicast slots.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                connection: None,
            })
            .collect();
        // Reversed so that pop() hands out the lowest index first.
        let free = (0..capacity as u32).rev().collect();
        Self { slots, free }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a connection into a free slot.
    ///
    /// Returns `None` when every slot is occupied.
    pub fn insert(&mut self, connection: Connection) -> Option<SlotId> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.connection = Some(connection);
        Some(SlotId {
            index,
            generation: slot.generation,
        })
    }

    /// Peek at the id the next `insert` would hand out.
    #[must_use]
    pub fn next_free(&self) -> Option<SlotId> {
        self.free.last().map(|&index| SlotId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    #[must_use]
    pub fn get(&self, id: SlotId) -> Option<&Connection> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.connection.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.connection.as_mut())
    }

    /// Lifecycle state of the connection behind `id`.
    ///
    /// A handle from an earlier generation of the slot reports `Closed`; an
    /// out-of-range or never-issued handle yields `None`.
    #[must_use]
    pub fn state(&self, id: SlotId) -> Option<ConnectionState> {
        let slot = self.slots.get(id.index())?;
        if slot.generation == id.generation {
            slot.connection.as_ref().map(|conn| conn.state)
        } else if slot.generation.wrapping_sub(id.generation) <= MAX_GENERATION_LAG {
            Some(ConnectionState::Closed)
        } else {
            None
        }
    }

    /// Vacate a slot and bump its generation.
    ///
    /// The returned connection is marked `Closed`. Stale ids (wrong generation)
    /// are ignored and return `None`.
    pub fn remove(&mut self, id: SlotId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let mut connection = slot.connection.take()?;
        connection.state = ConnectionState::Closed;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(connection)
    }

    /// Ids of all occupied slots.
    pub fn ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.connection.is_some())
            .map(|(index, slot)| SlotId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Iterate over occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Connection)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.connection.as_ref().map(|conn| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    conn,
                )
            })
        })
    }
}
