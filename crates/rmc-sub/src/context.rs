// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber context: the aggregate root of the engine.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────── SubContext ────────────────┐
//!  host loop ──event──>  │ handle_event                               │
//!                        │   ├─ hangup   -> close_connection          │
//!                        │   ├─ readable -> read -> wire -> ingest    │
//!                        │   │               PacketStore + Dispatch   │
//!                        │   │               AckScheduler::record     │
//!                        │   └─ writable -> flush send queue          │
//!  application  <──────  │ next_dispatch_ready / mark_dispatched      │
//!  host loop ──timeout─> │ process_timeouts -> AckMessage -> queue    │
//!                        └────────────────────────────────────────────┘
//! ```
//!
//! The context is single-threaded and not reentrant. It owns no event loop:
//! the caller waits on its readiness multiplexer with the deadline from
//! [`SubContext::next_deadline`] and feeds every notification back through
//! [`SubContext::handle_event`].
//!
//! # Shutdown
//!
//! [`SubContext::shutdown`] stops multicast reception and discards packets the
//! application never saw. Acknowledgements for dispatched packets are still
//! sent; the caller keeps driving the loop until `next_deadline` returns
//! [`Deadline::Infinite`], at which point every descriptor is reclaimed.
//!
//! # Read budget
//!
//! One readiness notification reads at most [`MAX_READS_PER_EVENT`] times.
//! Readiness is edge-triggered in mio, so a descriptor left with input after
//! its budget is remembered: `next_deadline` drops to zero and the next
//! `process_timeouts` resumes reading it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::{SubscriberConfig, MAX_READS_PER_EVENT, SHUTDOWN_LINGER};
use crate::conn::{ConnIndex, Connection, ConnectionState, ConnectionTable, SlotId};
use crate::error::{Error, Result};
use crate::readiness::{EventMask, Interest, ReadinessHost};
use crate::reliability::{AckScheduler, Deadline, DispatchQueue, Packet, PacketRef, PacketStore};
use crate::transport::{ReadResult, Transport};
use crate::wire::{drain_packet_frames, AckMessage, Datagram};

/// Counters exposed through [`SubContext::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Packets accepted into the store.
    pub packets_received: u64,
    /// Packets dropped because the pid was held or already delivered.
    pub duplicates: u64,
    /// Packets handed to the application.
    pub packets_dispatched: u64,
    /// Acknowledgement messages queued to publishers.
    pub acks_sent: u64,
    /// Datagrams from this same context that were skipped.
    pub loopbacks: u64,
    /// Datagrams or stream frames that failed to decode.
    pub malformed: u64,
    /// Packets dropped by `declare_lost` or shutdown.
    pub discarded: u64,
    /// Publishers whose traffic was dropped for lack of a free slot.
    pub connection_limit_drops: u64,
}

/// What a readiness notification produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many packets were accepted into the store.
    Packets(usize),
    /// A listening descriptor accepted a connection; not data.
    Accepted,
    /// Only datagrams from this same context were read.
    Loopback,
    /// Nothing of interest happened.
    Idle,
    /// The connection was closed and its index reclaimed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Active,
    ShuttingDown { since: Instant },
}

/// Subscriber-side engine for one multicast session.
pub struct SubContext {
    config: SubscriberConfig,
    context_id: u32,
    host: Box<dyn ReadinessHost>,
    transport: Box<dyn Transport>,
    connections: ConnectionTable,
    /// Publisher context id -> backchannel slot.
    publishers: HashMap<u32, SlotId>,
    /// Descriptors whose read budget ran out with input still queued.
    pending_reads: HashSet<ConnIndex>,
    store: PacketStore,
    queue: DispatchQueue,
    acks: AckScheduler,
    stats: SubscriberStats,
    lifecycle: Lifecycle,
    multicast_registered: bool,
}

impl SubContext {
    /// Create a context.
    ///
    /// The configuration is validated and the context id resolved (random when
    /// not configured). Nothing is registered with the host until
    /// [`activate`](Self::activate).
    pub fn new(
        config: SubscriberConfig,
        host: Box<dyn ReadinessHost>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let context_id = config.resolve_context_id();
        log::debug!(
            "[CTX] Created context {:#010x} (group={} port={} ack_timeout={:?} slots={})",
            context_id,
            config.multicast_group,
            config.multicast_port,
            config.ack_timeout,
            config.max_connections
        );

        Ok(Self {
            context_id,
            host,
            transport,
            connections: ConnectionTable::new(config.max_connections),
            publishers: HashMap::new(),
            pending_reads: HashSet::new(),
            store: PacketStore::new(),
            queue: DispatchQueue::new(config.join_mid_stream),
            acks: AckScheduler::new(config.ack_timeout),
            stats: SubscriberStats::default(),
            lifecycle: Lifecycle::Created,
            multicast_registered: false,
            config,
        })
    }

    #[must_use]
    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    #[must_use]
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> SubscriberStats {
        self.stats
    }

    /// Number of open backchannel connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// State of the backchannel behind `slot`; `Closed` once it was torn down.
    #[must_use]
    pub fn connection_state(&self, slot: SlotId) -> Option<ConnectionState> {
        self.connections.state(slot)
    }

    /// Backchannel slot serving `publisher`, if connected.
    #[must_use]
    pub fn publisher_slot(&self, publisher: u32) -> Option<SlotId> {
        self.publishers.get(&publisher).copied()
    }

    /// True when a descriptor still holds input beyond its read budget.
    #[must_use]
    pub fn has_pending_reads(&self) -> bool {
        !self.pending_reads.is_empty()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::ShuttingDown { .. })
    }

    /// True once shutdown has flushed every acknowledgement and reclaimed
    /// every descriptor.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.is_shutting_down()
            && !self.multicast_registered
            && self.connections.is_empty()
            && !self.acks.has_pending()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register the multicast descriptor and any open backchannels with the
    /// readiness host.
    pub fn activate(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Active => return Ok(()),
            Lifecycle::ShuttingDown { .. } => return Err(Error::ShuttingDown),
            Lifecycle::Created => {}
        }

        let tag = self.config.user_tag;
        self.host.add(
            self.transport.multicast_descriptor(),
            ConnIndex::Multicast,
            Interest::READABLE,
            tag,
        )?;
        self.multicast_registered = true;

        for (slot, conn) in self.connections.iter() {
            self.host
                .add(conn.descriptor, ConnIndex::Unicast(slot), conn.interest, tag)?;
        }

        self.lifecycle = Lifecycle::Active;
        log::debug!("[CTX] Context {:#010x} activated", self.context_id);
        Ok(())
    }

    /// Stop accepting new work and start draining.
    ///
    /// Multicast reception stops immediately and undispatched packets are
    /// discarded. Backchannels close once their acknowledgements are flushed.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown_at(Instant::now())
    }

    /// [`shutdown`](Self::shutdown) with an explicit clock reading.
    pub fn shutdown_at(&mut self, now: Instant) -> Result<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        self.lifecycle = Lifecycle::ShuttingDown { since: now };

        if self.multicast_registered {
            let fd = self.transport.multicast_descriptor();
            if let Err(e) = self
                .host
                .remove(fd, ConnIndex::Multicast, self.config.user_tag)
            {
                log::debug!("[CTX] Removing multicast descriptor failed: {}", e);
            }
            self.multicast_registered = false;
        }
        self.transport.close(ConnIndex::Multicast);
        self.pending_reads.remove(&ConnIndex::Multicast);

        let discarded = self.store.discard_undispatched();
        self.stats.discarded += discarded as u64;

        for slot in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(slot) {
                if conn.state == ConnectionState::Established {
                    conn.state = ConnectionState::Closing;
                }
            }
        }

        log::debug!(
            "[CTX] Context {:#010x} shutting down ({} undispatched packets discarded, {} connections draining)",
            self.context_id,
            discarded,
            self.connections.len()
        );
        self.reap(now);
        Ok(())
    }

    // ========================================================================
    // Readiness events
    // ========================================================================

    /// Dispatch one readiness notification.
    pub fn handle_event(&mut self, index: ConnIndex, mask: EventMask) -> Result<ReadOutcome> {
        self.handle_event_at(index, mask, Instant::now())
    }

    /// [`handle_event`](Self::handle_event) with an explicit clock reading.
    pub fn handle_event_at(
        &mut self,
        index: ConnIndex,
        mask: EventMask,
        now: Instant,
    ) -> Result<ReadOutcome> {
        if let ConnIndex::Unicast(slot) = index {
            if self.connections.get(slot).is_none() {
                log::trace!("[CTX] Event for stale slot {:?} ignored", slot);
                return Ok(ReadOutcome::Idle);
            }
        }

        if mask.hangup {
            return Ok(self.hangup(index));
        }

        let mut outcome = ReadOutcome::Idle;
        if mask.readable {
            outcome = self.read_at(index, now)?;
            if matches!(outcome, ReadOutcome::Accepted | ReadOutcome::Closed) {
                return Ok(outcome);
            }
        }
        if mask.writable {
            self.write_at(index, now)?;
        }
        Ok(outcome)
    }

    /// Read handler: drain up to [`MAX_READS_PER_EVENT`] reads from `index`.
    pub fn read(&mut self, index: ConnIndex) -> Result<ReadOutcome> {
        self.read_at(index, Instant::now())
    }

    fn read_at(&mut self, index: ConnIndex, now: Instant) -> Result<ReadOutcome> {
        let mut packets = 0;
        let mut loopback = false;
        let mut exhausted = true;
        self.pending_reads.remove(&index);

        for _ in 0..MAX_READS_PER_EVENT {
            let result = match self.transport.read(index) {
                Ok(result) => result,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match index {
                    ConnIndex::Multicast => return Err(Error::Io(e)),
                    ConnIndex::Unicast(slot) => {
                        self.close_connection(slot, &format!("read error: {}", e));
                        return Ok(ReadOutcome::Closed);
                    }
                },
            };

            match result {
                ReadResult::Data {
                    bytes,
                    from,
                    more_pending,
                } => {
                    match index {
                        ConnIndex::Multicast => match self.ingest_datagram(&bytes, from, now) {
                            Some(n) => packets += n,
                            None => loopback = true,
                        },
                        ConnIndex::Unicast(slot) => match self.ingest_stream(slot, &bytes, now) {
                            Some(n) => packets += n,
                            None => return Ok(ReadOutcome::Closed),
                        },
                    }
                    if !more_pending {
                        exhausted = false;
                        break;
                    }
                }
                ReadResult::Accepted => return Ok(ReadOutcome::Accepted),
                ReadResult::Empty => {
                    exhausted = false;
                    break;
                }
                ReadResult::Closed => {
                    if let ConnIndex::Unicast(slot) = index {
                        self.close_connection(slot, "closed by peer");
                    }
                    return Ok(ReadOutcome::Closed);
                }
            }
        }

        if exhausted {
            log::trace!("[CTX] Read budget spent on {:?}, resuming later", index);
            self.pending_reads.insert(index);
        }

        Ok(match (packets, loopback) {
            (0, true) => ReadOutcome::Loopback,
            (0, false) => ReadOutcome::Idle,
            (n, _) => ReadOutcome::Packets(n),
        })
    }

    /// Write handler: complete a pending connect and flush queued output.
    pub fn write(&mut self, index: ConnIndex) -> Result<()> {
        self.write_at(index, Instant::now())
    }

    fn write_at(&mut self, index: ConnIndex, now: Instant) -> Result<()> {
        let ConnIndex::Unicast(slot) = index else {
            return Ok(());
        };
        let shutting_down = self.is_shutting_down();
        let Some(conn) = self.connections.get_mut(slot) else {
            return Ok(());
        };

        if conn.state == ConnectionState::Connecting {
            conn.state = if shutting_down {
                ConnectionState::Closing
            } else {
                ConnectionState::Established
            };
            log::debug!(
                "[CONN] Backchannel to publisher {:#010x} at {} established (slot {})",
                conn.publisher,
                conn.remote_addr,
                slot.index()
            );
        }

        self.flush(slot)?;
        if shutting_down {
            self.reap(now);
        }
        Ok(())
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Next packet the application may consume, rotating across publishers.
    ///
    /// Returns the same packet until it is passed to
    /// [`mark_dispatched`](Self::mark_dispatched).
    pub fn next_dispatch_ready(&mut self) -> Option<Packet<'_>> {
        self.queue.next_ready_any(&self.store)
    }

    /// Next dispatch-ready packet of one publisher.
    #[must_use]
    pub fn next_dispatch_ready_from(&self, publisher: u32) -> Option<Packet<'_>> {
        self.queue.next_ready(publisher, &self.store)
    }

    /// Record that the application consumed `packet`; its payload is freed
    /// and it becomes eligible for acknowledgement.
    pub fn mark_dispatched(&mut self, packet: PacketRef) -> Result<()> {
        self.queue.mark_dispatched(packet, &mut self.store)?;
        self.stats.packets_dispatched += 1;
        Ok(())
    }

    /// Give up on `publisher`'s pids up to and including `up_to_pid`.
    ///
    /// Returns the number of held packets dropped.
    pub fn declare_lost(&mut self, publisher: u32, up_to_pid: u64) -> Result<usize> {
        let dropped = self.queue.declare_lost(publisher, up_to_pid, &mut self.store)?;
        self.stats.discarded += dropped as u64;
        Ok(dropped)
    }

    /// Highest contiguous pid dispatched for `publisher`.
    #[must_use]
    pub fn last_dispatched(&self, publisher: u32) -> Option<u64> {
        self.queue.last_dispatched(publisher)
    }

    // ========================================================================
    // Acknowledgement timing
    // ========================================================================

    /// How long the host may wait before calling
    /// [`process_timeouts`](Self::process_timeouts).
    ///
    /// Returns `Deadline::Infinite` when nothing is pending; after shutdown
    /// this means the context has fully drained.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Deadline {
        if !self.pending_reads.is_empty() {
            return Deadline::After(Duration::ZERO);
        }
        let deadline = self.acks.next_deadline(now);
        match self.lifecycle {
            Lifecycle::ShuttingDown { since } if !self.connections.is_empty() => {
                let linger_left = (since + SHUTDOWN_LINGER).saturating_duration_since(now);
                deadline
                    .min(Deadline::After(self.acks.ack_timeout()))
                    .min(Deadline::After(linger_left))
            }
            _ => deadline,
        }
    }

    /// Resume reads left over from an exhausted read budget, then emit
    /// acknowledgements for every publisher whose window elapsed.
    ///
    /// Returns the number of acknowledgement messages queued.
    pub fn process_timeouts(&mut self, now: Instant) -> Result<usize> {
        let resumed: Vec<ConnIndex> = self.pending_reads.drain().collect();
        for index in resumed {
            let live = match index {
                ConnIndex::Multicast => self.multicast_registered,
                ConnIndex::Unicast(slot) => self.connections.get(slot).is_some(),
            };
            if live {
                self.read_at(index, now)?;
            }
        }

        let due = self.acks.process_due(now, &mut self.store, &self.queue);
        let mut sent = 0;
        for ack in &due {
            if self.send_ack(ack.publisher, ack.pid)? {
                sent += 1;
            }
        }
        if self.is_shutting_down() {
            self.reap(now);
        }
        Ok(sent)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Decode and ingest one multicast datagram.
    ///
    /// Returns `None` for our own loopback traffic.
    fn ingest_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Option<usize> {
        let datagram = match Datagram::decode(bytes, self.context_id) {
            Ok(datagram) => datagram,
            Err(Error::SelfLoopback) => {
                self.stats.loopbacks += 1;
                log::trace!("[CTX] Skipping loopback datagram from {}", from);
                return None;
            }
            Err(e) => {
                self.stats.malformed += 1;
                log::debug!("[CTX] Dropping datagram from {}: {}", from, e);
                return Some(0);
            }
        };

        if self.is_shutting_down() {
            return Some(0);
        }

        let publisher = datagram.header.context_id;
        if let Err(e) = self.ensure_publisher(publisher, datagram.header.backchannel_addr(from)) {
            if let Error::ConnectionLimit(_) = e {
                self.stats.connection_limit_drops += 1;
            }
            log::warn!(
                "[CONN] Dropping traffic from publisher {:#010x}: {}",
                publisher,
                e
            );
            return Some(0);
        }

        let mut accepted = 0;
        for record in datagram.records() {
            match record {
                Ok(record) => {
                    if self.ingest_packet(publisher, record.pid, record.payload.to_vec(), now) {
                        accepted += 1;
                    }
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    log::debug!("[CTX] Truncated datagram from {}: {}", from, e);
                }
            }
        }
        Some(accepted)
    }

    /// Append stream bytes to the slot's buffer and ingest complete frames.
    ///
    /// Returns `None` when the stream was undecodable and got closed.
    fn ingest_stream(&mut self, slot: SlotId, bytes: &[u8], now: Instant) -> Option<usize> {
        let conn = self.connections.get_mut(slot)?;
        let publisher = conn.publisher;
        conn.recv_buffer.extend_from_slice(bytes);

        let frames = match drain_packet_frames(&mut conn.recv_buffer) {
            Ok(frames) => frames,
            Err(e) => {
                self.stats.malformed += 1;
                self.close_connection(slot, &e.to_string());
                return None;
            }
        };

        if self.is_shutting_down() {
            return Some(0);
        }

        let mut accepted = 0;
        for (pid, payload) in frames {
            if self.ingest_packet(publisher, pid, payload, now) {
                accepted += 1;
            }
        }
        Some(accepted)
    }

    fn ingest_packet(&mut self, publisher: u32, pid: u64, payload: Vec<u8>, now: Instant) -> bool {
        let admitted = self
            .queue
            .admit(publisher, pid)
            .and_then(|()| self.store.submit(publisher, pid, payload));
        match admitted {
            Ok(_) => {
                self.acks.record_receipt(publisher, now);
                self.stats.packets_received += 1;
                true
            }
            Err(e) => {
                self.stats.duplicates += 1;
                log::trace!("[CTX] {}", e);
                false
            }
        }
    }

    /// Make sure `publisher` has a backchannel, connecting on first contact.
    fn ensure_publisher(&mut self, publisher: u32, addr: SocketAddr) -> Result<()> {
        if self.publishers.contains_key(&publisher) {
            return Ok(());
        }

        let slot = self
            .connections
            .next_free()
            .ok_or(Error::ConnectionLimit(self.connections.capacity()))?;
        let descriptor = self.transport.connect(slot, addr)?;
        let slot = self
            .connections
            .insert(Connection::new(descriptor, addr, publisher))
            .ok_or(Error::ConnectionLimit(self.connections.capacity()))?;

        let interest = Interest::READABLE.add(Interest::WRITABLE);
        if matches!(self.lifecycle, Lifecycle::Active) {
            if let Err(e) = self.host.add(
                descriptor,
                ConnIndex::Unicast(slot),
                interest,
                self.config.user_tag,
            ) {
                self.connections.remove(slot);
                self.transport.close(ConnIndex::Unicast(slot));
                return Err(Error::Io(e));
            }
        }

        self.publishers.insert(publisher, slot);
        log::debug!(
            "[CONN] Discovered publisher {:#010x}, backchannel {} on slot {}",
            publisher,
            addr,
            slot.index()
        );
        Ok(())
    }

    /// Queue an acknowledgement and try to write it right away.
    ///
    /// Returns `false` when the publisher has no backchannel any more.
    fn send_ack(&mut self, publisher: u32, pid: u64) -> Result<bool> {
        let Some(&slot) = self.publishers.get(&publisher) else {
            log::debug!(
                "[ACK] No backchannel for publisher {:#010x}, dropping ack {}",
                publisher,
                pid
            );
            return Ok(false);
        };
        let Some(conn) = self.connections.get_mut(slot) else {
            return Ok(false);
        };

        let mut frame = Vec::with_capacity(crate::wire::ACK_LEN);
        AckMessage {
            context_id: self.context_id,
            pid,
        }
        .encode(&mut frame);
        conn.enqueue(&frame);
        self.stats.acks_sent += 1;
        log::trace!("[ACK] Publisher {:#010x} acked through pid {}", publisher, pid);

        self.flush(slot)?;
        Ok(true)
    }

    /// Write queued output until the transport pushes back, then bring the
    /// registered interest in line with what is left.
    fn flush(&mut self, slot: SlotId) -> Result<()> {
        let Some(conn) = self.connections.get_mut(slot) else {
            return Ok(());
        };

        if conn.state != ConnectionState::Connecting {
            let mut failure = None;
            while conn.has_pending_output() {
                match self.transport.write(slot, conn.pending_output()) {
                    Ok(0) => break,
                    Ok(n) => conn.consume_output(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                self.close_connection(slot, &format!("write error: {}", e));
                return Ok(());
            }
        }

        self.sync_interest(slot)
    }

    fn sync_interest(&mut self, slot: SlotId) -> Result<()> {
        let Some(conn) = self.connections.get_mut(slot) else {
            return Ok(());
        };
        let wanted = conn.wanted_interest();
        if wanted != conn.interest {
            if !matches!(self.lifecycle, Lifecycle::Created) {
                self.host.modify(
                    conn.descriptor,
                    ConnIndex::Unicast(slot),
                    wanted,
                    self.config.user_tag,
                )?;
            }
            conn.interest = wanted;
        }
        Ok(())
    }

    fn hangup(&mut self, index: ConnIndex) -> ReadOutcome {
        match index {
            ConnIndex::Unicast(slot) => self.close_connection(slot, "hangup"),
            ConnIndex::Multicast => {
                log::warn!("[CTX] Hangup on multicast descriptor");
                self.pending_reads.remove(&ConnIndex::Multicast);
                if self.multicast_registered {
                    let fd = self.transport.multicast_descriptor();
                    if let Err(e) =
                        self.host
                            .remove(fd, ConnIndex::Multicast, self.config.user_tag)
                    {
                        log::debug!("[CTX] Removing multicast descriptor failed: {}", e);
                    }
                    self.multicast_registered = false;
                }
                self.transport.close(ConnIndex::Multicast);
            }
        }
        ReadOutcome::Closed
    }

    /// Tear down a backchannel and everything pending for its publisher.
    ///
    /// The publisher's delivery cursor survives so a reconnect continues
    /// where delivery stopped.
    fn close_connection(&mut self, slot: SlotId, reason: &str) {
        let Some(conn) = self.connections.remove(slot) else {
            return;
        };
        if !matches!(self.lifecycle, Lifecycle::Created) {
            if let Err(e) =
                self.host
                    .remove(conn.descriptor, ConnIndex::Unicast(slot), self.config.user_tag)
            {
                log::debug!("[CONN] Removing slot {} from host failed: {}", slot.index(), e);
            }
        }
        self.transport.close(ConnIndex::Unicast(slot));
        self.pending_reads.remove(&ConnIndex::Unicast(slot));

        if self.publishers.get(&conn.publisher) == Some(&slot) {
            self.publishers.remove(&conn.publisher);
        }
        let dropped = self.store.discard_publisher(conn.publisher);
        self.acks.remove_publisher(conn.publisher);

        log::debug!(
            "[CONN] Closed backchannel to publisher {:#010x} at {} (slot {}): {} ({} pending packets dropped)",
            conn.publisher,
            conn.remote_addr,
            slot.index(),
            reason,
            dropped
        );
    }

    /// During shutdown, close backchannels that have nothing left to send.
    fn reap(&mut self, now: Instant) {
        let Lifecycle::ShuttingDown { since } = self.lifecycle else {
            return;
        };
        let lingered = now.saturating_duration_since(since) >= SHUTDOWN_LINGER;

        for slot in self.connections.ids() {
            let Some(conn) = self.connections.get(slot) else {
                continue;
            };
            let idle = !conn.has_pending_output() && self.acks.watermark(conn.publisher).is_none();
            if idle {
                self.close_connection(slot, "drained");
            } else if lingered {
                self.close_connection(slot, "shutdown linger expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::{Descriptor, UserTag};
    use crate::wire::encode_datagram;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::rc::Rc;

    #[derive(Default)]
    struct Shared {
        inbound: HashMap<ConnIndex, VecDeque<ReadResult>>,
        written: Vec<u8>,
        registered: Vec<ConnIndex>,
    }

    struct FakeHost(Rc<RefCell<Shared>>);

    impl ReadinessHost for FakeHost {
        fn add(&mut self, _: Descriptor, index: ConnIndex, _: Interest, _: UserTag) -> io::Result<()> {
            self.0.borrow_mut().registered.push(index);
            Ok(())
        }
        fn modify(&mut self, _: Descriptor, _: ConnIndex, _: Interest, _: UserTag) -> io::Result<()> {
            Ok(())
        }
        fn remove(&mut self, _: Descriptor, index: ConnIndex, _: UserTag) -> io::Result<()> {
            self.0.borrow_mut().registered.retain(|i| *i != index);
            Ok(())
        }
    }

    struct FakeTransport(Rc<RefCell<Shared>>);

    impl Transport for FakeTransport {
        fn multicast_descriptor(&self) -> Descriptor {
            3
        }
        fn read(&mut self, index: ConnIndex) -> io::Result<ReadResult> {
            Ok(self
                .0
                .borrow_mut()
                .inbound
                .get_mut(&index)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ReadResult::Empty))
        }
        fn write(&mut self, _: SlotId, bytes: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().written.extend_from_slice(bytes);
            Ok(bytes.len())
        }
        fn connect(&mut self, slot: SlotId, _: SocketAddr) -> io::Result<Descriptor> {
            Ok(100 + slot.index() as Descriptor)
        }
        fn close(&mut self, _: ConnIndex) {}
    }

    const PUBLISHER: u32 = 0x00C0_FFEE;

    fn context(shared: &Rc<RefCell<Shared>>) -> SubContext {
        let config = SubscriberConfig::builder()
            .context_id(1)
            .ack_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut ctx = SubContext::new(
            config,
            Box::new(FakeHost(shared.clone())),
            Box::new(FakeTransport(shared.clone())),
        )
        .unwrap();
        ctx.activate().unwrap();
        ctx
    }

    fn push_datagram(shared: &Rc<RefCell<Shared>>, sender: u32, packets: &[(u64, &[u8])]) {
        let bytes =
            encode_datagram(sender, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000), packets).unwrap();
        shared
            .borrow_mut()
            .inbound
            .entry(ConnIndex::Multicast)
            .or_default()
            .push_back(ReadResult::Data {
                bytes,
                from: "127.0.0.1:4723".parse().unwrap(),
                more_pending: true,
            });
    }

    #[test]
    fn test_ack_after_window() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);
        let t0 = Instant::now();

        push_datagram(&shared, PUBLISHER, &[(1, b"3:1:1")]);
        let outcome = ctx
            .handle_event_at(ConnIndex::Multicast, EventMask::READABLE, t0)
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Packets(1));
        assert_eq!(ctx.next_deadline(t0), Deadline::After(Duration::from_millis(100)));

        let handle = ctx.next_dispatch_ready().unwrap().handle();
        ctx.mark_dispatched(handle).unwrap();

        let slot = ctx.publisher_slot(PUBLISHER).unwrap();
        ctx.handle_event_at(ConnIndex::Unicast(slot), EventMask::WRITABLE, t0)
            .unwrap();

        let later = t0 + Duration::from_millis(150);
        assert_eq!(ctx.next_deadline(later), Deadline::After(Duration::ZERO));
        assert_eq!(ctx.process_timeouts(later).unwrap(), 1);
        assert_eq!(ctx.next_deadline(later), Deadline::Infinite);

        let ack = AckMessage::decode(&shared.borrow().written).unwrap();
        assert_eq!(ack, AckMessage { context_id: 1, pid: 1 });
    }

    #[test]
    fn test_loopback_is_skipped() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);

        push_datagram(&shared, 1, &[(1, b"0:1:1")]);
        let outcome = ctx.handle_event(ConnIndex::Multicast, EventMask::READABLE).unwrap();
        assert_eq!(outcome, ReadOutcome::Loopback);
        assert_eq!(ctx.stats().loopbacks, 1);
        assert_eq!(ctx.connection_count(), 0);
    }

    #[test]
    fn test_shutdown_drains_to_infinite() {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let mut ctx = context(&shared);
        let t0 = Instant::now();

        push_datagram(&shared, PUBLISHER, &[(1, b"a"), (2, b"b")]);
        ctx.handle_event_at(ConnIndex::Multicast, EventMask::READABLE, t0)
            .unwrap();
        let handle = ctx.next_dispatch_ready().unwrap().handle();
        ctx.mark_dispatched(handle).unwrap();

        ctx.shutdown_at(t0).unwrap();
        assert!(!shared.borrow().registered.contains(&ConnIndex::Multicast));
        assert_ne!(ctx.next_deadline(t0), Deadline::Infinite);
        assert!(ctx.next_dispatch_ready().is_none());

        let slot = ctx.publisher_slot(PUBLISHER).unwrap();
        ctx.handle_event_at(ConnIndex::Unicast(slot), EventMask::WRITABLE, t0)
            .unwrap();
        let later = t0 + Duration::from_millis(100);
        assert_eq!(ctx.process_timeouts(later).unwrap(), 1);

        assert!(ctx.is_drained());
        assert_eq!(ctx.next_deadline(later), Deadline::Infinite);
        assert!(shared.borrow().registered.is_empty());
        assert_eq!(ctx.stats().discarded, 1);
    }
}
