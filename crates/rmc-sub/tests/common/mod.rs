// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fakes for integration tests: a readiness host that records every
//! call and a transport fed from scripted reads.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rmc_sub::config::SubscriberConfigBuilder;
use rmc_sub::wire::{encode_datagram, encode_packet_frame, AckMessage, ACK_LEN};
use rmc_sub::{
    ConnIndex, Descriptor, EventMask, Interest, ReadOutcome, ReadResult, ReadinessHost, SlotId,
    SubContext, Transport, UserTag,
};

pub const MULTICAST_FD: Descriptor = 3;
pub const SUBSCRIBER_ID: u32 = 0x5EB5_C001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Add(ConnIndex, Interest),
    Modify(ConnIndex, Interest),
    Remove(ConnIndex),
}

#[derive(Debug, Default)]
pub struct HostLog {
    pub calls: Vec<HostCall>,
    pub registered: HashMap<ConnIndex, Interest>,
    pub tags: Vec<UserTag>,
}

pub struct RecordingHost(pub Rc<RefCell<HostLog>>);

impl ReadinessHost for RecordingHost {
    fn add(
        &mut self,
        _descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()> {
        let mut log = self.0.borrow_mut();
        log.calls.push(HostCall::Add(index, interest));
        log.registered.insert(index, interest);
        log.tags.push(tag);
        Ok(())
    }

    fn modify(
        &mut self,
        _descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()> {
        let mut log = self.0.borrow_mut();
        log.calls.push(HostCall::Modify(index, interest));
        log.registered.insert(index, interest);
        log.tags.push(tag);
        Ok(())
    }

    fn remove(&mut self, _descriptor: Descriptor, index: ConnIndex, tag: UserTag) -> io::Result<()> {
        let mut log = self.0.borrow_mut();
        log.calls.push(HostCall::Remove(index));
        log.registered.remove(&index);
        log.tags.push(tag);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Wire {
    pub inbound: HashMap<ConnIndex, VecDeque<ReadResult>>,
    pub written: HashMap<SlotId, Vec<u8>>,
    /// Bytes the transport accepts before reporting `WouldBlock`; `None` is
    /// unlimited.
    pub write_budget: Option<usize>,
    pub connects: Vec<(SlotId, SocketAddr)>,
    pub closed: Vec<ConnIndex>,
}

pub struct ScriptedTransport(pub Rc<RefCell<Wire>>);

impl Transport for ScriptedTransport {
    fn multicast_descriptor(&self) -> Descriptor {
        MULTICAST_FD
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

    fn write(&mut self, slot: SlotId, bytes: &[u8]) -> io::Result<usize> {
        let mut wire = self.0.borrow_mut();
        let n = match wire.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(bytes.len());
                wire.write_budget = Some(budget - n);
                n
            }
            None => bytes.len(),
        };
        wire.written.entry(slot).or_default().extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn connect(&mut self, slot: SlotId, addr: SocketAddr) -> io::Result<Descriptor> {
        self.0.borrow_mut().connects.push((slot, addr));
        Ok(100 + slot.index() as Descriptor)
    }

    fn close(&mut self, index: ConnIndex) {
        self.0.borrow_mut().closed.push(index);
    }
}

/// Backchannel address announced by publisher `id`.
pub fn backchannel(id: u32) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, (id % 250) as u8 + 1), 5000)
}

/// A context wired to recording fakes, with a fixed time origin.
pub struct Bench {
    pub ctx: SubContext,
    pub host: Rc<RefCell<HostLog>>,
    pub wire: Rc<RefCell<Wire>>,
    pub t0: Instant,
}

impl Bench {
    pub fn new(builder: SubscriberConfigBuilder) -> Self {
        let config = builder
            .context_id(SUBSCRIBER_ID)
            .user_tag(UserTag(0xAB))
            .build()
            .expect("config");
        let host = Rc::new(RefCell::new(HostLog::default()));
        let wire = Rc::new(RefCell::new(Wire::default()));
        let mut ctx = SubContext::new(
            config,
            Box::new(RecordingHost(host.clone())),
            Box::new(ScriptedTransport(wire.clone())),
        )
        .expect("context");
        ctx.activate().expect("activate");
        Self {
            ctx,
            host,
            wire,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Queue one multicast datagram from `publisher`.
    pub fn multicast(&self, publisher: u32, packets: &[(u64, Vec<u8>)]) {
        let refs: Vec<(u64, &[u8])> = packets.iter().map(|(pid, p)| (*pid, p.as_slice())).collect();
        let bytes = encode_datagram(publisher, backchannel(publisher), &refs).expect("datagram");
        let from = SocketAddr::V4(SocketAddrV4::new(*backchannel(publisher).ip(), 4723));
        self.push(ConnIndex::Multicast, ReadResult::Data {
            bytes,
            from,
            more_pending: true,
        });
    }

    /// Queue retransmitted packets on a backchannel.
    pub fn stream(&self, slot: SlotId, packets: &[(u64, Vec<u8>)]) {
        let mut bytes = Vec::new();
        for (pid, payload) in packets {
            encode_packet_frame(*pid, payload, &mut bytes).expect("frame");
        }
        self.stream_bytes(slot, bytes);
    }

    pub fn stream_bytes(&self, slot: SlotId, bytes: Vec<u8>) {
        let from = SocketAddr::V4(backchannel(0));
        self.push(ConnIndex::Unicast(slot), ReadResult::Data {
            bytes,
            from,
            more_pending: false,
        });
    }

    pub fn push(&self, index: ConnIndex, result: ReadResult) {
        self.wire
            .borrow_mut()
            .inbound
            .entry(index)
            .or_default()
            .push_back(result);
    }

    pub fn readable(&mut self, index: ConnIndex, ms: u64) -> ReadOutcome {
        let now = self.at(ms);
        self.ctx
            .handle_event_at(index, EventMask::READABLE, now)
            .expect("readable")
    }

    pub fn writable(&mut self, index: ConnIndex, ms: u64) -> ReadOutcome {
        let now = self.at(ms);
        self.ctx
            .handle_event_at(index, EventMask::WRITABLE, now)
            .expect("writable")
    }

    pub fn slot_of(&self, publisher: u32) -> SlotId {
        self.ctx.publisher_slot(publisher).expect("publisher connected")
    }

    /// Drain every dispatch-ready packet as `(publisher, pid, payload)`.
    pub fn drain_dispatch(&mut self) -> Vec<(u32, u64, Vec<u8>)> {
        let mut delivered = Vec::new();
        while let Some(packet) = self.ctx.next_dispatch_ready() {
            delivered.push((packet.publisher, packet.pid, packet.payload.to_vec()));
            let handle = packet.handle();
            self.ctx.mark_dispatched(handle).expect("dispatch");
        }
        delivered
    }

    /// Acknowledgements written to `slot` so far.
    pub fn acks(&self, slot: SlotId) -> Vec<AckMessage> {
        self.wire
            .borrow()
            .written
            .get(&slot)
            .map(|bytes| {
                bytes
                    .chunks(ACK_LEN)
                    .map(|chunk| AckMessage::decode(chunk).expect("ack frame"))
                    .collect()
            })
            .unwrap_or_default()
    }
}
