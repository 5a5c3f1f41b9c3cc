// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rmc-sub - Reliable Multicast Subscriber Engine
//!
//! Subscriber side of a reliable-multicast transport. Publishers distribute
//! packets over an unreliable multicast group; the subscriber orders them per
//! publisher, hands contiguous runs to the application and acknowledges them
//! in coalesced batches over a unicast backchannel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rmc_sub::{EventLoop, NetTransport, SubContext, SubscriberConfig};
//! use std::time::Instant;
//!
//! fn main() -> rmc_sub::Result<()> {
//!     let config = SubscriberConfig::builder().env_overrides().build()?;
//!     let mut event_loop = EventLoop::new()?;
//!     let transport = NetTransport::new(&config)?;
//!
//!     let mut ctx = SubContext::new(config, Box::new(event_loop.host()?), Box::new(transport))?;
//!     ctx.activate()?;
//!
//!     loop {
//!         match event_loop.wait(ctx.next_deadline(Instant::now())) {
//!             Ok(events) => {
//!                 for (index, mask) in events {
//!                     ctx.handle_event(index, mask)?;
//!                 }
//!             }
//!             Err(e) if e.is_control_flow() => {}
//!             Err(e) => return Err(e),
//!         }
//!         ctx.process_timeouts(Instant::now())?;
//!
//!         while let Some(packet) = ctx.next_dispatch_ready() {
//!             println!("{}:{} {} bytes", packet.publisher, packet.pid, packet.payload.len());
//!             let handle = packet.handle();
//!             ctx.mark_dispatched(handle)?;
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                      Host event loop (caller)                      |
//! |      EventLoop / any ReadinessHost  <->  SubContext::handle_event  |
//! +--------------------------------------------------------------------+
//! |                             SubContext                             |
//! |  ConnectionTable | PacketStore | DispatchQueue | AckScheduler      |
//! +--------------------------------------------------------------------+
//! |                          Transport + wire                          |
//! |   UDP multicast datagrams  |  TCP backchannel (frames, acks)       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`context`] - The engine (start here)
//! - [`reliability`] - Packet store, dispatch ordering, ack scheduling
//! - [`verify`] - Sequence integrity verifier for conformance payloads
//! - [`readiness`] - Host readiness capability and the mio implementation
//! - [`transport`] - Socket layer boundary and the network implementation
//! - [`wire`] - Datagram, stream frame and acknowledgement codec

/// Subscriber configuration and protocol constants.
pub mod config;
/// Connection index and generation-tagged slot table.
pub mod conn;
/// Subscriber context (aggregate root).
pub mod context;
/// Error types.
pub mod error;
/// Readiness multiplexing adapter.
pub mod readiness;
/// Ordered, acknowledged delivery pipeline.
pub mod reliability;
/// Socket layer.
pub mod transport;
/// Sequence integrity verifier.
pub mod verify;
/// Wire codec.
pub mod wire;

pub use config::SubscriberConfig;
pub use conn::{ConnIndex, ConnectionState, SlotId};
pub use context::{ReadOutcome, SubContext, SubscriberStats};
pub use error::{Error, Result, Violation};
pub use readiness::{Descriptor, EventMask, Interest, ReadinessHost, UserTag};
pub use reliability::{Deadline, Packet, PacketRef};
pub use transport::{ReadResult, Transport};
pub use verify::{Expectation, PayloadTriplet, Progress, SequenceVerifier};

#[cfg(unix)]
pub use readiness::{EventLoop, MioHost};
#[cfg(unix)]
pub use transport::NetTransport;
