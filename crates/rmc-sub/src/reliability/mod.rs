// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Ordered, acknowledged delivery
//!
//! Subscriber-side reliability pipeline.
//!
//! ```text
//! read handler ──submit──> PacketStore <──next_ready── DispatchQueue ──> application
//!       │                       ▲                            │
//!       │ record_receipt        │ acknowledge_through        │ mark_dispatched
//!       ▼                       │                            ▼
//!  AckScheduler ──process_due───┴──────> DueAck ──> backchannel write
//! ```
//!
//! | Component | Role |
//! |-----------|------|
//! | `PacketStore` | Owns packets from arrival until their acknowledgement is sent |
//! | `DispatchQueue` | Per-publisher cursor; exposes only the contiguous-next packet |
//! | `AckScheduler` | Oldest-unacked watermark per publisher, coalesced acks |

mod ack_scheduler;
mod dispatch;
mod packet_store;

// ============================================================================
// Public re-exports
// ============================================================================

pub use ack_scheduler::{AckScheduler, Deadline, DueAck};
pub use dispatch::DispatchQueue;
pub use packet_store::{AckState, Packet, PacketRef, PacketStore};
