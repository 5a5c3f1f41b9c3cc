// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket layer boundary.
//!
//! The engine never opens or closes sockets itself. A [`Transport`] owns the
//! multicast receive socket and one stream per unicast slot; the engine asks
//! it to read, write, connect and close by connection index.

#[cfg(unix)]
mod net;

#[cfg(unix)]
pub use net::NetTransport;

use std::io;
use std::net::SocketAddr;

use crate::conn::{ConnIndex, SlotId};
use crate::readiness::Descriptor;

/// Outcome of one read attempt on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Bytes received.
    Data {
        bytes: Vec<u8>,
        /// Datagram source, or the stream's remote address.
        from: SocketAddr,
        /// More input may be waiting on the same descriptor.
        more_pending: bool,
    },
    /// A listening descriptor accepted a connection; not data.
    Accepted,
    /// Nothing to read right now.
    Empty,
    /// Peer closed the stream.
    Closed,
}

/// Socket layer used by the subscriber context.
pub trait Transport {
    /// Descriptor of the multicast receive socket.
    fn multicast_descriptor(&self) -> Descriptor;

    /// Read once from `index` without blocking.
    fn read(&mut self, index: ConnIndex) -> io::Result<ReadResult>;

    /// Write as much of `bytes` as the socket accepts without blocking.
    ///
    /// `WouldBlock` and `Ok(0)` both mean "try again when writable".
    fn write(&mut self, slot: SlotId, bytes: &[u8]) -> io::Result<usize>;

    /// Start a non-blocking connect for `slot` and return its descriptor.
    fn connect(&mut self, slot: SlotId, addr: SocketAddr) -> io::Result<Descriptor>;

    /// Close the socket behind `index`. Unknown indices are ignored.
    fn close(&mut self, index: ConnIndex);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn multicast_descriptor(&self) -> Descriptor {
        (**self).multicast_descriptor()
    }

    fn read(&mut self, index: ConnIndex) -> io::Result<ReadResult> {
        (**self).read(index)
    }

    fn write(&mut self, slot: SlotId, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(slot, bytes)
    }

    fn connect(&mut self, slot: SlotId, addr: SocketAddr) -> io::Result<Descriptor> {
        (**self).connect(slot, addr)
    }

    fn close(&mut self, index: ConnIndex) {
        (**self).close(index);
    }
}
