// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness multiplexing adapter.
//!
//! The engine owns no threads and no event loop. Instead the host hands in a
//! [`ReadinessHost`] capability at construction; the engine calls it to add,
//! modify and remove descriptors, and the host feeds notifications back
//! through [`SubContext::handle_event`](crate::SubContext::handle_event).
//!
//! ```text
//!   host event loop ──(ConnIndex, EventMask)──> SubContext::handle_event
//!         ▲                                            │
//!         └──── add / modify / remove (ReadinessHost) ─┘
//! ```
//!
//! The adapter never closes descriptors; the transport does so after
//! `remove`.

#[cfg(unix)]
mod mio_host;

#[cfg(unix)]
pub use mio_host::{EventLoop, MioHost};

use std::fmt;
use std::io;

use crate::conn::ConnIndex;

/// OS-level descriptor (a `RawFd` on unix).
pub type Descriptor = i32;

/// Opaque value supplied at context creation and passed to every callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserTag(pub u64);

/// Set of readiness kinds a descriptor is registered for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    const READ_BIT: u8 = 0b01;
    const WRITE_BIT: u8 = 0b10;

    /// Interested in readable notifications.
    pub const READABLE: Interest = Interest(Self::READ_BIT);
    /// Interested in writable notifications.
    pub const WRITABLE: Interest = Interest(Self::WRITE_BIT);

    /// Union of two interest sets.
    #[must_use]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ_BIT != 0
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE_BIT != 0
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "READABLE | WRITABLE"),
            (true, false) => write!(f, "READABLE"),
            (false, true) => write!(f, "WRITABLE"),
            (false, false) => write!(f, "(none)"),
        }
    }
}

/// Readiness notification delivered by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl EventMask {
    pub const READABLE: EventMask = EventMask {
        readable: true,
        writable: false,
        hangup: false,
    };
    pub const WRITABLE: EventMask = EventMask {
        readable: false,
        writable: true,
        hangup: false,
    };
    pub const HANGUP: EventMask = EventMask {
        readable: false,
        writable: false,
        hangup: true,
    };

    /// Union of two masks.
    #[must_use]
    pub const fn with(self, other: EventMask) -> EventMask {
        EventMask {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
            hangup: self.hangup || other.hangup,
        }
    }
}

/// Host-side capability for registering descriptors with an external
/// readiness multiplexer.
///
/// Implementations must deliver notifications for a registered descriptor
/// tagged with the `index` it was registered under.
pub trait ReadinessHost {
    /// Start watching `descriptor`.
    fn add(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()>;

    /// Change the interest set of an already watched descriptor.
    fn modify(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()>;

    /// Stop watching `descriptor`.
    fn remove(&mut self, descriptor: Descriptor, index: ConnIndex, tag: UserTag)
        -> io::Result<()>;
}

impl<H: ReadinessHost + ?Sized> ReadinessHost for Box<H> {
    fn add(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()> {
        (**self).add(descriptor, index, interest, tag)
    }

    fn modify(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        interest: Interest,
        tag: UserTag,
    ) -> io::Result<()> {
        (**self).modify(descriptor, index, interest, tag)
    }

    fn remove(
        &mut self,
        descriptor: Descriptor,
        index: ConnIndex,
        tag: UserTag,
    ) -> io::Result<()> {
        (**self).remove(descriptor, index, tag)
    }
}
