// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acknowledgement scheduler.
//!
//! Keeps one "oldest unacknowledged receipt" watermark per publisher and turns
//! it into the next wake-up deadline for the host loop. When a publisher's
//! window elapses, all packets dispatched for it since the previous
//! acknowledgement are covered by a single message carrying the highest
//! contiguous pid.
//!
//! ```text
//! t=0   receipt pid 1  -> watermark = 0
//! t=10  receipt pid 2  -> watermark stays 0
//! t=50  deadline       -> one ack(pid 2), watermark cleared
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::dispatch::DispatchQueue;
use super::packet_store::PacketStore;

/// Time until the engine next needs to run, as handed to the host wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Nothing pending; wait for I/O only.
    Infinite,
    /// Call back no later than this.
    After(Duration),
}

impl Deadline {
    /// Convert to the `Option<Duration>` form used by poll APIs.
    #[must_use]
    pub fn as_timeout(self) -> Option<Duration> {
        match self {
            Deadline::Infinite => None,
            Deadline::After(d) => Some(d),
        }
    }

    #[must_use]
    pub fn is_infinite(self) -> bool {
        matches!(self, Deadline::Infinite)
    }

    /// The earlier of two deadlines.
    #[must_use]
    pub fn min(self, other: Deadline) -> Deadline {
        match (self, other) {
            (Deadline::Infinite, d) | (d, Deadline::Infinite) => d,
            (Deadline::After(a), Deadline::After(b)) => Deadline::After(a.min(b)),
        }
    }
}

/// Acknowledgement ready to be written to a publisher's backchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueAck {
    pub publisher: u32,
    /// Highest contiguous pid acknowledged.
    pub pid: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PublisherAcks {
    /// Receipt time of the oldest packet not yet covered by an ack.
    watermark: Option<Instant>,
    /// Highest pid already acknowledged.
    acked_through: u64,
}

/// Coalescing acknowledgement timer, one watermark per publisher.
#[derive(Debug)]
pub struct AckScheduler {
    ack_timeout: Duration,
    publishers: BTreeMap<u32, PublisherAcks>,
}

impl AckScheduler {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            publishers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Note a packet receipt; only the first receipt of a window sets the
    /// watermark.
    pub fn record_receipt(&mut self, publisher: u32, now: Instant) {
        let acks = self.publishers.entry(publisher).or_default();
        if acks.watermark.is_none() {
            acks.watermark = Some(now);
        }
    }

    #[must_use]
    pub fn watermark(&self, publisher: u32) -> Option<Instant> {
        self.publishers.get(&publisher).and_then(|a| a.watermark)
    }

    /// True when any publisher has an unacknowledged receipt.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.publishers.values().any(|a| a.watermark.is_some())
    }

    /// Time left until the earliest watermark expires, clamped at zero.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Deadline {
        self.publishers
            .values()
            .filter_map(|a| a.watermark)
            .min()
            .map_or(Deadline::Infinite, |oldest| {
                Deadline::After((oldest + self.ack_timeout).saturating_duration_since(now))
            })
    }

    /// Acknowledge every publisher whose window has elapsed at `now`.
    ///
    /// Each due publisher yields at most one [`DueAck`], covering every packet
    /// dispatched since its last acknowledgement; those records are released
    /// from `store`. The watermark is cleared, or restarted at `now` when
    /// packets still wait for the application. Publishers not yet due are
    /// left untouched.
    pub fn process_due(
        &mut self,
        now: Instant,
        store: &mut PacketStore,
        queue: &DispatchQueue,
    ) -> Vec<DueAck> {
        let mut due = Vec::new();

        for (&publisher, acks) in self.publishers.iter_mut() {
            let Some(watermark) = acks.watermark else {
                continue;
            };
            if watermark + self.ack_timeout > now {
                continue;
            }

            let highest = queue.last_dispatched(publisher).unwrap_or(0);
            if highest > acks.acked_through {
                let released = store.acknowledge_through(publisher, highest);
                log::trace!(
                    "[ACK] Publisher {:#010x}: ack pid {} covers {} packets",
                    publisher,
                    highest,
                    released
                );
                acks.acked_through = highest;
                due.push(DueAck {
                    publisher,
                    pid: highest,
                });
            }

            acks.watermark = if store.has_undispatched(publisher) {
                Some(now)
            } else {
                None
            };
        }

        due
    }

    /// Forget a publisher, dropping any pending acknowledgement.
    pub fn remove_publisher(&mut self, publisher: u32) {
        self.publishers.remove(&publisher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::PacketRef;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn deliver(store: &mut PacketStore, queue: &mut DispatchQueue, publisher: u32, pid: u64) {
        queue.admit(publisher, pid).unwrap();
        store.submit(publisher, pid, vec![0; 4]).unwrap();
        queue
            .mark_dispatched(PacketRef::new(publisher, pid), store)
            .unwrap();
    }

    #[test]
    fn test_deadline_min() {
        let short = Deadline::After(Duration::from_millis(5));
        assert_eq!(Deadline::Infinite.min(short), short);
        assert_eq!(short.min(Deadline::After(Duration::from_secs(1))), short);
        assert_eq!(Deadline::Infinite.as_timeout(), None);
    }

    #[test]
    fn test_first_receipt_sets_full_window() {
        let t0 = Instant::now();
        let mut scheduler = AckScheduler::new(TIMEOUT);
        assert_eq!(scheduler.next_deadline(t0), Deadline::Infinite);

        scheduler.record_receipt(1, t0);
        assert_eq!(scheduler.next_deadline(t0), Deadline::After(TIMEOUT));

        // Later receipts keep the oldest watermark.
        scheduler.record_receipt(1, t0 + Duration::from_millis(30));
        assert_eq!(scheduler.watermark(1), Some(t0));
        assert_eq!(
            scheduler.next_deadline(t0 + Duration::from_millis(30)),
            Deadline::After(Duration::from_millis(70))
        );
    }

    #[test]
    fn test_deadline_never_negative() {
        let t0 = Instant::now();
        let mut scheduler = AckScheduler::new(TIMEOUT);
        scheduler.record_receipt(1, t0);
        assert_eq!(
            scheduler.next_deadline(t0 + Duration::from_secs(5)),
            Deadline::After(Duration::ZERO)
        );
    }

    #[test]
    fn test_process_due_before_deadline_is_noop() {
        let t0 = Instant::now();
        let mut store = PacketStore::new();
        let mut queue = DispatchQueue::new(false);
        let mut scheduler = AckScheduler::new(TIMEOUT);

        deliver(&mut store, &mut queue, 1, 1);
        scheduler.record_receipt(1, t0);

        let acks = scheduler.process_due(t0 + Duration::from_millis(99), &mut store, &queue);
        assert!(acks.is_empty());
        assert_eq!(scheduler.watermark(1), Some(t0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_many_packets_one_ack() {
        let t0 = Instant::now();
        let mut store = PacketStore::new();
        let mut queue = DispatchQueue::new(false);
        let mut scheduler = AckScheduler::new(TIMEOUT);

        for pid in 1..=10 {
            deliver(&mut store, &mut queue, 3, pid);
            scheduler.record_receipt(3, t0 + Duration::from_millis(pid - 1));
        }

        let acks = scheduler.process_due(t0 + TIMEOUT, &mut store, &queue);
        assert_eq!(acks, vec![DueAck { publisher: 3, pid: 10 }]);
        assert!(store.is_empty());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_undispatched_packets_rearm_watermark() {
        let t0 = Instant::now();
        let mut store = PacketStore::new();
        let mut queue = DispatchQueue::new(false);
        let mut scheduler = AckScheduler::new(TIMEOUT);

        deliver(&mut store, &mut queue, 5, 1);
        queue.admit(5, 2).unwrap();
        store.submit(5, 2, vec![1]).unwrap();
        scheduler.record_receipt(5, t0);

        let later = t0 + Duration::from_millis(120);
        let acks = scheduler.process_due(later, &mut store, &queue);
        assert_eq!(acks, vec![DueAck { publisher: 5, pid: 1 }]);
        assert_eq!(scheduler.watermark(5), Some(later));

        // Nothing new dispatched: the next window elapses without an ack.
        let acks = scheduler.process_due(later + TIMEOUT, &mut store, &queue);
        assert!(acks.is_empty());
    }
}
