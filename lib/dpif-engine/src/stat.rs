// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Live counters updated by the packet path.
//!
//! Port counters are independent atomics. The counters of a flow are
//! updated together: a hit and a clearing read exclude each other, so
//! every hit lands whole either in the value returned or in the live
//! counters afterwards.

use dpif_api::FlowStats;
use dpif_api::TcpFlags;
use dpif_api::VportStats;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Counters of one vport.
#[derive(Debug, Default)]
pub struct PortCounters {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_drop: AtomicU64,
    pub tx_drop: AtomicU64,
    pub rx_error: AtomicU64,
    pub tx_error: AtomicU64,
}

impl PortCounters {
    #[inline]
    pub fn hit_rx(&self, pkt_size: u64) {
        self.rx.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(pkt_size, Ordering::Relaxed);
    }

    #[inline]
    pub fn hit_tx(&self, pkt_size: u64) {
        self.tx.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(pkt_size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VportStats {
        VportStats {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_drop: self.rx_drop.load(Ordering::Relaxed),
            tx_drop: self.tx_drop.load(Ordering::Relaxed),
            rx_error: self.rx_error.load(Ordering::Relaxed),
            tx_error: self.tx_error.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one flow.
#[derive(Debug, Default)]
pub struct FlowCounters {
    inner: Mutex<FlowStats>,
}

impl FlowCounters {
    fn lock(&self) -> MutexGuard<'_, FlowStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a packet matching this flow, `now` being milliseconds
    /// since datapath start.
    #[inline]
    pub fn hit(&self, pkt_size: u64, tcp_flags: TcpFlags, now: u64) {
        let mut st = self.lock();
        st.packet_count += 1;
        st.byte_count += pkt_size;
        st.used = st.used.max(now);
        st.tcp_flags |= tcp_flags;
    }

    pub fn snapshot(&self) -> FlowStats {
        *self.lock()
    }

    /// Read the counters and reset them in the same step.
    pub fn take(&self) -> FlowStats {
        core::mem::take(&mut *self.lock())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn flow_hit_accumulates() {
        let c = FlowCounters::default();
        c.hit(100, TcpFlags::SYN, 5);
        c.hit(60, TcpFlags::ACK, 3);
        let s = c.snapshot();
        assert_eq!(s.packet_count, 2);
        assert_eq!(s.byte_count, 160);
        assert_eq!(s.used, 5);
        assert_eq!(s.tcp_flags, TcpFlags::SYN | TcpFlags::ACK);
    }

    #[test]
    fn take_resets() {
        let c = FlowCounters::default();
        c.hit(10, TcpFlags::FIN, 1);
        assert_eq!(c.take().packet_count, 1);
        assert_eq!(c.snapshot(), FlowStats::default());
    }

    // N increments racing one clearing read: the clear sees some c of
    // them and the live counter holds the rest.
    #[test]
    fn clear_read_loses_nothing() {
        const N: u64 = 100_000;
        const WRITERS: u64 = 4;

        let c = FlowCounters::default();
        let start = Barrier::new(WRITERS as usize + 1);

        let taken = thread::scope(|s| {
            for _ in 0..WRITERS {
                s.spawn(|| {
                    start.wait();
                    for _ in 0..N / WRITERS {
                        c.hit(1, TcpFlags::empty(), 1);
                    }
                });
            }

            start.wait();
            thread::yield_now();
            c.take()
        });

        let rest = c.snapshot();
        assert!(taken.packet_count <= N);
        assert_eq!(taken.packet_count + rest.packet_count, N);
        assert_eq!(taken.byte_count + rest.byte_count, N);
    }

    // Each hit's packet, bytes and timestamp fall on the same side of
    // a clearing read.
    #[test]
    fn clear_read_never_splits_a_hit() {
        const LEN: u64 = 100;

        for _ in 0..200 {
            let c = FlowCounters::default();
            let start = Barrier::new(2);

            let taken = thread::scope(|s| {
                s.spawn(|| {
                    start.wait();
                    for _ in 0..5_000 {
                        c.hit(LEN, TcpFlags::empty(), 1);
                    }
                });

                start.wait();
                thread::yield_now();
                c.take()
            });

            let rest = c.snapshot();
            for st in [taken, rest] {
                assert_eq!(st.byte_count, st.packet_count * LEN);
                assert_eq!(st.used, u64::from(st.packet_count > 0));
            }
            assert_eq!(taken.packet_count + rest.packet_count, 5_000);
        }
    }
}
