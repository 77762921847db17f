//! Neighbor (ARP) cache interface.
//!
//! The stack's side of address resolution: a per-device `(IPv4 -> MAC)`
//! table with insertion, lookup, and purge. The ARP exchange itself
//! belongs to the Ethernet driver; on a miss the driver queues the frame,
//! asks the wire, and calls [`neighbor_add`] when the reply lands.

extern crate alloc;

use alloc::vec::Vec;

use cinder_lib::{IrqMutex, clock, klog_debug};

use super::types::{DevIndex, Ipv4Addr, MacAddr};

/// Entries expire after this many ticks without refresh.
const NEIGHBOR_TTL_TICKS: u64 = 60 * 100;

/// Bounded table size; stale entries are evicted first.
const MAX_NEIGHBORS: usize = 64;

struct Neighbor {
    dev: DevIndex,
    ip: Ipv4Addr,
    mac: MacAddr,
    updated_at: u64,
}

static NEIGHBORS: IrqMutex<Vec<Neighbor>> = IrqMutex::new(Vec::new());

/// Insert or refresh an entry.
pub fn neighbor_add(dev: DevIndex, ip: Ipv4Addr, mac: MacAddr) {
    let now = clock::uptime_ticks();
    let mut table = NEIGHBORS.lock();
    if let Some(entry) = table.iter_mut().find(|n| n.dev == dev && n.ip == ip) {
        entry.mac = mac;
        entry.updated_at = now;
        return;
    }
    if table.len() >= MAX_NEIGHBORS {
        // Drop the stalest entry to make room.
        if let Some(oldest) = table
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| n.updated_at)
            .map(|(i, _)| i)
        {
            table.swap_remove(oldest);
        }
    }
    table.push(Neighbor {
        dev,
        ip,
        mac,
        updated_at: now,
    });
}

/// Resolve `ip` on `dev`; `None` means the driver owns the miss.
pub fn neighbor_lookup(dev: DevIndex, ip: Ipv4Addr) -> Option<MacAddr> {
    let now = clock::uptime_ticks();
    let table = NEIGHBORS.lock();
    table
        .iter()
        .find(|n| n.dev == dev && n.ip == ip && now.saturating_sub(n.updated_at) < NEIGHBOR_TTL_TICKS)
        .map(|n| n.mac)
}

/// Remove one entry.
pub fn neighbor_remove(dev: DevIndex, ip: Ipv4Addr) -> bool {
    let mut table = NEIGHBORS.lock();
    let before = table.len();
    table.retain(|n| !(n.dev == dev && n.ip == ip));
    table.len() != before
}

/// Drop everything learned on `dev` (interface teardown).
pub fn neighbor_purge(dev: DevIndex) {
    let mut table = NEIGHBORS.lock();
    let before = table.len();
    table.retain(|n| n.dev != dev);
    if before != table.len() {
        klog_debug!("net: purged {} neighbors on {}", before - table.len(), dev);
    }
}

/// Entry count (diagnostics and tests).
pub fn neighbor_count() -> usize {
    NEIGHBORS.lock().len()
}
