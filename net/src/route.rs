//! IPv4 routing table.
//!
//! Longest-prefix match over `(dest, netmask, gateway, device, flags)`
//! records; among equally long prefixes the earliest-added route wins. A
//! route without `GW` is on-link: its next hop is the destination itself.

extern crate alloc;

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use cinder_lib::{IrqMutex, klog_debug};

use super::netdev;
use super::types::{DevIndex, Ipv4Addr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RouteFlags: u32 {
        /// Route is usable.
        const UP = 1 << 0;
        /// Traffic goes through the gateway instead of directly.
        const GW = 1 << 1;
    }
}

#[derive(Clone, Copy)]
pub struct RouteEntry {
    pub dest: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dev: DevIndex,
    pub flags: RouteFlags,
}

impl RouteEntry {
    #[inline]
    fn matches(&self, dst: Ipv4Addr) -> bool {
        self.flags.contains(RouteFlags::UP) && dst.same_subnet(self.dest, self.netmask)
    }

    /// Next hop for `dst`: the gateway when GW is set, the destination
    /// itself when the route is on-link.
    #[inline]
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.flags.contains(RouteFlags::GW) {
            self.gateway
        } else {
            dst
        }
    }

    #[inline]
    fn prefix_len(&self) -> u32 {
        self.netmask.to_u32_be().count_ones()
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.contains(RouteFlags::GW) {
            write!(
                f,
                "{}/{} via {} dev {}",
                self.dest,
                self.prefix_len(),
                self.gateway,
                self.dev
            )
        } else {
            write!(f, "{}/{} dev {}", self.dest, self.prefix_len(), self.dev)
        }
    }
}

static ROUTES: IrqMutex<Vec<RouteEntry>> = IrqMutex::new(Vec::new());

/// Append a route. Insertion order is the tie-breaker between equal
/// prefix lengths, so earlier routes shadow later identical ones.
pub fn add_route(entry: RouteEntry) {
    klog_debug!("route: add {:?}", entry);
    ROUTES.lock().push(entry);
}

/// Remove the first route matching `(dest, netmask)`.
pub fn del_route(dest: Ipv4Addr, netmask: Ipv4Addr) -> bool {
    let mut routes = ROUTES.lock();
    match routes
        .iter()
        .position(|r| r.dest == dest && r.netmask == netmask)
    {
        Some(index) => {
            let removed = routes.remove(index);
            klog_debug!("route: del {:?}", removed);
            true
        }
        None => false,
    }
}

/// Longest-prefix lookup for `dst`, optionally constrained by a source
/// address (the chosen interface must own `src`). Returns the egress
/// device and next hop.
pub fn get_route(src: Option<Ipv4Addr>, dst: Ipv4Addr) -> Option<(DevIndex, Ipv4Addr)> {
    let routes = ROUTES.lock();
    let mut best: Option<&RouteEntry> = None;
    for route in routes.iter() {
        if !route.matches(dst) {
            continue;
        }
        if let Some(src) = src {
            if !src.is_unspecified() {
                let owns = netdev::device(route.dev)
                    .map(|d| d.ipv4_addr() == src)
                    .unwrap_or(false);
                if !owns {
                    continue;
                }
            }
        }
        // Strictly longer prefixes win; ties keep the earlier entry.
        if best.map_or(true, |b| route.prefix_len() > b.prefix_len()) {
            best = Some(route);
        }
    }
    best.map(|r| (r.dev, r.next_hop(dst)))
}

/// Remove every route using `dev` (interface teardown); the neighbor
/// cache entries for it go too.
pub fn purge(dev: DevIndex) {
    let mut routes = ROUTES.lock();
    let before = routes.len();
    routes.retain(|r| r.dev != dev);
    let dropped = before - routes.len();
    drop(routes);
    super::neighbor::neighbor_purge(dev);
    if dropped > 0 {
        klog_debug!("route: purged {} routes for {}", dropped, dev);
    }
}

/// Number of routes (diagnostics and tests).
pub fn route_count() -> usize {
    ROUTES.lock().len()
}

/// Drop every route (test isolation).
pub fn clear_for_tests() {
    ROUTES.lock().clear();
}
