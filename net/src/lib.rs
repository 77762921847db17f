//! CinderOS IPv4 networking core.
//!
//! Link-layer neutral packet buffers, the routing table and neighbor
//! cache, IPv4 send with fragmentation and receive with reassembly, ICMP,
//! UDP, TCP, and the socket layer that multiplexes all of it onto file
//! descriptors.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod icmp;
pub mod ipv4;
pub mod neighbor;
pub mod netdev;
pub mod netmsg;
pub mod route;
pub mod socket;
pub mod tcp;
pub mod types;
pub mod udp;

pub mod tests_ipv4;
pub mod tests_route;
pub mod tests_socket;
pub mod tests_tcp;

pub use types::{NetError, NetResult};

/// Bring the stack up: loopback device and route, socket syscalls, the
/// tick hook for reassembly and TCP timers.
pub fn net_init() {
    netdev::register_loopback();
    socket::socket_init();
    cinder_core::syscall::register_net_tick(on_tick);
    cinder_lib::klog_info!("net: stack ready");
}

/// Per-tick maintenance.
fn on_tick() {
    let now = cinder_lib::clock::uptime_ticks();
    ipv4::reassembly_expire(now);
    tcp::on_tick(now);
}
