//! Network device contract and registry.
//!
//! A NIC driver implements [`NetDevice`] and registers itself; the stack
//! addresses it by [`DevIndex`]. Received frames come back up through
//! [`crate::ipv4::ip_rx_msg`] after the driver has stripped the link
//! header. The loopback device is registered at init and short-circuits
//! transmit into receive.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_lib::{IrqMutex, klog_debug};

use super::netmsg::NetMsg;
use super::route::{self, RouteEntry, RouteFlags};
use super::types::{DevIndex, Ipv4Addr, MacAddr, NetError, NetResult};

/// Link hardware types (mirrors the ARP hardware-type space).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwType {
    Ethernet,
    Loopback,
}

/// The contract a NIC driver fulfills.
pub trait NetDevice: Send + Sync {
    /// Transmit one message to `next_hop` (link-layer resolution is the
    /// driver's business, via the neighbor cache).
    fn tx(&self, msg: NetMsg, next_hop: Ipv4Addr) -> NetResult<()>;

    fn mtu(&self) -> usize;

    fn ipv4_addr(&self) -> Ipv4Addr;

    fn netmask(&self) -> Ipv4Addr;

    fn mac(&self) -> MacAddr;

    fn hw_type(&self) -> HwType;
}

static DEVICES: IrqMutex<Vec<Arc<dyn NetDevice>>> = IrqMutex::new(Vec::new());

/// Register a device; returns its index.
pub fn register_device(device: Arc<dyn NetDevice>) -> DevIndex {
    let mut devices = DEVICES.lock();
    devices.push(device);
    let index = DevIndex(devices.len() - 1);
    drop(devices);
    klog_debug!("net: registered device {}", index);
    index
}

/// Resolve a device index.
pub fn device(index: DevIndex) -> NetResult<Arc<dyn NetDevice>> {
    DEVICES
        .lock()
        .get(index.0)
        .cloned()
        .ok_or(NetError::InvalidArgument)
}

/// Find the device owning `addr` (strong-host receive checks and source
/// address constraints in routing).
pub fn device_with_addr(addr: Ipv4Addr) -> Option<DevIndex> {
    let devices = DEVICES.lock();
    devices
        .iter()
        .position(|d| d.ipv4_addr() == addr)
        .map(DevIndex)
}

// =============================================================================
// Loopback
// =============================================================================

struct Loopback;

impl NetDevice for Loopback {
    fn tx(&self, mut msg: NetMsg, _next_hop: Ipv4Addr) -> NetResult<()> {
        // Straight back up: what leaves the stack re-enters it.
        msg.dev = Some(DevIndex(0));
        crate::ipv4::ip_rx_msg(msg);
        Ok(())
    }

    fn mtu(&self) -> usize {
        65535
    }

    fn ipv4_addr(&self) -> Ipv4Addr {
        Ipv4Addr::LOCALHOST
    }

    fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr([255, 0, 0, 0])
    }

    fn mac(&self) -> MacAddr {
        MacAddr::default()
    }

    fn hw_type(&self) -> HwType {
        HwType::Loopback
    }
}

/// Register the loopback device and its connected route. Device index 0
/// by convention.
pub fn register_loopback() -> DevIndex {
    let index = register_device(Arc::new(Loopback));
    route::add_route(RouteEntry {
        dest: Ipv4Addr([127, 0, 0, 0]),
        netmask: Ipv4Addr([255, 0, 0, 0]),
        gateway: Ipv4Addr::UNSPECIFIED,
        dev: index,
        flags: RouteFlags::UP,
    });
    index
}

/// Configure a freshly registered NIC: its connected-subnet route plus an
/// optional default gateway (the DHCP collaborator calls this).
pub fn configure_device(index: DevIndex, gateway: Option<Ipv4Addr>) -> NetResult<()> {
    let dev = device(index)?;
    let addr = dev.ipv4_addr();
    let mask = dev.netmask();
    route::add_route(RouteEntry {
        dest: Ipv4Addr::from_u32_be(addr.to_u32_be() & mask.to_u32_be()),
        netmask: mask,
        gateway: Ipv4Addr::UNSPECIFIED,
        dev: index,
        flags: RouteFlags::UP,
    });
    if let Some(gw) = gateway {
        route::add_route(RouteEntry {
            dest: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: gw,
            dev: index,
            flags: RouteFlags::UP | RouteFlags::GW,
        });
    }
    Ok(())
}
