//! UDP (RFC 768): header handling and port demultiplexing.

extern crate alloc;

use cinder_abi::net::IPPROTO_UDP;
use cinder_lib::klog_debug;

use super::icmp;
use super::ipv4::{self, IpHeader};
use super::netmsg::{NetMsg, fold_checksum, ones_complement_sum, pseudo_header_sum};
use super::socket;
use super::types::{DevIndex, Endpoint, Ipv4Addr, NetResult, Port};

pub const UDP_HEADER_LEN: usize = 8;

/// Build and transmit one datagram from `src` to `dst`.
pub fn udp_tx(src: Endpoint, dst: Endpoint, payload: &[u8]) -> NetResult<()> {
    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_UDP;
    msg.src = src.addr;
    msg.dst = dst.addr;
    msg.append(payload);

    let length = (UDP_HEADER_LEN + payload.len()) as u16;
    let header = msg.prepend(UDP_HEADER_LEN);
    header[0..2].copy_from_slice(&src.port.to_be().to_le_bytes());
    header[2..4].copy_from_slice(&dst.port.to_be().to_le_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());
    header[6] = 0;
    header[7] = 0;
    msg.mark_l4();

    // Source may still be unspecified; the checksum needs the final
    // address, so route first by sending through ip_tx after fixing src.
    if msg.src.is_unspecified() {
        if let Some((dev, _)) = super::route::get_route(None, msg.dst) {
            if let Ok(device) = super::netdev::device(dev) {
                msg.src = device.ipv4_addr();
            }
        }
    }

    let csum = udp_checksum(msg.src, msg.dst, msg.l4_segment());
    let segment = msg.payload_mut();
    segment[6..8].copy_from_slice(&csum.to_be_bytes());

    ipv4::ip_tx_msg(msg)
}

/// Pseudo-header checksum; a computed zero goes out as 0xFFFF per the RFC.
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = pseudo_header_sum(src, dst, IPPROTO_UDP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(&segment[..6]));
    if segment.len() > 8 {
        sum = sum.wrapping_add(ones_complement_sum(&segment[8..]));
    }
    let csum = fold_checksum(sum);
    if csum == 0 { 0xFFFF } else { csum }
}

/// Receive one datagram: verify, demultiplex by port, or answer with
/// ICMP port-unreachable.
pub fn udp_rx(header: &IpHeader, l4: &[u8], _dev: DevIndex) {
    if l4.len() < UDP_HEADER_LEN {
        return;
    }
    let src_port = Port(u16::from_be_bytes([l4[0], l4[1]]));
    let dst_port = Port(u16::from_be_bytes([l4[2], l4[3]]));
    let length = u16::from_be_bytes([l4[4], l4[5]]) as usize;
    if length < UDP_HEADER_LEN || length > l4.len() {
        return;
    }
    let wire_csum = u16::from_be_bytes([l4[6], l4[7]]);
    if wire_csum != 0 {
        let computed = udp_checksum(header.src, header.dst, &l4[..length]);
        if computed != wire_csum {
            klog_debug!("udp: bad checksum from {:?}", header.src);
            return;
        }
    }

    let payload = &l4[UDP_HEADER_LEN..length];
    let delivered = socket::udp_deliver(
        Endpoint {
            addr: header.src,
            port: src_port,
        },
        Endpoint {
            addr: header.dst,
            port: dst_port,
        },
        payload,
    );
    if !delivered {
        // Nobody listens on the port: tell the sender.
        icmp::send_unreachable(icmp::ICMP_CODE_PORT_UNREACHABLE, header, l4);
    }
}
