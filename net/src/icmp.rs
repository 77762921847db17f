//! ICMP: echo service and destination-unreachable generation (RFC 792).

extern crate alloc;

use cinder_abi::net::IPPROTO_ICMP;
use cinder_lib::klog_debug;

use super::ipv4::{self, IpHeader};
use super::netmsg::{NetMsg, checksum};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;

pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

const ICMP_HEADER_LEN: usize = 8;

/// Handle one ICMP message (header already stripped to the L4 bytes).
pub fn icmp_rx(header: &IpHeader, l4: &[u8]) {
    if l4.len() < ICMP_HEADER_LEN {
        return;
    }
    if checksum(l4) != 0 {
        klog_debug!("icmp: bad checksum from {:?}", header.src);
        return;
    }

    match l4[0] {
        ICMP_ECHO_REQUEST => echo_reply(header, l4),
        ICMP_ECHO_REPLY | ICMP_DEST_UNREACHABLE => {
            // Raw/ICMP sockets already saw the datagram in the IP fanout;
            // nothing else consumes these in the core.
        }
        _ => {}
    }
}

/// Answer an echo request in place: swap addresses, flip the type,
/// recompute the checksum, and send it back out.
fn echo_reply(header: &IpHeader, request: &[u8]) {
    let mut reply = NetMsg::new();
    reply.protocol = IPPROTO_ICMP;
    reply.src = header.dst;
    reply.dst = header.src;

    reply.append(request);
    let body = reply.payload_mut();
    body[0] = ICMP_ECHO_REPLY;
    body[2] = 0;
    body[3] = 0;
    let csum = checksum(body);
    let body = reply.payload_mut();
    body[2..4].copy_from_slice(&csum.to_be_bytes());
    reply.mark_l4();

    if ipv4::ip_tx_msg(reply).is_err() {
        klog_debug!("icmp: echo reply to {:?} unroutable", header.src);
    }
}

/// Send a destination-unreachable for the offending datagram, carrying
/// its IP header plus the first 8 payload bytes, as the RFC prescribes.
pub fn send_unreachable(code: u8, original: &IpHeader, original_l4: &[u8]) {
    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_ICMP;
    msg.src = original.dst;
    msg.dst = original.src;

    let mut body = [0u8; ICMP_HEADER_LEN];
    body[0] = ICMP_DEST_UNREACHABLE;
    body[1] = code;
    msg.append(&body);

    // Quoted original: its header (rebuilt canonically) plus 8 bytes.
    let mut quoted_header = [0u8; ipv4::IP_HEADER_LEN];
    rebuild_original_header(&mut quoted_header, original, original_l4.len());
    msg.append(&quoted_header);
    msg.append(&original_l4[..original_l4.len().min(8)]);

    let csum = checksum(msg.payload());
    let body = msg.payload_mut();
    body[2..4].copy_from_slice(&csum.to_be_bytes());
    msg.mark_l4();

    let _ = ipv4::ip_tx_msg(msg);
}

fn rebuild_original_header(out: &mut [u8; ipv4::IP_HEADER_LEN], h: &IpHeader, l4_len: usize) {
    out[0] = 0x45;
    let total = (ipv4::IP_HEADER_LEN + l4_len) as u16;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    out[4..6].copy_from_slice(&h.id.to_be_bytes());
    out[8] = h.ttl;
    out[9] = h.protocol;
    out[12..16].copy_from_slice(&h.src.0);
    out[16..20].copy_from_slice(&h.dst.0);
    let csum = checksum(&out[..]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Ping support for the socket layer: build an echo request payload.
pub fn build_echo_request(ident: u16, seq: u16, data: &[u8]) -> NetMsg {
    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_ICMP;
    let mut header = [0u8; ICMP_HEADER_LEN];
    header[0] = ICMP_ECHO_REQUEST;
    header[4..6].copy_from_slice(&ident.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    msg.append(&header);
    msg.append(data);
    let csum = checksum(msg.payload());
    msg.payload_mut()[2..4].copy_from_slice(&csum.to_be_bytes());
    msg.mark_l4();
    msg
}

/// `true` if `l4` parses as an echo reply matching `ident` (tests).
pub fn is_echo_reply(l4: &[u8], ident: u16) -> bool {
    l4.len() >= ICMP_HEADER_LEN
        && l4[0] == ICMP_ECHO_REPLY
        && u16::from_be_bytes([l4[4], l4[5]]) == ident
}
