//! IPv4: header handling, transmit with fragmentation, receive with
//! reassembly, and protocol dispatch.

extern crate alloc;

use alloc::vec::Vec;

use cinder_abi::net::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use cinder_lib::{IrqMutex, clock, klog_debug};

use super::netdev;
use super::netmsg::{NetMsg, checksum};
use super::route;
use super::types::{Ipv4Addr, NetError, NetResult};
use super::{icmp, socket, tcp, udp};

/// Header length without options; this stack always sends IHL=5.
pub const IP_HEADER_LEN: usize = 20;

/// Default time-to-live.
pub const IP_DEFAULT_TTL: u8 = 64;

/// Largest reassembled payload: 65535 minus the 20-byte header.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65515;

/// Reassembly contexts die after this many ticks without a new fragment.
pub const REASSEMBLY_TIMEOUT_TICKS: u64 = 15;

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const OFFSET_MASK: u16 = 0x1FFF;

/// Parsed IPv4 header.
#[derive(Clone, Copy, Debug, Default)]
pub struct IpHeader {
    pub ihl: u8,
    pub total_len: u16,
    pub id: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes.
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl IpHeader {
    /// Parse and checksum-verify a header from raw bytes.
    pub fn parse(raw: &[u8]) -> NetResult<Self> {
        if raw.len() < IP_HEADER_LEN {
            return Err(NetError::InvalidArgument);
        }
        let version = raw[0] >> 4;
        let ihl = raw[0] & 0x0F;
        if version != 4 || ihl < 5 {
            return Err(NetError::InvalidArgument);
        }
        let header_len = ihl as usize * 4;
        if raw.len() < header_len {
            return Err(NetError::InvalidArgument);
        }
        if checksum(&raw[..header_len]) != 0 {
            return Err(NetError::InvalidArgument);
        }
        let flags_frag = u16::from_be_bytes([raw[6], raw[7]]);
        Ok(Self {
            ihl,
            total_len: u16::from_be_bytes([raw[2], raw[3]]),
            id: u16::from_be_bytes([raw[4], raw[5]]),
            dont_fragment: flags_frag & FLAG_DF != 0,
            more_fragments: flags_frag & FLAG_MF != 0,
            frag_offset: (flags_frag & OFFSET_MASK) * 8,
            ttl: raw[8],
            protocol: raw[9],
            src: Ipv4Addr([raw[12], raw[13], raw[14], raw[15]]),
            dst: Ipv4Addr([raw[16], raw[17], raw[18], raw[19]]),
        })
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }
}

/// Serialize a header into `out` (20 bytes), computing the checksum.
fn build_header(
    out: &mut [u8],
    payload_len: usize,
    id: u16,
    flags_df: bool,
    flags_mf: bool,
    frag_offset_bytes: u16,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) {
    out[0] = 0x45; // version 4, IHL 5
    out[1] = 0;
    let total = (IP_HEADER_LEN + payload_len) as u16;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    out[4..6].copy_from_slice(&id.to_be_bytes());
    let mut flags_frag = frag_offset_bytes / 8;
    if flags_df {
        flags_frag |= FLAG_DF;
    }
    if flags_mf {
        flags_frag |= FLAG_MF;
    }
    out[6..8].copy_from_slice(&flags_frag.to_be_bytes());
    out[8] = IP_DEFAULT_TTL;
    out[9] = protocol;
    out[10] = 0;
    out[11] = 0;
    out[12..16].copy_from_slice(&src.0);
    out[16..20].copy_from_slice(&dst.0);
    let csum = checksum(&out[..IP_HEADER_LEN]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Datagram identifiers, taken only when fragmentation happens.
static NEXT_ID: IrqMutex<u16> = IrqMutex::new(1);

fn fresh_id() -> u16 {
    let mut next = NEXT_ID.lock();
    let id = *next;
    *next = next.wrapping_add(1).max(1);
    id
}

// =============================================================================
// Transmit
// =============================================================================

/// Send one L4 payload: route, fill in the source, add the header, and
/// fragment if the interface MTU demands it.
pub fn ip_tx_msg(mut msg: NetMsg) -> NetResult<()> {
    let src_hint = if msg.src.is_unspecified() {
        None
    } else {
        Some(msg.src)
    };
    let (dev_index, next_hop) =
        route::get_route(src_hint, msg.dst).ok_or(NetError::Unreachable)?;
    let dev = netdev::device(dev_index)?;
    if msg.src.is_unspecified() {
        msg.src = dev.ipv4_addr();
    }
    msg.dev = Some(dev_index);

    let mtu = dev.mtu();
    let payload_len = msg.len();

    if IP_HEADER_LEN + payload_len <= mtu {
        // Single datagram; an ID is only burned when fragmenting.
        let (src, dst, protocol, df) = (msg.src, msg.dst, msg.protocol, msg.dont_fragment);
        let header = msg.prepend(IP_HEADER_LEN);
        build_header(header, payload_len, 0, df, false, 0, protocol, src, dst);
        msg.mark_l3();
        return dev.tx(msg, next_hop);
    }

    if msg.dont_fragment {
        return Err(NetError::MessageTooBig);
    }

    // Fragment: payload per piece is the MTU minus header, rounded down
    // to a multiple of 8; all pieces share one fresh ID.
    let frag_payload = (mtu - IP_HEADER_LEN) & !7;
    if frag_payload == 0 {
        return Err(NetError::MessageTooBig);
    }
    let id = fresh_id();
    let payload = msg.payload().to_vec();
    let mut offset = 0usize;
    while offset < payload.len() {
        let chunk = frag_payload.min(payload.len() - offset);
        let more = offset + chunk < payload.len();

        let mut piece = NetMsg::new();
        piece.src = msg.src;
        piece.dst = msg.dst;
        piece.protocol = msg.protocol;
        piece.dev = Some(dev_index);
        piece.append(&payload[offset..offset + chunk]);
        let header = piece.prepend(IP_HEADER_LEN);
        build_header(
            header,
            chunk,
            id,
            false,
            more,
            offset as u16,
            msg.protocol,
            msg.src,
            msg.dst,
        );
        piece.mark_l3();
        dev.tx(piece, next_hop)?;
        offset += chunk;
    }
    Ok(())
}

// =============================================================================
// Receive
// =============================================================================

/// Handle one received datagram or fragment. The message starts at the IP
/// header; `msg.dev` names the ingress interface. Invalid packets are
/// dropped silently (counted, not erred).
pub fn ip_rx_msg(mut msg: NetMsg) {
    let header = match IpHeader::parse(msg.payload()) {
        Ok(h) => h,
        Err(_) => {
            klog_debug!("ipv4: dropped packet with bad header");
            return;
        }
    };
    if header.ttl == 0 {
        return;
    }

    // Strong host model: the destination must be the receiving
    // interface's own address (or broadcast).
    let Some(dev_index) = msg.dev else {
        return;
    };
    let Ok(dev) = netdev::device(dev_index) else {
        return;
    };
    if header.dst != dev.ipv4_addr() && !header.dst.is_broadcast() {
        return;
    }

    // The header's total length rules; drivers may pad frames.
    let total = header.total_len as usize;
    if total > msg.len() {
        return; // truncated on the wire
    }

    msg.mark_l3();
    msg.src = header.src;
    msg.dst = header.dst;
    msg.protocol = header.protocol;

    if header.is_fragment() {
        if let Some(complete) = reassemble(&header, &msg) {
            dispatch(complete.0, complete.1);
        }
        return;
    }

    // Strip the header; hand the L4 payload up.
    let header_len = header.ihl as usize * 4;
    let datagram = msg.payload()[..total].to_vec();
    let l4 = datagram[header_len..].to_vec();
    dispatch_parts(header, datagram, l4, dev_index);
}

fn dispatch(header: IpHeader, payload: Vec<u8>) {
    // Reassembled path: rebuild the full datagram view for raw sockets.
    let mut datagram = Vec::with_capacity(IP_HEADER_LEN + payload.len());
    let mut raw_header = [0u8; IP_HEADER_LEN];
    build_header(
        &mut raw_header,
        payload.len(),
        header.id,
        false,
        false,
        0,
        header.protocol,
        header.src,
        header.dst,
    );
    datagram.extend_from_slice(&raw_header);
    datagram.extend_from_slice(&payload);
    dispatch_parts(header, datagram, payload, super::types::DevIndex(0));
}

/// Fan out one complete datagram: raw sockets see header plus payload;
/// the protocol handlers see the L4 bytes.
fn dispatch_parts(header: IpHeader, datagram: Vec<u8>, l4: Vec<u8>, dev: super::types::DevIndex) {
    socket::raw_deliver(header.protocol, header.src, header.dst, &datagram);
    match header.protocol {
        IPPROTO_ICMP => icmp::icmp_rx(&header, &l4),
        IPPROTO_UDP => udp::udp_rx(&header, &l4, dev),
        IPPROTO_TCP => tcp::tcp_rx(&header, &l4),
        _ => {}
    }
}

// =============================================================================
// Reassembly
// =============================================================================

struct Fragment {
    offset: usize,
    data: Vec<u8>,
}

struct ReassemblyCtx {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
    fragments: Vec<Fragment>,
    /// Payload length once the MF=0 fragment arrives; 0 until then.
    total_len: usize,
    last_activity: u64,
}

impl ReassemblyCtx {
    /// Insert one fragment, trimming the bytes of the newcomer that
    /// overlap earlier arrivals (first arrival wins).
    fn insert(&mut self, mut offset: usize, mut data: Vec<u8>) {
        for frag in &self.fragments {
            let frag_end = frag.offset + frag.data.len();
            let end = offset + data.len();
            if offset >= frag_end || end <= frag.offset {
                continue; // disjoint
            }
            if offset >= frag.offset && end <= frag_end {
                return; // fully covered by an earlier arrival
            }
            if offset < frag.offset {
                // Overlapping tail: keep our head up to the earlier start.
                data.truncate(frag.offset - offset);
            } else {
                // Overlapping head: drop the covered prefix.
                let skip = frag_end - offset;
                data.drain(..skip);
                offset = frag_end;
            }
        }
        if data.is_empty() {
            return;
        }
        let position = self
            .fragments
            .iter()
            .position(|f| f.offset > offset)
            .unwrap_or(self.fragments.len());
        self.fragments.insert(position, Fragment { offset, data });
    }

    fn payload_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.data.len()).sum()
    }

    /// Complete when the first byte is covered, the tail is known, and
    /// there are no gaps.
    fn try_complete(&self) -> Option<Vec<u8>> {
        if self.total_len == 0 {
            return None;
        }
        let mut expected = 0usize;
        for frag in &self.fragments {
            if frag.offset != expected {
                return None;
            }
            expected += frag.data.len();
        }
        if expected != self.total_len {
            return None;
        }
        let mut payload = Vec::with_capacity(self.total_len);
        for frag in &self.fragments {
            payload.extend_from_slice(&frag.data);
        }
        Some(payload)
    }
}

static REASSEMBLY: IrqMutex<Vec<ReassemblyCtx>> = IrqMutex::new(Vec::new());

/// Insert a fragment; returns the reassembled payload when it closes the
/// datagram.
fn reassemble(header: &IpHeader, msg: &NetMsg) -> Option<(IpHeader, Vec<u8>)> {
    let header_len = header.ihl as usize * 4;
    let total = header.total_len as usize;
    let data = msg.payload().get(header_len..total)?.to_vec();
    let offset = header.frag_offset as usize;

    let mut contexts = REASSEMBLY.lock();
    let key = (header.src, header.dst, header.id, header.protocol);
    let index = match contexts
        .iter()
        .position(|c| (c.src, c.dst, c.id, c.protocol) == key)
    {
        Some(i) => i,
        None => {
            contexts.push(ReassemblyCtx {
                src: header.src,
                dst: header.dst,
                id: header.id,
                protocol: header.protocol,
                fragments: Vec::new(),
                total_len: 0,
                last_activity: 0,
            });
            contexts.len() - 1
        }
    };

    let ctx = &mut contexts[index];
    ctx.last_activity = clock::uptime_ticks();
    if !header.more_fragments {
        ctx.total_len = offset + data.len();
    }
    ctx.insert(offset, data);

    // Oversized reassemblies are dropped outright.
    if ctx.payload_bytes() > MAX_DATAGRAM_PAYLOAD
        || ctx.total_len > MAX_DATAGRAM_PAYLOAD
    {
        klog_debug!("ipv4: reassembly overflow from {:?}", header.src);
        contexts.swap_remove(index);
        return None;
    }

    if let Some(payload) = ctx.try_complete() {
        let done = IpHeader {
            frag_offset: 0,
            more_fragments: false,
            total_len: (IP_HEADER_LEN + payload.len()) as u16,
            ..*header
        };
        contexts.swap_remove(index);
        return Some((done, payload));
    }
    None
}

/// Expire idle reassembly contexts; called from the tick hook.
pub fn reassembly_expire(now: u64) {
    let mut contexts = REASSEMBLY.lock();
    let before = contexts.len();
    contexts.retain(|c| now.saturating_sub(c.last_activity) < REASSEMBLY_TIMEOUT_TICKS);
    if contexts.len() != before {
        klog_debug!(
            "ipv4: expired {} reassembly context(s)",
            before - contexts.len()
        );
    }
}

/// Pending reassembly contexts (tests).
pub fn reassembly_pending() -> usize {
    REASSEMBLY.lock().len()
}
