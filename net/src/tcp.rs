//! TCP (RFC 793): state machine, connection table, handshake, data
//! transfer, teardown, and retransmission.
//!
//! Locking rule: the connection table lock is never held across a
//! transmit. Handlers mutate connection state under the lock, queue the
//! segments they want sent, then drop the lock and put them on the wire;
//! on loopback a transmit re-enters `tcp_rx` synchronously, which would
//! otherwise deadlock.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use cinder_abi::net::IPPROTO_TCP;
use cinder_lib::{CondVar, IrqMutex, clock, klog_debug};

use super::ipv4::{self, IpHeader};
use super::netmsg::{NetMsg, fold_checksum, ones_complement_sum, pseudo_header_sum};
use super::socket;
use super::types::{Endpoint, Ipv4Addr, NetError, NetResult, Port};

pub const TCP_HEADER_LEN: usize = 20;
pub const MAX_CONNECTIONS: usize = 64;
/// MSS we advertise and segmentize to (Ethernet MTU minus IP and TCP).
pub const DEFAULT_MSS: usize = 1460;
/// Receive window we advertise.
pub const WINDOW: u16 = 16384;
/// Retransmission timeout in ticks (1 s at 100 Hz).
const RTO_TICKS: u64 = 100;
const MAX_RETRANSMITS: u8 = 8;
/// TIME_WAIT duration (2 MSL, compressed for a tick-driven kernel).
const TIME_WAIT_TICKS: u64 = 6000;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// `a < b` in sequence space.
#[inline]
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// A queued outgoing segment (also the retransmission unit).
#[derive(Clone)]
struct OutSeg {
    src: Endpoint,
    dst: Endpoint,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: Vec<u8>,
}

struct Unacked {
    seg: OutSeg,
    sent_at: u64,
    retries: u8,
}

pub struct TcpConn {
    pub state: TcpState,
    pub local: Endpoint,
    pub remote: Endpoint,
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to send.
    snd_nxt: u32,
    /// Next sequence number expected from the peer.
    rcv_nxt: u32,
    /// In-order bytes ready for the application.
    recv_buf: VecDeque<u8>,
    /// Peer sent FIN and we consumed all data before it.
    peer_closed: bool,
    unacked: VecDeque<Unacked>,
    /// For LISTEN connections: established children awaiting accept.
    accept_queue: VecDeque<usize>,
    backlog: usize,
    /// Index of the listener that spawned this connection.
    listener: Option<usize>,
    time_wait_since: u64,
    /// A reset or refusal surfaced to the next API call.
    pending_error: Option<NetError>,
}

impl TcpConn {
    fn new(local: Endpoint, remote: Endpoint, state: TcpState) -> Self {
        Self {
            state,
            local,
            remote,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            recv_buf: VecDeque::new(),
            peer_closed: false,
            unacked: VecDeque::new(),
            accept_queue: VecDeque::new(),
            backlog: 0,
            listener: None,
            time_wait_since: 0,
            pending_error: None,
        }
    }

    fn readable(&self) -> bool {
        !self.recv_buf.is_empty()
            || self.peer_closed
            || self.pending_error.is_some()
            || (self.state == TcpState::Listen && !self.accept_queue.is_empty())
    }
}

type ConnTable = [Option<TcpConn>; MAX_CONNECTIONS];

static CONNS: IrqMutex<ConnTable> = IrqMutex::new([const { None }; MAX_CONNECTIONS]);

/// Waiters for any TCP state change (connect, accept, recv).
static TCP_EVENT: CondVar = CondVar::new();

/// Initial sequence numbers; a counter is enough for a single-image
/// kernel (no persistence across boots to defend against).
static NEXT_ISS: IrqMutex<u32> = IrqMutex::new(0x1000);

fn fresh_iss() -> u32 {
    let mut iss = NEXT_ISS.lock();
    *iss = iss.wrapping_add(64_000);
    *iss
}

// =============================================================================
// Segment building
// =============================================================================

fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = pseudo_header_sum(src, dst, IPPROTO_TCP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(&segment[..16]));
    if segment.len() > 18 {
        sum = sum.wrapping_add(ones_complement_sum(&segment[18..]));
    }
    fold_checksum(sum)
}

/// Put one segment on the wire.
fn tx_segment(seg: &OutSeg) {
    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_TCP;
    msg.src = seg.src.addr;
    msg.dst = seg.dst.addr;
    msg.append(&seg.payload);

    let header = msg.prepend(TCP_HEADER_LEN);
    header[0..2].copy_from_slice(&seg.src.port.to_be().to_le_bytes());
    header[2..4].copy_from_slice(&seg.dst.port.to_be().to_le_bytes());
    header[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    header[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    header[12] = (5u8) << 4; // data offset
    header[13] = seg.flags;
    header[14..16].copy_from_slice(&WINDOW.to_be_bytes());
    header[16] = 0;
    header[17] = 0;
    header[18] = 0;
    header[19] = 0;
    msg.mark_l4();

    let csum = tcp_checksum(seg.src.addr, seg.dst.addr, msg.l4_segment());
    msg.payload_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    if ipv4::ip_tx_msg(msg).is_err() {
        klog_debug!("tcp: segment to {:?} unroutable", seg.dst.addr);
    }
}

fn send_all(segs: Vec<OutSeg>, wake: bool) {
    for seg in &segs {
        tx_segment(seg);
    }
    if wake {
        TCP_EVENT.broadcast();
        socket::net_event_broadcast();
    }
}

/// Sequence-space length of a segment (payload plus SYN/FIN).
fn seg_len(seg: &OutSeg) -> u32 {
    let mut len = seg.payload.len() as u32;
    if seg.flags & (FLAG_SYN | FLAG_FIN) != 0 {
        len += 1;
    }
    len
}

// =============================================================================
// Connection API (called by the socket layer)
// =============================================================================

fn alloc_slot(table: &mut ConnTable) -> NetResult<usize> {
    table
        .iter()
        .position(|c| c.is_none())
        .ok_or(NetError::NoResources)
}

/// Open a passive connection.
pub fn conn_listen(local: Endpoint, backlog: usize) -> NetResult<usize> {
    let mut table = CONNS.lock();
    if table.iter().flatten().any(|c| {
        c.state == TcpState::Listen && c.local.port == local.port
    }) {
        return Err(NetError::AddressInUse);
    }
    let slot = alloc_slot(&mut table)?;
    let mut conn = TcpConn::new(local, Endpoint::UNSPECIFIED, TcpState::Listen);
    conn.backlog = backlog.clamp(1, 16);
    table[slot] = Some(conn);
    Ok(slot)
}

/// Open an active connection and block until it is established or
/// refused.
pub fn conn_connect(local: Endpoint, remote: Endpoint) -> NetResult<usize> {
    let iss = fresh_iss();
    let slot;
    {
        let mut table = CONNS.lock();
        slot = alloc_slot(&mut table)?;
        let mut conn = TcpConn::new(local, remote, TcpState::SynSent);
        conn.snd_una = iss;
        conn.snd_nxt = iss.wrapping_add(1);
        table[slot] = Some(conn);
    }

    let syn = OutSeg {
        src: local,
        dst: remote,
        seq: iss,
        ack: 0,
        flags: FLAG_SYN,
        payload: Vec::new(),
    };
    push_unacked(slot, &syn);
    tx_segment(&syn);

    // Wait for the handshake to finish (the loopback path completes it
    // before we even get here).
    let mut table = CONNS.lock();
    loop {
        let Some(conn) = table[slot].as_mut() else {
            return Err(NetError::ConnectionReset);
        };
        match conn.state {
            TcpState::Established => return Ok(slot),
            TcpState::Closed => {
                let err = conn.pending_error.unwrap_or(NetError::ConnectionRefused);
                table[slot] = None;
                return Err(err);
            }
            _ => {}
        }
        match TCP_EVENT.wait_intr(table) {
            Ok(guard) => table = guard,
            Err((mut guard, e)) => {
                guard[slot] = None;
                return Err(match e {
                    cinder_abi::error::KernelError::Interrupted => NetError::Interrupted,
                    _ => NetError::TimedOut,
                });
            }
        }
    }
}

/// Accept one established child from a listener.
pub fn conn_accept(listen_slot: usize, nonblock: bool) -> NetResult<usize> {
    let mut table = CONNS.lock();
    loop {
        let Some(conn) = table[listen_slot].as_mut() else {
            return Err(NetError::BadDescriptor);
        };
        if conn.state != TcpState::Listen {
            return Err(NetError::InvalidArgument);
        }
        if let Some(child) = conn.accept_queue.pop_front() {
            return Ok(child);
        }
        if nonblock {
            return Err(NetError::WouldBlock);
        }
        match TCP_EVENT.wait_intr(table) {
            Ok(guard) => table = guard,
            Err((_, _)) => return Err(NetError::Interrupted),
        }
    }
}

fn push_unacked(slot: usize, seg: &OutSeg) {
    let mut table = CONNS.lock();
    if let Some(conn) = table[slot].as_mut() {
        if seg_len(seg) > 0 {
            conn.unacked.push_back(Unacked {
                seg: seg.clone(),
                sent_at: clock::uptime_ticks(),
                retries: 0,
            });
        }
    }
}

/// Send application data, segmentized to the MSS. Returns bytes queued.
pub fn conn_send(slot: usize, data: &[u8]) -> NetResult<usize> {
    let mut segs = Vec::new();
    {
        let mut table = CONNS.lock();
        let Some(conn) = table[slot].as_mut() else {
            return Err(NetError::BadDescriptor);
        };
        if let Some(err) = conn.pending_error {
            return Err(err);
        }
        match conn.state {
            TcpState::Established | TcpState::CloseWait => {}
            TcpState::SynSent | TcpState::SynReceived => return Err(NetError::WouldBlock),
            _ => return Err(NetError::NotConnected),
        }
        for chunk in data.chunks(DEFAULT_MSS) {
            let seg = OutSeg {
                src: conn.local,
                dst: conn.remote,
                seq: conn.snd_nxt,
                ack: conn.rcv_nxt,
                flags: FLAG_ACK | FLAG_PSH,
                payload: chunk.to_vec(),
            };
            conn.snd_nxt = conn.snd_nxt.wrapping_add(chunk.len() as u32);
            conn.unacked.push_back(Unacked {
                seg: seg.clone(),
                sent_at: clock::uptime_ticks(),
                retries: 0,
            });
            segs.push(seg);
        }
    }
    send_all(segs, false);
    Ok(data.len())
}

/// Receive into `buf`; blocks in blocking mode while the connection is
/// open with no data. Returns 0 at end of stream.
pub fn conn_recv(slot: usize, buf: &mut [u8], nonblock: bool) -> NetResult<usize> {
    let mut table = CONNS.lock();
    loop {
        let Some(conn) = table[slot].as_mut() else {
            return Err(NetError::BadDescriptor);
        };
        if !conn.recv_buf.is_empty() {
            let mut n = 0;
            while n < buf.len() {
                match conn.recv_buf.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            return Ok(n);
        }
        if let Some(err) = conn.pending_error {
            conn.pending_error = None;
            return Err(err);
        }
        if conn.peer_closed || matches!(conn.state, TcpState::Closed | TcpState::TimeWait) {
            return Ok(0);
        }
        if nonblock {
            return Err(NetError::WouldBlock);
        }
        match TCP_EVENT.wait_intr(table) {
            Ok(guard) => table = guard,
            Err((_, _)) => return Err(NetError::Interrupted),
        }
    }
}

/// Close our side: FIN for synchronized states, instant teardown
/// otherwise.
pub fn conn_close(slot: usize) {
    let mut fin = None;
    {
        let mut table = CONNS.lock();
        let Some(conn) = table[slot].as_mut() else {
            return;
        };
        match conn.state {
            TcpState::Established => {
                conn.state = TcpState::FinWait1;
                fin = Some(make_fin(conn));
            }
            TcpState::CloseWait => {
                conn.state = TcpState::LastAck;
                fin = Some(make_fin(conn));
            }
            TcpState::SynSent | TcpState::Listen | TcpState::SynReceived => {
                table[slot] = None;
            }
            _ => {}
        }
    }
    if let Some(seg) = fin {
        push_unacked(slot, &seg);
        tx_segment(&seg);
    }
}

fn make_fin(conn: &mut TcpConn) -> OutSeg {
    let seg = OutSeg {
        src: conn.local,
        dst: conn.remote,
        seq: conn.snd_nxt,
        ack: conn.rcv_nxt,
        flags: FLAG_FIN | FLAG_ACK,
        payload: Vec::new(),
    };
    conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
    seg
}

/// `true` if a read on the connection would not block.
pub fn conn_readable(slot: usize) -> bool {
    let table = CONNS.lock();
    table[slot].as_ref().map(|c| c.readable()).unwrap_or(false)
}

/// Remote endpoint of an established connection (accept reporting).
pub fn conn_remote(slot: usize) -> Option<Endpoint> {
    let table = CONNS.lock();
    table[slot].as_ref().map(|c| c.remote)
}

/// Connection state (tests and diagnostics).
pub fn conn_state(slot: usize) -> Option<TcpState> {
    let table = CONNS.lock();
    table[slot].as_ref().map(|c| c.state)
}

// =============================================================================
// Receive path
// =============================================================================

struct Parsed {
    src_port: Port,
    dst_port: Port,
    seq: u32,
    ack: u32,
    flags: u8,
    payload_start: usize,
}

fn parse(l4: &[u8]) -> Option<Parsed> {
    if l4.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = ((l4[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > l4.len() {
        return None;
    }
    Some(Parsed {
        src_port: Port(u16::from_be_bytes([l4[0], l4[1]])),
        dst_port: Port(u16::from_be_bytes([l4[2], l4[3]])),
        seq: u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]),
        ack: u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]),
        flags: l4[13],
        payload_start: data_offset,
    })
}

/// Handle one received segment.
pub fn tcp_rx(header: &IpHeader, l4: &[u8]) {
    let Some(seg) = parse(l4) else {
        return;
    };
    if tcp_checksum(header.src, header.dst, l4) != 0 {
        klog_debug!("tcp: bad checksum from {:?}", header.src);
        return;
    }
    let payload = &l4[seg.payload_start..];
    let local = Endpoint {
        addr: header.dst,
        port: seg.dst_port,
    };
    let remote = Endpoint {
        addr: header.src,
        port: seg.src_port,
    };

    let mut out: Vec<OutSeg> = Vec::new();
    let mut wake = false;
    {
        let mut table = CONNS.lock();

        // Exact four-tuple match first, then a listener on the port.
        let exact = table.iter().position(|c| {
            c.as_ref().is_some_and(|c| {
                c.state != TcpState::Listen && c.local.port == local.port && c.remote == remote
            })
        });
        let listener = table.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.state == TcpState::Listen && c.local.port == local.port)
        });

        match (exact, listener) {
            (Some(slot), _) => {
                handle_segment(&mut table, slot, &seg, payload, &mut out, &mut wake);
            }
            (None, Some(listen_slot)) if seg.flags & FLAG_SYN != 0 && seg.flags & FLAG_ACK == 0 => {
                handle_passive_open(&mut table, listen_slot, local, remote, &seg, &mut out);
            }
            _ => {
                // No one home: refuse with RST (unless this is an RST).
                if seg.flags & FLAG_RST == 0 {
                    out.push(rst_for(local, remote, &seg, payload.len()));
                }
            }
        }
    }
    send_all(out, wake);
}

fn rst_for(local: Endpoint, remote: Endpoint, seg: &Parsed, payload_len: usize) -> OutSeg {
    let mut advance = payload_len as u32;
    if seg.flags & (FLAG_SYN | FLAG_FIN) != 0 {
        advance += 1;
    }
    OutSeg {
        src: local,
        dst: remote,
        seq: if seg.flags & FLAG_ACK != 0 { seg.ack } else { 0 },
        ack: seg.seq.wrapping_add(advance),
        flags: FLAG_RST | FLAG_ACK,
        payload: Vec::new(),
    }
}

fn handle_passive_open(
    table: &mut ConnTable,
    listen_slot: usize,
    local: Endpoint,
    remote: Endpoint,
    seg: &Parsed,
    out: &mut Vec<OutSeg>,
) {
    let backlog_full = table[listen_slot]
        .as_ref()
        .map(|l| l.accept_queue.len() >= l.backlog)
        .unwrap_or(true);
    let Ok(child_slot) = alloc_slot(table) else {
        return;
    };
    if backlog_full {
        return; // silently drop; the peer retransmits
    }

    let iss = fresh_iss();
    let mut child = TcpConn::new(local, remote, TcpState::SynReceived);
    child.rcv_nxt = seg.seq.wrapping_add(1);
    child.snd_una = iss;
    child.snd_nxt = iss.wrapping_add(1);
    child.listener = Some(listen_slot);
    table[child_slot] = Some(child);

    out.push(OutSeg {
        src: local,
        dst: remote,
        seq: iss,
        ack: seg.seq.wrapping_add(1),
        flags: FLAG_SYN | FLAG_ACK,
        payload: Vec::new(),
    });
}

fn handle_segment(
    table: &mut ConnTable,
    slot: usize,
    seg: &Parsed,
    payload: &[u8],
    out: &mut Vec<OutSeg>,
    wake: &mut bool,
) {
    let Some(conn) = table[slot].as_mut() else {
        return;
    };

    // RST tears the connection down unconditionally.
    if seg.flags & FLAG_RST != 0 {
        conn.pending_error = Some(if conn.state == TcpState::SynSent {
            NetError::ConnectionRefused
        } else {
            NetError::ConnectionReset
        });
        conn.state = TcpState::Closed;
        *wake = true;
        return;
    }

    // ACK processing: advance snd_una, retire retransmission entries.
    if seg.flags & FLAG_ACK != 0 && seq_lt(conn.snd_una, seg.ack) && seq_le(seg.ack, conn.snd_nxt)
    {
        conn.snd_una = seg.ack;
        while let Some(front) = conn.unacked.front() {
            let end = front.seg.seq.wrapping_add(seg_len(&front.seg));
            if seq_le(end, seg.ack) {
                conn.unacked.pop_front();
            } else {
                break;
            }
        }
    }

    match conn.state {
        TcpState::SynSent => {
            if seg.flags & (FLAG_SYN | FLAG_ACK) == FLAG_SYN | FLAG_ACK
                && seg.ack == conn.snd_nxt
            {
                conn.rcv_nxt = seg.seq.wrapping_add(1);
                conn.state = TcpState::Established;
                conn.unacked.clear();
                out.push(OutSeg {
                    src: conn.local,
                    dst: conn.remote,
                    seq: conn.snd_nxt,
                    ack: conn.rcv_nxt,
                    flags: FLAG_ACK,
                    payload: Vec::new(),
                });
                *wake = true;
            }
            return;
        }
        TcpState::SynReceived => {
            if seg.flags & FLAG_ACK != 0 && seg.ack == conn.snd_nxt {
                conn.state = TcpState::Established;
                conn.unacked.clear();
                let listener = conn.listener;
                if let Some(listen_slot) = listener {
                    if let Some(l) = table[listen_slot].as_mut() {
                        l.accept_queue.push_back(slot);
                    }
                }
                *wake = true;
            }
            return;
        }
        TcpState::Closed | TcpState::Listen => return,
        _ => {}
    }

    // Data acceptance: in-order only; anything else re-ACKs rcv_nxt.
    if !payload.is_empty() {
        if seg.seq == conn.rcv_nxt {
            conn.recv_buf.extend(payload.iter().copied());
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);
            *wake = true;
        }
        out.push(OutSeg {
            src: conn.local,
            dst: conn.remote,
            seq: conn.snd_nxt,
            ack: conn.rcv_nxt,
            flags: FLAG_ACK,
            payload: Vec::new(),
        });
    }

    // FIN: the peer is done sending.
    if seg.flags & FLAG_FIN != 0 {
        let fin_seq = seg.seq.wrapping_add(payload.len() as u32);
        if fin_seq == conn.rcv_nxt {
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
            conn.peer_closed = true;
            *wake = true;
            match conn.state {
                TcpState::Established => conn.state = TcpState::CloseWait,
                TcpState::FinWait1 => {
                    // Their FIN with (or after) the ACK of ours.
                    conn.state = if seg.flags & FLAG_ACK != 0 && conn.snd_una == conn.snd_nxt {
                        conn.time_wait_since = clock::uptime_ticks();
                        TcpState::TimeWait
                    } else {
                        TcpState::Closing
                    };
                }
                TcpState::FinWait2 => {
                    conn.time_wait_since = clock::uptime_ticks();
                    conn.state = TcpState::TimeWait;
                }
                _ => {}
            }
            out.push(OutSeg {
                src: conn.local,
                dst: conn.remote,
                seq: conn.snd_nxt,
                ack: conn.rcv_nxt,
                flags: FLAG_ACK,
                payload: Vec::new(),
            });
        }
    } else if seg.flags & FLAG_ACK != 0 && conn.snd_una == conn.snd_nxt {
        // Pure ACK that covers everything outstanding: progress the
        // close states.
        match conn.state {
            TcpState::FinWait1 => conn.state = TcpState::FinWait2,
            TcpState::Closing => {
                conn.time_wait_since = clock::uptime_ticks();
                conn.state = TcpState::TimeWait;
            }
            TcpState::LastAck => {
                table[slot] = None;
                *wake = true;
                return;
            }
            _ => {}
        }
    }
}

// =============================================================================
// Timers
// =============================================================================

/// Retransmit overdue segments, give up on dead peers, expire TIME_WAIT.
pub fn on_tick(now: u64) {
    let mut resend: Vec<OutSeg> = Vec::new();
    let mut wake = false;
    {
        let mut table = CONNS.lock();
        for slot in 0..MAX_CONNECTIONS {
            let Some(conn) = table[slot].as_mut() else {
                continue;
            };
            if conn.state == TcpState::TimeWait
                && now.saturating_sub(conn.time_wait_since) >= TIME_WAIT_TICKS
            {
                table[slot] = None;
                continue;
            }
            let Some(front) = conn.unacked.front_mut() else {
                continue;
            };
            if now.saturating_sub(front.sent_at) < RTO_TICKS {
                continue;
            }
            if front.retries >= MAX_RETRANSMITS {
                klog_debug!("tcp: giving up on {:?}", conn.remote.addr);
                conn.pending_error = Some(NetError::TimedOut);
                conn.state = TcpState::Closed;
                conn.unacked.clear();
                wake = true;
                continue;
            }
            front.retries += 1;
            front.sent_at = now;
            resend.push(front.seg.clone());
        }
    }
    send_all(resend, wake);
}

/// Drop every connection (test isolation).
pub fn clear_for_tests() {
    let mut table = CONNS.lock();
    for slot in table.iter_mut() {
        *slot = None;
    }
}
