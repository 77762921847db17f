//! IPv4 transmit/receive tests: fragmentation sizes, out-of-order
//! reassembly, overlap trimming, and the loopback round trip.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_abi::net::IPPROTO_UDP;
use cinder_lib::testing::TestResult;
use cinder_lib::{IrqMutex, assert_eq_test, assert_ok, assert_test, fail, pass};

use crate::ipv4::{self, IP_HEADER_LEN, IpHeader};
use crate::netdev::{self, HwType, NetDevice};
use crate::netmsg::{NetMsg, checksum};
use crate::route::{self, RouteEntry, RouteFlags};
use crate::socket;
use crate::types::{DevIndex, Ipv4Addr, MacAddr, NetResult};

/// Capturing NIC double: records every transmitted datagram.
struct CaptureNic {
    mtu: usize,
    addr: Ipv4Addr,
    frames: IrqMutex<Vec<Vec<u8>>>,
}

impl CaptureNic {
    fn new(mtu: usize, addr: Ipv4Addr) -> Self {
        Self {
            mtu,
            addr,
            frames: IrqMutex::new(Vec::new()),
        }
    }

    fn take_frames(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.frames.lock())
    }
}

impl NetDevice for CaptureNic {
    fn tx(&self, msg: NetMsg, _next_hop: Ipv4Addr) -> NetResult<()> {
        self.frames.lock().push(msg.payload().to_vec());
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn ipv4_addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr([255, 255, 255, 0])
    }

    fn mac(&self) -> MacAddr {
        MacAddr([2, 0, 0, 0, 0, 1])
    }

    fn hw_type(&self) -> HwType {
        HwType::Ethernet
    }
}

/// Register a capture NIC with a /24 route and return it.
fn capture_nic(mtu: usize, addr: [u8; 4], subnet: [u8; 4]) -> (Arc<CaptureNic>, DevIndex) {
    let nic = Arc::new(CaptureNic::new(mtu, Ipv4Addr(addr)));
    let index = netdev::register_device(nic.clone());
    route::add_route(RouteEntry {
        dest: Ipv4Addr(subnet),
        netmask: Ipv4Addr([255, 255, 255, 0]),
        gateway: Ipv4Addr::UNSPECIFIED,
        dev: index,
        flags: RouteFlags::UP,
    });
    (nic, index)
}

/// Hand-build one fragment datagram.
fn make_fragment(
    src: [u8; 4],
    dst: [u8; 4],
    id: u16,
    protocol: u8,
    offset_bytes: u16,
    more: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut raw = Vec::with_capacity(IP_HEADER_LEN + payload.len());
    raw.resize(IP_HEADER_LEN, 0);
    raw[0] = 0x45;
    let total = (IP_HEADER_LEN + payload.len()) as u16;
    raw[2..4].copy_from_slice(&total.to_be_bytes());
    raw[4..6].copy_from_slice(&id.to_be_bytes());
    let mut flags_frag = offset_bytes / 8;
    if more {
        flags_frag |= 0x2000;
    }
    raw[6..8].copy_from_slice(&flags_frag.to_be_bytes());
    raw[8] = 64;
    raw[9] = protocol;
    raw[12..16].copy_from_slice(&src);
    raw[16..20].copy_from_slice(&dst);
    let csum = checksum(&raw[..IP_HEADER_LEN]);
    raw[10..12].copy_from_slice(&csum.to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

fn rx_on_loopback(bytes: &[u8]) {
    let mut msg = NetMsg::from_bytes(bytes);
    msg.dev = Some(DevIndex(0));
    ipv4::ip_rx_msg(msg);
}

pub fn test_tx_fragmentation_sizes_and_flags() -> TestResult {
    // A 2000-byte payload over MTU 1500 with DF clear must yield two
    // fragments of 1480 and 520 data bytes, one shared ID, MF {1, 0},
    // offsets {0, 1480}.
    let (nic, dev_index) = capture_nic(1500, [192, 168, 5, 1], [192, 168, 5, 0]);

    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_UDP;
    msg.dst = Ipv4Addr([192, 168, 5, 2]);
    let payload = alloc::vec![0xA5u8; 2000];
    msg.append(&payload);
    assert_ok!(ipv4::ip_tx_msg(msg));

    let frames = nic.take_frames();
    assert_eq_test!(frames.len(), 2, "two fragments on the wire");

    let first = assert_ok!(IpHeader::parse(&frames[0]));
    let second = assert_ok!(IpHeader::parse(&frames[1]));

    assert_eq_test!(frames[0].len() - IP_HEADER_LEN, 1480, "first carries 1480 bytes");
    assert_eq_test!(frames[1].len() - IP_HEADER_LEN, 520, "second carries 520 bytes");
    assert_eq_test!(first.id, second.id, "fragments share the datagram ID");
    assert_test!(first.id != 0, "fragmenting burned a fresh ID");
    assert_test!(first.more_fragments, "first has MF set");
    assert_test!(!second.more_fragments, "last clears MF");
    assert_eq_test!(first.frag_offset, 0u16, "first at offset 0");
    assert_eq_test!(second.frag_offset, 1480u16, "second at offset 1480 (185 * 8)");

    route::purge(dev_index);
    pass!()
}

pub fn test_tx_df_rejects_oversize() -> TestResult {
    let (nic, dev_index) = capture_nic(1500, [192, 168, 6, 1], [192, 168, 6, 0]);

    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_UDP;
    msg.dst = Ipv4Addr([192, 168, 6, 2]);
    msg.dont_fragment = true;
    msg.append(&alloc::vec![0u8; 2000]);

    let result = ipv4::ip_tx_msg(msg);
    assert_test!(result.is_err(), "DF with payload over MTU fails");
    assert_eq_test!(nic.take_frames().len(), 0, "nothing was transmitted");

    route::purge(dev_index);
    pass!()
}

pub fn test_tx_small_payload_single_datagram() -> TestResult {
    let (nic, dev_index) = capture_nic(1500, [192, 168, 7, 1], [192, 168, 7, 0]);

    let mut msg = NetMsg::new();
    msg.protocol = IPPROTO_UDP;
    msg.dst = Ipv4Addr([192, 168, 7, 2]);
    msg.append(b"small payload");
    assert_ok!(ipv4::ip_tx_msg(msg));

    let frames = nic.take_frames();
    assert_eq_test!(frames.len(), 1, "one datagram");
    let header = assert_ok!(IpHeader::parse(&frames[0]));
    assert_eq_test!(header.id, 0u16, "no ID burned without fragmentation");
    assert_test!(!header.more_fragments, "MF clear");
    assert_eq_test!(
        header.src,
        Ipv4Addr([192, 168, 7, 1]),
        "source filled from the egress interface"
    );
    assert_eq_test!(&frames[0][IP_HEADER_LEN..], b"small payload", "payload intact");

    route::purge(dev_index);
    pass!()
}

pub fn test_reassembly_out_of_order() -> TestResult {
    // 1490 bytes of ICMP-protocol payload in two fragments delivered
    // second-first: the reassembled datagram must reach the raw layer
    // exactly once, intact.
    let raw_sock = match socket::sock_create(cinder_abi::net::SOCK_RAW, 253) {
        Ok(h) => h,
        Err(_) => return fail!("no raw socket"),
    };

    let mut payload = [0u8; 1490];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let src = [10, 9, 9, 9];
    let dst = [127, 0, 0, 1];
    let frag1 = make_fragment(src, dst, 777, 253, 0, true, &payload[..1480]);
    let frag2 = make_fragment(src, dst, 777, 253, 1480, false, &payload[1480..]);

    // Second fragment first.
    rx_on_loopback(&frag2);
    assert_eq_test!(ipv4::reassembly_pending(), 1, "context open after first arrival");
    rx_on_loopback(&frag1);
    assert_eq_test!(ipv4::reassembly_pending(), 0, "context closed on completion");

    let mut buf = [0u8; 2048];
    let (n, _) = match socket::sock_recvfrom(raw_sock, &mut buf, true) {
        Ok(r) => r,
        Err(e) => {
            socket::sock_close(raw_sock);
            return fail!("raw recv failed: {:?}", e);
        }
    };
    assert_eq_test!(n, IP_HEADER_LEN + 1490, "raw datagram includes the IP header");
    assert_test!(
        buf[IP_HEADER_LEN..n] == payload[..],
        "reassembled payload matches the original byte string"
    );

    // Dispatched exactly once.
    let again = socket::sock_recvfrom(raw_sock, &mut buf, true);
    assert_test!(again.is_err(), "no duplicate delivery");

    socket::sock_close(raw_sock);
    pass!()
}

pub fn test_reassembly_overlap_first_arrival_wins() -> TestResult {
    let raw_sock = match socket::sock_create(cinder_abi::net::SOCK_RAW, 252) {
        Ok(h) => h,
        Err(_) => return fail!("no raw socket"),
    };
    let src = [10, 9, 9, 8];
    let dst = [127, 0, 0, 1];

    // First arrival covers 0..16 with 0x11; the overlapping later
    // arrival (8..24, 0x22) may only contribute its tail.
    let frag_a = make_fragment(src, dst, 900, 252, 0, true, &[0x11u8; 16]);
    let frag_b = make_fragment(src, dst, 900, 252, 8, false, &[0x22u8; 16]);
    rx_on_loopback(&frag_a);
    rx_on_loopback(&frag_b);

    let mut buf = [0u8; 256];
    let (n, _) = match socket::sock_recvfrom(raw_sock, &mut buf, true) {
        Ok(r) => r,
        Err(e) => {
            socket::sock_close(raw_sock);
            return fail!("raw recv failed: {:?}", e);
        }
    };
    assert_eq_test!(n, IP_HEADER_LEN + 24, "24 payload bytes reassembled");
    let body = &buf[IP_HEADER_LEN..n];
    assert_test!(body[..16].iter().all(|&b| b == 0x11), "first arrival kept");
    assert_test!(body[16..].iter().all(|&b| b == 0x22), "later tail appended");

    socket::sock_close(raw_sock);
    pass!()
}

pub fn test_reassembly_timeout_drops_context() -> TestResult {
    let src = [10, 9, 9, 7];
    let dst = [127, 0, 0, 1];
    let frag = make_fragment(src, dst, 901, 251, 0, true, &[1u8; 64]);
    rx_on_loopback(&frag);
    assert_test!(ipv4::reassembly_pending() > 0, "context waiting for the tail");

    // Well past the inactivity budget.
    let now = cinder_lib::clock::uptime_ticks() + ipv4::REASSEMBLY_TIMEOUT_TICKS + 1;
    ipv4::reassembly_expire(now);
    assert_eq_test!(ipv4::reassembly_pending(), 0, "idle context expired");
    pass!()
}

pub fn test_loopback_roundtrip_preserves_bytes() -> TestResult {
    // ip_tx -> loopback -> ip_rx with a raw observer: the byte string
    // survives the trip.
    let raw_sock = match socket::sock_create(cinder_abi::net::SOCK_RAW, 250) {
        Ok(h) => h,
        Err(_) => return fail!("no raw socket"),
    };

    let mut msg = NetMsg::new();
    msg.protocol = 250;
    msg.dst = Ipv4Addr::LOCALHOST;
    msg.append(b"round trip payload");
    msg.mark_l4();
    assert_ok!(ipv4::ip_tx_msg(msg));

    let mut buf = [0u8; 256];
    let (n, _) = match socket::sock_recvfrom(raw_sock, &mut buf, true) {
        Ok(r) => r,
        Err(e) => {
            socket::sock_close(raw_sock);
            return fail!("nothing came back: {:?}", e);
        }
    };
    assert_eq_test!(
        &buf[IP_HEADER_LEN..n],
        b"round trip payload",
        "payload identical after tx/rx"
    );

    socket::sock_close(raw_sock);
    pass!()
}

pub fn test_rx_rejects_bad_checksum_and_wrong_host() -> TestResult {
    let raw_sock = match socket::sock_create(cinder_abi::net::SOCK_RAW, 249) {
        Ok(h) => h,
        Err(_) => return fail!("no raw socket"),
    };

    // Corrupted checksum.
    let mut bad = make_fragment([10, 1, 1, 1], [127, 0, 0, 1], 0, 249, 0, false, b"data");
    bad[10] ^= 0xFF;
    rx_on_loopback(&bad);

    // Wrong destination for the receiving interface (strong host model).
    let misdelivered = make_fragment([10, 1, 1, 1], [10, 99, 99, 99], 0, 249, 0, false, b"data");
    rx_on_loopback(&misdelivered);

    let mut buf = [0u8; 64];
    assert_test!(
        socket::sock_recvfrom(raw_sock, &mut buf, true).is_err(),
        "neither packet was delivered"
    );
    socket::sock_close(raw_sock);
    pass!()
}

cinder_lib::define_test_suite!(
    net_ipv4,
    [
        test_tx_fragmentation_sizes_and_flags,
        test_tx_df_rejects_oversize,
        test_tx_small_payload_single_datagram,
        test_reassembly_out_of_order,
        test_reassembly_overlap_first_arrival_wins,
        test_reassembly_timeout_drops_context,
        test_loopback_roundtrip_preserves_bytes,
        test_rx_rejects_bad_checksum_and_wrong_host,
    ]
);
