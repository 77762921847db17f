//! Routing table tests.

use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_test, pass};

use crate::route::{self, RouteEntry, RouteFlags};
use crate::types::{DevIndex, Ipv4Addr};

/// Reset to just the loopback route between tests.
fn fresh_table() {
    route::clear_for_tests();
    route::add_route(RouteEntry {
        dest: Ipv4Addr([127, 0, 0, 0]),
        netmask: Ipv4Addr([255, 0, 0, 0]),
        gateway: Ipv4Addr::UNSPECIFIED,
        dev: DevIndex(0),
        flags: RouteFlags::UP,
    });
}

fn connected(dest: [u8; 4], mask: [u8; 4], dev: usize) -> RouteEntry {
    RouteEntry {
        dest: Ipv4Addr(dest),
        netmask: Ipv4Addr(mask),
        gateway: Ipv4Addr::UNSPECIFIED,
        dev: DevIndex(dev),
        flags: RouteFlags::UP,
    }
}

fn via_gateway(dest: [u8; 4], mask: [u8; 4], gw: [u8; 4], dev: usize) -> RouteEntry {
    RouteEntry {
        dest: Ipv4Addr(dest),
        netmask: Ipv4Addr(mask),
        gateway: Ipv4Addr(gw),
        dev: DevIndex(dev),
        flags: RouteFlags::UP | RouteFlags::GW,
    }
}

pub fn test_route_connected_next_hop_is_destination() -> TestResult {
    fresh_table();
    route::add_route(connected([10, 0, 0, 0], [255, 255, 255, 0], 1));

    let (dev, next_hop) = match route::get_route(None, Ipv4Addr([10, 0, 0, 42])) {
        Some(r) => r,
        None => return cinder_lib::fail!("no route"),
    };
    assert_eq_test!(dev, DevIndex(1), "connected route picks its device");
    assert_eq_test!(
        next_hop,
        Ipv4Addr([10, 0, 0, 42]),
        "GW clear: next hop is the destination itself"
    );
    fresh_table();
    pass!()
}

pub fn test_route_gateway_next_hop() -> TestResult {
    fresh_table();
    route::add_route(via_gateway([0, 0, 0, 0], [0, 0, 0, 0], [10, 0, 0, 1], 1));

    let (_, next_hop) = match route::get_route(None, Ipv4Addr([8, 8, 8, 8])) {
        Some(r) => r,
        None => return cinder_lib::fail!("no default route"),
    };
    assert_eq_test!(next_hop, Ipv4Addr([10, 0, 0, 1]), "GW set: next hop is the gateway");
    fresh_table();
    pass!()
}

pub fn test_route_longest_prefix_wins() -> TestResult {
    fresh_table();
    route::add_route(connected([10, 0, 0, 0], [255, 0, 0, 0], 1));
    route::add_route(connected([10, 1, 0, 0], [255, 255, 0, 0], 2));
    route::add_route(connected([10, 1, 2, 0], [255, 255, 255, 0], 3));

    let (dev, _) = route::get_route(None, Ipv4Addr([10, 1, 2, 9])).unwrap();
    assert_eq_test!(dev, DevIndex(3), "/24 beats /16 and /8");

    let (dev, _) = route::get_route(None, Ipv4Addr([10, 1, 9, 9])).unwrap();
    assert_eq_test!(dev, DevIndex(2), "/16 beats /8");

    let (dev, _) = route::get_route(None, Ipv4Addr([10, 9, 9, 9])).unwrap();
    assert_eq_test!(dev, DevIndex(1), "/8 catches the rest");

    fresh_table();
    pass!()
}

pub fn test_route_tie_broken_by_insertion_order() -> TestResult {
    fresh_table();
    route::add_route(connected([192, 168, 1, 0], [255, 255, 255, 0], 1));
    route::add_route(connected([192, 168, 1, 0], [255, 255, 255, 0], 2));

    let (dev, _) = route::get_route(None, Ipv4Addr([192, 168, 1, 7])).unwrap();
    assert_eq_test!(dev, DevIndex(1), "earlier route wins the tie");
    fresh_table();
    pass!()
}

pub fn test_route_source_constraint() -> TestResult {
    fresh_table();
    // Device 0 is loopback and owns 127.0.0.1; a constrained lookup with
    // a source it does not own must skip its routes.
    route::add_route(connected([9, 9, 9, 0], [255, 255, 255, 0], 0));

    let unconstrained = route::get_route(None, Ipv4Addr([9, 9, 9, 1]));
    assert_test!(unconstrained.is_some(), "route exists unconstrained");

    let mismatched = route::get_route(Some(Ipv4Addr([10, 0, 0, 5])), Ipv4Addr([9, 9, 9, 1]));
    assert_test!(mismatched.is_none(), "source not owned by the device: no route");

    let owned = route::get_route(Some(Ipv4Addr::LOCALHOST), Ipv4Addr([9, 9, 9, 1]));
    assert_test!(owned.is_some(), "loopback owns 127.0.0.1");

    fresh_table();
    pass!()
}

pub fn test_route_purge_device() -> TestResult {
    fresh_table();
    route::add_route(connected([10, 0, 0, 0], [255, 255, 255, 0], 5));
    route::add_route(via_gateway([0, 0, 0, 0], [0, 0, 0, 0], [10, 0, 0, 1], 5));
    let before = route::route_count();

    route::purge(DevIndex(5));
    assert_eq_test!(route::route_count(), before - 2, "both device routes gone");
    assert_test!(
        route::get_route(None, Ipv4Addr([10, 0, 0, 9])).is_none(),
        "no path after purge"
    );
    fresh_table();
    pass!()
}

pub fn test_route_del_route() -> TestResult {
    fresh_table();
    route::add_route(connected([172, 16, 0, 0], [255, 255, 0, 0], 1));
    assert_test!(
        route::del_route(Ipv4Addr([172, 16, 0, 0]), Ipv4Addr([255, 255, 0, 0])),
        "del_route finds the entry"
    );
    assert_test!(
        route::get_route(None, Ipv4Addr([172, 16, 3, 4])).is_none(),
        "entry gone"
    );
    fresh_table();
    pass!()
}

pub fn test_neighbor_cache_interface() -> TestResult {
    use crate::neighbor;
    use crate::types::MacAddr;

    let dev = DevIndex(4);
    let ip = Ipv4Addr([10, 0, 0, 77]);
    let mac = MacAddr([2, 0, 0, 0, 0, 7]);

    neighbor::neighbor_add(dev, ip, mac);
    assert_eq_test!(neighbor::neighbor_lookup(dev, ip), Some(mac), "lookup hit");
    assert_eq_test!(
        neighbor::neighbor_lookup(DevIndex(9), ip),
        None,
        "per-device scoping"
    );

    neighbor::neighbor_purge(dev);
    assert_eq_test!(neighbor::neighbor_lookup(dev, ip), None, "purge clears the device");
    pass!()
}

cinder_lib::define_test_suite!(
    net_route,
    [
        test_route_connected_next_hop_is_destination,
        test_route_gateway_next_hop,
        test_route_longest_prefix_wins,
        test_route_tie_broken_by_insertion_order,
        test_route_source_constraint,
        test_route_purge_device,
        test_route_del_route,
        test_neighbor_cache_interface,
    ]
);
