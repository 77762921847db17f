//! TCP tests over the loopback device. Transmit re-enters the receive
//! path synchronously, so the three-way handshake completes within the
//! `connect` call and no timer machinery is needed.

use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_test, fail, pass};

use crate::tcp::{self, TcpState};
use crate::types::{Endpoint, Ipv4Addr, NetError, Port};

fn ep(port: u16) -> Endpoint {
    Endpoint {
        addr: Ipv4Addr::LOCALHOST,
        port: Port(port),
    }
}

pub fn test_tcp_handshake_over_loopback() -> TestResult {
    let listener = match tcp::conn_listen(ep(6001), 4) {
        Ok(l) => l,
        Err(e) => return fail!("listen failed: {:?}", e),
    };

    let client = match tcp::conn_connect(ep(6101), ep(6001)) {
        Ok(c) => c,
        Err(e) => {
            tcp::conn_close(listener);
            return fail!("connect failed: {:?}", e);
        }
    };
    assert_eq_test!(
        tcp::conn_state(client),
        Some(TcpState::Established),
        "client established after the synchronous handshake"
    );

    let server = match tcp::conn_accept(listener, true) {
        Ok(s) => s,
        Err(e) => {
            tcp::conn_close(client);
            tcp::conn_close(listener);
            return fail!("accept failed: {:?}", e);
        }
    };
    assert_eq_test!(
        tcp::conn_state(server),
        Some(TcpState::Established),
        "server side established"
    );
    assert_eq_test!(
        tcp::conn_remote(server),
        Some(ep(6101)),
        "server sees the client endpoint"
    );

    tcp::conn_close(client);
    tcp::conn_close(server);
    tcp::conn_close(listener);
    tcp::clear_for_tests();
    pass!()
}

pub fn test_tcp_data_both_directions() -> TestResult {
    let listener = match tcp::conn_listen(ep(6002), 4) {
        Ok(l) => l,
        Err(e) => return fail!("listen failed: {:?}", e),
    };
    let client = match tcp::conn_connect(ep(6102), ep(6002)) {
        Ok(c) => c,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("connect failed: {:?}", e);
        }
    };
    let server = match tcp::conn_accept(listener, true) {
        Ok(s) => s,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("accept failed: {:?}", e);
        }
    };

    // Client to server.
    if let Err(e) = tcp::conn_send(client, b"hello server") {
        tcp::clear_for_tests();
        return fail!("send failed: {:?}", e);
    }
    let mut buf = [0u8; 64];
    let n = tcp::conn_recv(server, &mut buf, true).unwrap_or(0);
    assert_eq_test!(&buf[..n], b"hello server", "server received the stream bytes");

    // Server to client.
    if let Err(e) = tcp::conn_send(server, b"hello client") {
        tcp::clear_for_tests();
        return fail!("reply failed: {:?}", e);
    }
    let n = tcp::conn_recv(client, &mut buf, true).unwrap_or(0);
    assert_eq_test!(&buf[..n], b"hello client", "client received the reply");

    tcp::clear_for_tests();
    pass!()
}

pub fn test_tcp_connect_refused_without_listener() -> TestResult {
    let result = tcp::conn_connect(ep(6103), ep(6999));
    assert_eq_test!(
        result.err(),
        Some(NetError::ConnectionRefused),
        "RST answers a SYN to a dead port"
    );
    tcp::clear_for_tests();
    pass!()
}

pub fn test_tcp_close_delivers_eof() -> TestResult {
    let listener = match tcp::conn_listen(ep(6004), 4) {
        Ok(l) => l,
        Err(e) => return fail!("listen failed: {:?}", e),
    };
    let client = match tcp::conn_connect(ep(6104), ep(6004)) {
        Ok(c) => c,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("connect failed: {:?}", e);
        }
    };
    let server = match tcp::conn_accept(listener, true) {
        Ok(s) => s,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("accept failed: {:?}", e);
        }
    };

    let _ = tcp::conn_send(client, b"last words");
    tcp::conn_close(client);

    // The data arrives first, then the end-of-stream marker.
    let mut buf = [0u8; 32];
    let n = tcp::conn_recv(server, &mut buf, true).unwrap_or(0);
    assert_eq_test!(&buf[..n], b"last words", "data before EOF");
    let n = tcp::conn_recv(server, &mut buf, true).unwrap_or(99);
    assert_eq_test!(n, 0, "EOF after the peer's FIN");

    tcp::clear_for_tests();
    pass!()
}

pub fn test_tcp_full_close_reaches_time_wait() -> TestResult {
    let listener = match tcp::conn_listen(ep(6005), 4) {
        Ok(l) => l,
        Err(e) => return fail!("listen failed: {:?}", e),
    };
    let client = match tcp::conn_connect(ep(6105), ep(6005)) {
        Ok(c) => c,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("connect failed: {:?}", e);
        }
    };
    let server = match tcp::conn_accept(listener, true) {
        Ok(s) => s,
        Err(e) => {
            tcp::clear_for_tests();
            return fail!("accept failed: {:?}", e);
        }
    };

    // Active close from the client, passive close from the server.
    tcp::conn_close(client);
    assert_eq_test!(
        tcp::conn_state(server),
        Some(TcpState::CloseWait),
        "server sees the FIN"
    );
    tcp::conn_close(server);

    // The server's FIN+ACK round trips synchronously; the active closer
    // parks in TIME_WAIT and the passive side is gone.
    assert_eq_test!(
        tcp::conn_state(client),
        Some(TcpState::TimeWait),
        "active closer in TIME_WAIT"
    );
    assert_test!(
        tcp::conn_state(server).is_none(),
        "passive closer fully closed after its FIN is ACKed"
    );

    tcp::clear_for_tests();
    pass!()
}

pub fn test_tcp_listen_port_collision() -> TestResult {
    let first = match tcp::conn_listen(ep(6006), 2) {
        Ok(l) => l,
        Err(e) => return fail!("listen failed: {:?}", e),
    };
    let second = tcp::conn_listen(ep(6006), 2);
    assert_eq_test!(
        second.err(),
        Some(NetError::AddressInUse),
        "second listener on the port rejected"
    );
    tcp::conn_close(first);
    tcp::clear_for_tests();
    pass!()
}

cinder_lib::define_test_suite!(
    net_tcp,
    [
        test_tcp_handshake_over_loopback,
        test_tcp_data_both_directions,
        test_tcp_connect_refused_without_listener,
        test_tcp_close_delivers_eof,
        test_tcp_full_close_reaches_time_wait,
        test_tcp_listen_port_collision,
    ]
);
