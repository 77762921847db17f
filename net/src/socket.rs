//! Sockets: the descriptor-facing multiplexer over raw IP, UDP, and TCP.
//!
//! Sockets live in their own table and appear to processes as external
//! descriptors registered with the file layer. Datagram sockets (raw,
//! UDP) carry a receive queue of complete messages; a short read consumes
//! the whole datagram and discards the tail. TCP sockets delegate to the
//! connection table.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use cinder_abi::error::{KernelError, syscall_ret};
use cinder_abi::fs::OpenFlags;
use cinder_abi::net::{AF_INET, IPPROTO_ICMP, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM, SockAddrIn};
use cinder_abi::syscall as sysno;
use cinder_abi::addr::VirtAddr;
use cinder_core::process;
use cinder_core::sched::switch::UserFrame;
use cinder_core::syscall::{args, register_syscall};
use cinder_fs::file_table::{self, ExternalOps};
use cinder_lib::{CondVar, IrqMutex, clock};
use cinder_mm::user_buffer;

use super::tcp;
use super::types::{Endpoint, Ipv4Addr, NetError, NetResult, Port};
use super::udp;

pub const MAX_SOCKETS: usize = 64;
/// Queued datagrams per socket before the oldest is dropped.
const MAX_QUEUED: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SockProto {
    /// Raw IP access for one protocol number; datagrams include the IP
    /// header.
    Raw(u8),
    Udp,
    Tcp,
}

struct Datagram {
    src: Endpoint,
    data: Vec<u8>,
}

pub struct Socket {
    proto: SockProto,
    local: Endpoint,
    remote: Endpoint,
    bound: bool,
    connected: bool,
    listening: bool,
    recv_queue: VecDeque<Datagram>,
    /// TCP connection slot once connected/accepted.
    tcp_conn: Option<usize>,
    nonblock: bool,
    /// SO_RCVTIMEO in ticks; 0 means forever.
    recv_timeout: u64,
}

impl Socket {
    fn new(proto: SockProto) -> Self {
        Self {
            proto,
            local: Endpoint::UNSPECIFIED,
            remote: Endpoint::UNSPECIFIED,
            bound: false,
            connected: false,
            listening: false,
            recv_queue: VecDeque::new(),
            tcp_conn: None,
            nonblock: false,
            recv_timeout: 0,
        }
    }
}

type SocketTable = [Option<Socket>; MAX_SOCKETS];

static SOCKETS: IrqMutex<SocketTable> = IrqMutex::new([const { None }; MAX_SOCKETS]);

/// Select/recv waiters; broadcast on every delivery.
static NET_EVENT: CondVar = CondVar::new();

/// Descriptor class id assigned by the file layer at init.
static SOCKET_CLASS: AtomicU8 = AtomicU8::new(u8::MAX);

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(49152);

fn ephemeral_port() -> Port {
    let raw = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed);
    Port(if raw < 49152 { 49152 } else { raw })
}

/// Wake select/recv waiters (also used by TCP on state changes).
pub fn net_event_broadcast() {
    NET_EVENT.broadcast();
}

// =============================================================================
// Delivery from the protocol layers
// =============================================================================

/// Hand a complete datagram (IP header included) to every matching raw
/// socket.
pub fn raw_deliver(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) {
    let mut delivered = false;
    {
        let mut table = SOCKETS.lock();
        for socket in table.iter_mut().flatten() {
            let SockProto::Raw(proto) = socket.proto else {
                continue;
            };
            if proto != protocol {
                continue;
            }
            if !socket.local.addr.is_unspecified() && socket.local.addr != dst {
                continue;
            }
            if socket.recv_queue.len() >= MAX_QUEUED {
                socket.recv_queue.pop_front();
            }
            socket.recv_queue.push_back(Datagram {
                src: Endpoint {
                    addr: src,
                    port: Port(0),
                },
                data: datagram.to_vec(),
            });
            delivered = true;
        }
    }
    if delivered {
        net_event_broadcast();
    }
}

/// Demultiplex one UDP payload. Exact (connected) matches beat wildcard
/// binds. Returns `false` when no socket wanted it.
pub fn udp_deliver(src: Endpoint, dst: Endpoint, payload: &[u8]) -> bool {
    let mut best: Option<usize> = None;
    let best_exact = false;
    {
        let table = SOCKETS.lock();
        for (index, socket) in table.iter().enumerate() {
            let Some(socket) = socket else { continue };
            if socket.proto != SockProto::Udp || !socket.bound {
                continue;
            }
            if socket.local.port != dst.port {
                continue;
            }
            if !socket.local.addr.is_unspecified() && socket.local.addr != dst.addr {
                continue;
            }
            let exact = socket.connected && socket.remote == src;
            if socket.connected && !exact {
                continue; // connected elsewhere
            }
            if exact {
                best = Some(index);
                break;
            }
            if !best_exact && best.is_none() {
                best = Some(index);
            }
        }
    }

    let Some(index) = best else {
        return false;
    };
    let mut table = SOCKETS.lock();
    if let Some(socket) = table[index].as_mut() {
        if socket.recv_queue.len() >= MAX_QUEUED {
            socket.recv_queue.pop_front();
        }
        socket.recv_queue.push_back(Datagram {
            src,
            data: payload.to_vec(),
        });
    }
    drop(table);
    net_event_broadcast();
    true
}

// =============================================================================
// Socket operations
// =============================================================================

pub fn sock_create(sock_type: u32, protocol: u8) -> NetResult<u32> {
    let proto = match sock_type {
        SOCK_STREAM => SockProto::Tcp,
        SOCK_DGRAM => SockProto::Udp,
        SOCK_RAW => SockProto::Raw(if protocol == 0 { IPPROTO_ICMP } else { protocol }),
        _ => return Err(NetError::NotSupported),
    };
    let mut table = SOCKETS.lock();
    let slot = table
        .iter()
        .position(|s| s.is_none())
        .ok_or(NetError::NoResources)?;
    table[slot] = Some(Socket::new(proto));
    Ok(slot as u32)
}

fn with_socket<R>(handle: u32, f: impl FnOnce(&mut Socket) -> NetResult<R>) -> NetResult<R> {
    let mut table = SOCKETS.lock();
    let socket = table
        .get_mut(handle as usize)
        .and_then(|s| s.as_mut())
        .ok_or(NetError::BadDescriptor)?;
    f(socket)
}

pub fn sock_bind(handle: u32, local: Endpoint) -> NetResult<()> {
    // Port collision check across sockets of the same protocol.
    {
        let table = SOCKETS.lock();
        for (index, socket) in table.iter().enumerate() {
            let Some(socket) = socket else { continue };
            if index as u32 != handle
                && socket.bound
                && socket.local.port == local.port
                && core::mem::discriminant(&socket.proto)
                    == core::mem::discriminant(&with_proto(&table, handle)?)
                && local.port != Port(0)
            {
                return Err(NetError::AddressInUse);
            }
        }
    }
    with_socket(handle, |socket| {
        if socket.bound {
            return Err(NetError::InvalidArgument);
        }
        socket.local = if local.port == Port(0) {
            Endpoint {
                addr: local.addr,
                port: ephemeral_port(),
            }
        } else {
            local
        };
        socket.bound = true;
        Ok(())
    })
}

fn with_proto(table: &SocketTable, handle: u32) -> NetResult<SockProto> {
    table
        .get(handle as usize)
        .and_then(|s| s.as_ref())
        .map(|s| s.proto)
        .ok_or(NetError::BadDescriptor)
}

pub fn sock_connect(handle: u32, remote: Endpoint) -> NetResult<()> {
    let (proto, local, connected) = with_socket(handle, |socket| {
        if !socket.bound {
            socket.local = Endpoint {
                addr: Ipv4Addr::UNSPECIFIED,
                port: ephemeral_port(),
            };
            socket.bound = true;
        }
        Ok((socket.proto, socket.local, socket.connected))
    })?;
    if connected {
        return Err(NetError::AlreadyConnected);
    }

    match proto {
        SockProto::Udp | SockProto::Raw(_) => with_socket(handle, |socket| {
            socket.remote = remote;
            socket.connected = true;
            Ok(())
        }),
        SockProto::Tcp => {
            let conn = tcp::conn_connect(local, remote)?;
            with_socket(handle, |socket| {
                socket.remote = remote;
                socket.connected = true;
                socket.tcp_conn = Some(conn);
                Ok(())
            })
        }
    }
}

pub fn sock_listen(handle: u32, backlog: usize) -> NetResult<()> {
    let local = with_socket(handle, |socket| {
        if socket.proto != SockProto::Tcp {
            return Err(NetError::NotSupported);
        }
        if !socket.bound {
            return Err(NetError::InvalidArgument);
        }
        Ok(socket.local)
    })?;
    let conn = tcp::conn_listen(local, backlog)?;
    with_socket(handle, |socket| {
        socket.listening = true;
        socket.tcp_conn = Some(conn);
        Ok(())
    })
}

/// Accept one connection; returns a fresh socket handle and the peer.
pub fn sock_accept(handle: u32) -> NetResult<(u32, Endpoint)> {
    let (listen_conn, nonblock, local) = with_socket(handle, |socket| {
        if !socket.listening {
            return Err(NetError::InvalidArgument);
        }
        Ok((
            socket.tcp_conn.ok_or(NetError::InvalidArgument)?,
            socket.nonblock,
            socket.local,
        ))
    })?;

    let child_conn = tcp::conn_accept(listen_conn, nonblock)?;
    let remote = tcp::conn_remote(child_conn).unwrap_or(Endpoint::UNSPECIFIED);

    let mut table = SOCKETS.lock();
    let slot = table
        .iter()
        .position(|s| s.is_none())
        .ok_or(NetError::NoResources)?;
    let mut socket = Socket::new(SockProto::Tcp);
    socket.local = local;
    socket.remote = remote;
    socket.bound = true;
    socket.connected = true;
    socket.tcp_conn = Some(child_conn);
    table[slot] = Some(socket);
    Ok((slot as u32, remote))
}

/// sendto / send.
pub fn sock_sendto(handle: u32, data: &[u8], dst: Option<Endpoint>) -> NetResult<usize> {
    let (proto, local, remote, connected, conn) = with_socket(handle, |socket| {
        if !socket.bound && dst.is_some() {
            socket.local = Endpoint {
                addr: Ipv4Addr::UNSPECIFIED,
                port: ephemeral_port(),
            };
            socket.bound = true;
        }
        Ok((
            socket.proto,
            socket.local,
            socket.remote,
            socket.connected,
            socket.tcp_conn,
        ))
    })?;

    match proto {
        SockProto::Udp => {
            let dst = dst.or(if connected { Some(remote) } else { None })
                .ok_or(NetError::NotConnected)?;
            udp::udp_tx(local, dst, data)?;
            Ok(data.len())
        }
        SockProto::Raw(protocol) => {
            let dst = dst.or(if connected { Some(remote) } else { None })
                .ok_or(NetError::NotConnected)?;
            let mut msg = super::netmsg::NetMsg::new();
            msg.protocol = protocol;
            msg.dst = dst.addr;
            msg.append(data);
            msg.mark_l4();
            super::ipv4::ip_tx_msg(msg)?;
            Ok(data.len())
        }
        SockProto::Tcp => {
            let conn = conn.ok_or(NetError::NotConnected)?;
            tcp::conn_send(conn, data)
        }
    }
}

/// recvfrom / recv. Datagram sockets hand out one message per call and
/// discard whatever does not fit; TCP streams bytes.
pub fn sock_recvfrom(
    handle: u32,
    buf: &mut [u8],
    nonblock_override: bool,
) -> NetResult<(usize, Endpoint)> {
    // TCP path short-circuits to the connection.
    let (proto, conn, nonblock, timeout) = with_socket(handle, |socket| {
        Ok((
            socket.proto,
            socket.tcp_conn,
            socket.nonblock,
            socket.recv_timeout,
        ))
    })?;
    let nonblock = nonblock || nonblock_override;

    if proto == SockProto::Tcp {
        let conn = conn.ok_or(NetError::NotConnected)?;
        let n = tcp::conn_recv(conn, buf, nonblock)?;
        let remote = tcp::conn_remote(conn).unwrap_or(Endpoint::UNSPECIFIED);
        return Ok((n, remote));
    }

    let deadline = if timeout > 0 {
        Some(clock::uptime_ticks() + timeout)
    } else {
        None
    };

    let mut table = SOCKETS.lock();
    loop {
        let socket = table
            .get_mut(handle as usize)
            .and_then(|s| s.as_mut())
            .ok_or(NetError::BadDescriptor)?;
        if let Some(datagram) = socket.recv_queue.pop_front() {
            let n = buf.len().min(datagram.data.len());
            buf[..n].copy_from_slice(&datagram.data[..n]);
            // The rest of the datagram is discarded, as datagram
            // semantics demand.
            return Ok((n, datagram.src));
        }
        if nonblock {
            return Err(NetError::WouldBlock);
        }

        let wait = match deadline {
            Some(d) => {
                let now = clock::uptime_ticks();
                if now >= d {
                    return Err(NetError::TimedOut);
                }
                d - now
            }
            None => 0,
        };
        let result = if wait > 0 {
            NET_EVENT.wait_timed(table, wait)
        } else {
            NET_EVENT.wait_intr(table)
        };
        match result {
            Ok(guard) => table = guard,
            Err((_, KernelError::TimedOut)) => return Err(NetError::TimedOut),
            Err((_, _)) => return Err(NetError::Interrupted),
        }
    }
}

pub fn sock_close(handle: u32) {
    let conn = {
        let mut table = SOCKETS.lock();
        match table.get_mut(handle as usize).and_then(|s| s.take()) {
            Some(socket) => socket.tcp_conn,
            None => None,
        }
    };
    if let Some(conn) = conn {
        tcp::conn_close(conn);
    }
    net_event_broadcast();
}

/// `true` if a read would not block: data queued, an accept pending, or
/// the stream closed.
pub fn sock_readable(handle: u32) -> bool {
    let table = SOCKETS.lock();
    let Some(socket) = table.get(handle as usize).and_then(|s| s.as_ref()) else {
        return false;
    };
    if !socket.recv_queue.is_empty() {
        return true;
    }
    match socket.tcp_conn {
        Some(conn) => {
            drop(table);
            tcp::conn_readable(conn)
        }
        None => false,
    }
}

pub fn sock_set_nonblock(handle: u32, nonblock: bool) -> NetResult<()> {
    with_socket(handle, |socket| {
        socket.nonblock = nonblock;
        Ok(())
    })
}

pub fn sock_set_recv_timeout(handle: u32, ticks: u64) -> NetResult<()> {
    with_socket(handle, |socket| {
        socket.recv_timeout = ticks;
        Ok(())
    })
}

// =============================================================================
// Descriptor integration and syscalls
// =============================================================================

fn ext_read(handle: u32, buf: &mut [u8], nonblock: bool) -> cinder_fs::VfsResult<usize> {
    match sock_recvfrom(handle, buf, nonblock) {
        Ok((n, _)) => Ok(n),
        Err(NetError::WouldBlock) => Err(cinder_fs::VfsError::WouldBlock),
        Err(NetError::Interrupted) => Err(cinder_fs::VfsError::Interrupted),
        Err(_) => Err(cinder_fs::VfsError::IoError),
    }
}

fn ext_write(handle: u32, buf: &[u8], _nonblock: bool) -> cinder_fs::VfsResult<usize> {
    match sock_sendto(handle, buf, None) {
        Ok(n) => Ok(n),
        Err(NetError::WouldBlock) => Err(cinder_fs::VfsError::WouldBlock),
        Err(_) => Err(cinder_fs::VfsError::IoError),
    }
}

fn ext_close(handle: u32) {
    sock_close(handle);
}

fn ext_poll_readable(handle: u32) -> bool {
    sock_readable(handle)
}

fn socket_class() -> u8 {
    SOCKET_CLASS.load(Ordering::Acquire)
}

fn sockaddr_from_user(ptr: u32) -> Result<Endpoint, KernelError> {
    let ptd = process::addr_space_of(process::current_pid())
        .ok_or(KernelError::NotFound)?
        .ptd();
    let size = core::mem::size_of::<SockAddrIn>();
    user_buffer::validate_buffer(ptd, VirtAddr::new(ptr), size, false)?;
    let mut raw = [0u8; core::mem::size_of::<SockAddrIn>()];
    user_buffer::copy_from_user(ptd, VirtAddr::new(ptr), &mut raw)?;
    // SAFETY: SockAddrIn is plain old data.
    let sa: SockAddrIn = unsafe { core::ptr::read(raw.as_ptr() as *const SockAddrIn) };
    if sa.sin_family != AF_INET {
        return Err(KernelError::Invalid);
    }
    Ok(Endpoint::from_sockaddr(&sa))
}

fn sockaddr_to_user(ptr: u32, endpoint: Endpoint) -> Result<(), KernelError> {
    if ptr == 0 {
        return Ok(());
    }
    let ptd = process::addr_space_of(process::current_pid())
        .ok_or(KernelError::NotFound)?
        .ptd();
    let sa = endpoint.to_sockaddr();
    let size = core::mem::size_of::<SockAddrIn>();
    user_buffer::validate_buffer(ptd, VirtAddr::new(ptr), size, true)?;
    // SAFETY: plain old data out.
    let raw = unsafe { core::slice::from_raw_parts(&sa as *const SockAddrIn as *const u8, size) };
    user_buffer::copy_to_user(ptd, VirtAddr::new(ptr), raw)?;
    Ok(())
}

fn handle_of(fd: u32) -> Result<u32, KernelError> {
    Ok(file_table::file_external_handle(
        process::current_pid(),
        fd as usize,
        socket_class(),
    )?)
}

fn sys_socket(frame: &mut UserFrame) -> i32 {
    let [_domain, sock_type, protocol, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = sock_create(sock_type, protocol as u8)?;
        let fd = file_table::file_open_external(
            process::current_pid(),
            socket_class(),
            handle,
            OpenFlags::RDWR,
        )
        .inspect_err(|_| sock_close(handle))?;
        Ok(fd)
    })();
    syscall_ret(result)
}

fn sys_bind(frame: &mut UserFrame) -> i32 {
    let [fd, addr_ptr, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        let endpoint = sockaddr_from_user(addr_ptr)?;
        sock_bind(handle, endpoint)?;
        Ok(0)
    })();
    syscall_ret(result)
}

fn sys_connect(frame: &mut UserFrame) -> i32 {
    let [fd, addr_ptr, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        let endpoint = sockaddr_from_user(addr_ptr)?;
        sock_connect(handle, endpoint)?;
        Ok(0)
    })();
    syscall_ret(result)
}

fn sys_listen(frame: &mut UserFrame) -> i32 {
    let [fd, backlog, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        sock_listen(handle, backlog as usize)?;
        Ok(0)
    })();
    syscall_ret(result)
}

fn sys_accept(frame: &mut UserFrame) -> i32 {
    let [fd, addr_ptr, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        let (child, remote) = sock_accept(handle)?;
        let new_fd = file_table::file_open_external(
            process::current_pid(),
            socket_class(),
            child,
            OpenFlags::RDWR,
        )
        .inspect_err(|_| sock_close(child))?;
        sockaddr_to_user(addr_ptr, remote)?;
        Ok(new_fd)
    })();
    syscall_ret(result)
}

/// send/recv share the staging pattern of the file layer: bounded kernel
/// buffer, user copies on both sides.
const IO_CHUNK: usize = 1024;

fn sys_send(frame: &mut UserFrame) -> i32 {
    send_common(frame, None)
}

fn sys_sendto(frame: &mut UserFrame) -> i32 {
    let [.., addr_ptr, _] = args(frame);
    let dst = match sockaddr_from_user(addr_ptr) {
        Ok(ep) => Some(ep),
        Err(e) => return e.to_syscall_ret(),
    };
    send_common(frame, dst)
}

fn send_common(frame: &mut UserFrame, dst: Option<Endpoint>) -> i32 {
    let [fd, buf_ptr, len, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        let ptd = process::addr_space_of(process::current_pid())
            .ok_or(KernelError::NotFound)?
            .ptd();
        let len = (len as usize).min(65535);
        user_buffer::validate_buffer(ptd, VirtAddr::new(buf_ptr), len.max(1), false)?;
        let mut staging = alloc::vec![0u8; len.min(IO_CHUNK * 64)];
        user_buffer::copy_from_user(ptd, VirtAddr::new(buf_ptr), &mut staging)?;
        Ok(sock_sendto(handle, &staging, dst)?)
    })();
    syscall_ret(result)
}

fn sys_recv(frame: &mut UserFrame) -> i32 {
    recv_common(frame, 0)
}

fn sys_recvfrom(frame: &mut UserFrame) -> i32 {
    let [.., addr_ptr, _] = args(frame);
    recv_common(frame, addr_ptr)
}

fn recv_common(frame: &mut UserFrame, addr_out: u32) -> i32 {
    let [fd, buf_ptr, len, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        let ptd = process::addr_space_of(process::current_pid())
            .ok_or(KernelError::NotFound)?
            .ptd();
        let len = (len as usize).min(65535);
        user_buffer::validate_buffer(ptd, VirtAddr::new(buf_ptr), len.max(1), true)?;
        let mut staging = alloc::vec![0u8; len];
        let (n, src) = sock_recvfrom(handle, &mut staging, false)?;
        user_buffer::copy_to_user(ptd, VirtAddr::new(buf_ptr), &staging[..n])?;
        sockaddr_to_user(addr_out, src)?;
        Ok(n)
    })();
    syscall_ret(result)
}

/// select(read_fds_ptr, nfds_unused, timeout_ticks): readable means a
/// read would not block. Writable/error sets are out of scope for this
/// core. Interruptible by signals.
fn sys_select(frame: &mut UserFrame) -> i32 {
    let [read_set_ptr, _nfds, timeout_ticks, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let pid = process::current_pid();
        let ptd = process::addr_space_of(pid)
            .ok_or(KernelError::NotFound)?
            .ptd();
        user_buffer::validate_buffer(ptd, VirtAddr::new(read_set_ptr), 4, true)?;
        let mut raw = [0u8; 4];
        user_buffer::copy_from_user(ptd, VirtAddr::new(read_set_ptr), &mut raw)?;
        let requested = u32::from_le_bytes(raw);

        let deadline = if timeout_ticks > 0 {
            Some(clock::uptime_ticks() + timeout_ticks as u64)
        } else {
            None
        };

        loop {
            let mut ready = 0u32;
            let mut count = 0usize;
            for fd in 0..32 {
                if requested & (1 << fd) == 0 {
                    continue;
                }
                if file_table::file_poll_readable(pid, fd).unwrap_or(false) {
                    ready |= 1 << fd;
                    count += 1;
                }
            }
            if count > 0 || requested == 0 {
                user_buffer::copy_to_user(
                    ptd,
                    VirtAddr::new(read_set_ptr),
                    &ready.to_le_bytes(),
                )?;
                return Ok(count);
            }

            // Sleep until the next network event or a short re-poll tick
            // (non-socket descriptors have their own wakeup paths).
            let wait = match deadline {
                Some(d) => {
                    let now = clock::uptime_ticks();
                    if now >= d {
                        user_buffer::copy_to_user(
                            ptd,
                            VirtAddr::new(read_set_ptr),
                            &0u32.to_le_bytes(),
                        )?;
                        return Ok(0);
                    }
                    (d - now).min(2)
                }
                None => 2,
            };
            let table = SOCKETS.lock();
            match NET_EVENT.wait_timed(table, wait) {
                Ok(_) | Err((_, KernelError::TimedOut)) => {}
                Err((_, _)) => return Err(KernelError::Interrupted),
            }
        }
    })();
    syscall_ret(result)
}

fn sys_setsockopt(frame: &mut UserFrame) -> i32 {
    let [fd, _level, optname, optval, ..] = args(frame);
    let result = (|| -> Result<usize, KernelError> {
        let handle = handle_of(fd)?;
        match optname {
            cinder_abi::net::SO_RCVTIMEO => {
                sock_set_recv_timeout(handle, optval as u64)?;
            }
            cinder_abi::net::SO_REUSEADDR => {
                // Accepted and ignored: the bind check already allows
                // rebinding a closed port.
            }
            _ if optname == 1 => {
                sock_set_nonblock(handle, optval != 0)?;
            }
            _ => return Err(KernelError::NotSupported),
        }
        Ok(0)
    })();
    syscall_ret(result)
}

/// Register the descriptor class and the socket syscalls.
pub fn socket_init() {
    let class = file_table::register_external_class(ExternalOps {
        read: ext_read,
        write: ext_write,
        close: ext_close,
        poll_readable: ext_poll_readable,
    })
    .unwrap_or(u8::MAX);
    SOCKET_CLASS.store(class, Ordering::Release);

    register_syscall(sysno::SYS_SOCKET, sys_socket);
    register_syscall(sysno::SYS_BIND, sys_bind);
    register_syscall(sysno::SYS_CONNECT, sys_connect);
    register_syscall(sysno::SYS_LISTEN, sys_listen);
    register_syscall(sysno::SYS_ACCEPT, sys_accept);
    register_syscall(sysno::SYS_SEND, sys_send);
    register_syscall(sysno::SYS_RECV, sys_recv);
    register_syscall(sysno::SYS_SENDTO, sys_sendto);
    register_syscall(sysno::SYS_RECVFROM, sys_recvfrom);
    register_syscall(sysno::SYS_SELECT, sys_select);
    register_syscall(sysno::SYS_SETSOCKOPT, sys_setsockopt);
}
