//! Socket operations. A socket is tracked from a successful `connect`, or
//! from the first connection-less call that names a peer.

use std::ffi::{c_int, c_void};

use libc::{msghdr, size_t, sockaddr, socklen_t, ssize_t};

use super::{account, socket_addr};
use crate::real::real;

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let real_connect = real!(connect(c_int, *const sockaddr, socklen_t) -> c_int);
    let rc = unsafe { real_connect(fd, addr, len) };
    // a non-blocking connect in progress will carry traffic to this peer
    let in_progress =
        rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINPROGRESS);
    if rc == 0 || in_progress {
        // SAFETY: addr/len were accepted by the kernel.
        if let Some(peer) = unsafe { socket_addr(addr, len) } {
            account(|t| t.connected(fd, peer));
        }
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let real_send = real!(send(c_int, *const c_void, size_t, c_int) -> ssize_t);
    let rc = unsafe { real_send(fd, buf, len, flags) };
    if rc > 0 {
        account(|t| t.wrote(fd, rc as usize));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let real_recv = real!(recv(c_int, *mut c_void, size_t, c_int) -> ssize_t);
    let rc = unsafe { real_recv(fd, buf, len, flags) };
    if rc > 0 {
        account(|t| t.read(fd, rc as usize));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const sockaddr,
    dest_len: socklen_t,
) -> ssize_t {
    let real_sendto = real!(sendto(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t);
    let rc = unsafe { real_sendto(fd, buf, len, flags, dest, dest_len) };
    if rc >= 0 {
        // SAFETY: the kernel accepted dest/dest_len.
        let peer = unsafe { socket_addr(dest, dest_len) };
        account(|t| {
            if let Some(peer) = peer {
                t.observed_peer(fd, peer);
            }
            t.wrote(fd, rc as usize);
        });
    }
    rc
}

/// Capacity of a caller-provided address buffer before the call.
unsafe fn capacity(len: *const socklen_t) -> socklen_t {
    if len.is_null() { 0 } else { unsafe { *len } }
}

/// Address the kernel stored, if it fit into the caller's buffer.
unsafe fn stored_peer(
    addr: *const sockaddr,
    len: *const socklen_t,
    capacity: socklen_t,
) -> Option<std::net::SocketAddr> {
    if addr.is_null() || len.is_null() {
        return None;
    }
    let stored = unsafe { *len }.min(capacity);
    unsafe { socket_addr(addr, stored) }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut sockaddr,
    src_len: *mut socklen_t,
) -> ssize_t {
    let real_recvfrom = real!(recvfrom(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t);
    let room = unsafe { capacity(src_len) };
    let rc = unsafe { real_recvfrom(fd, buf, len, flags, src, src_len) };
    if rc >= 0 {
        let peer = unsafe { stored_peer(src, src_len, room) };
        account(|t| {
            if let Some(peer) = peer {
                t.observed_peer(fd, peer);
            }
            t.read(fd, rc as usize);
        });
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let real_sendmsg = real!(sendmsg(c_int, *const msghdr, c_int) -> ssize_t);
    let rc = unsafe { real_sendmsg(fd, msg, flags) };
    if rc >= 0 && !msg.is_null() {
        // SAFETY: the kernel accepted msg.
        let peer = unsafe { socket_addr((*msg).msg_name as *const sockaddr, (*msg).msg_namelen) };
        account(|t| {
            if let Some(peer) = peer {
                t.observed_peer(fd, peer);
            }
            t.wrote(fd, rc as usize);
        });
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let real_recvmsg = real!(recvmsg(c_int, *mut msghdr, c_int) -> ssize_t);
    let room = if msg.is_null() { 0 } else { unsafe { (*msg).msg_namelen } };
    let rc = unsafe { real_recvmsg(fd, msg, flags) };
    if rc >= 0 && !msg.is_null() {
        let peer = unsafe {
            stored_peer(
                (*msg).msg_name as *const sockaddr,
                &(*msg).msg_namelen,
                room,
            )
        };
        account(|t| {
            if let Some(peer) = peer {
                t.observed_peer(fd, peer);
            }
            t.read(fd, rc as usize);
        });
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    fn sockaddr_of(addr: std::net::SocketAddrV4) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        }
    }

    #[test]
    fn test_datagram_round_trip_through_hooks() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let std::net::SocketAddr::V4(target) = receiver.local_addr().unwrap() else {
            panic!("expected v4");
        };
        let dest = sockaddr_of(target);

        let sent = unsafe {
            sendto(
                sender.as_raw_fd(),
                b"ping".as_ptr() as *const c_void,
                4,
                0,
                &dest as *const _ as *const sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let mut from: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let got = unsafe {
            recvfrom(
                receiver.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                &mut from as *mut _ as *mut sockaddr,
                &mut from_len,
            )
        };
        assert_eq!(got, 4);
        assert_eq!(&buf[..4], b"ping");

        let peer = unsafe { stored_peer(&from as *const _ as *const sockaddr, &from_len, from_len) };
        assert_eq!(peer, Some(sender.local_addr().unwrap()));
    }

    #[test]
    fn test_refused_connect_is_reported_unchanged() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        // nothing listens on the discard port of loopback in the test sandbox
        let dest = sockaddr_of("127.0.0.1:9".parse().unwrap());
        let rc = unsafe {
            connect(
                fd,
                &dest as *const _ as *const sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        if rc < 0 {
            assert_eq!(unsafe { *libc::__errno_location() }, libc::ECONNREFUSED);
        }
        unsafe { libc::close(fd) };
    }
}
