//! Non-blocking TCP for the selector stack.
//!
//! [`TcpSocket`] and [`TcpServer`] are thin device wrappers over
//! `mio::net`, attached to a selector and driven by readiness.
//! [`BufferedSocket`] puts owned read/write queues on top so callers never
//! deal with partial transfers themselves.

mod buffered;
mod error;
mod tcpserver;
mod tcpsocket;

pub use buffered::{BufferedSignals, BufferedSocket};
pub use error::NetError;
pub use tcpserver::{TcpServer, TcpServerSignals};
pub use tcpsocket::{TcpSignals, TcpSocket};

/// Set kernel SO_SNDBUF and SO_RCVBUF on a raw socket fd.
pub(crate) fn set_socket_buf_size(fd: std::os::fd::RawFd, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
