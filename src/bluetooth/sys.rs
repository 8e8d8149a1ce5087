//! Raw kernel calls behind the L2CAP socket wrapper.
//!
//! [`SocketOps`] is the seam between [`L2capSocket`](super::l2cap::L2capSocket)
//! and the kernel: the production implementation issues the libc calls
//! directly, tests substitute a scripted in-memory kernel.

use std::{io, os::fd::RawFd};

use libc::{c_int, socklen_t};

use super::addr::{RawSockAddrL2, SOCKADDR_L2_LEN};

/// `BTPROTO_L2CAP` from `<bluetooth/bluetooth.h>`, not exported by libc.
const BTPROTO_L2CAP: c_int = 0;

/// Kernel socket primitives used by the L2CAP wrapper.
///
/// Every call is a single syscall; retry policy lives in the caller.
pub trait SocketOps: Send + Sync {
   /// Creates an `AF_BLUETOOTH`/`SOCK_SEQPACKET`/`BTPROTO_L2CAP` socket.
   fn socket(&self) -> io::Result<RawFd>;
   fn set_cloexec(&self, fd: RawFd) -> io::Result<()>;
   fn status_flags(&self, fd: RawFd) -> io::Result<c_int>;
   fn set_status_flags(&self, fd: RawFd, flags: c_int) -> io::Result<()>;
   fn bind(&self, fd: RawFd, addr: &RawSockAddrL2) -> io::Result<()>;
   fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()>;
   fn accept(&self, fd: RawFd, peer: &mut RawSockAddrL2) -> io::Result<RawFd>;
   fn peer_addr(&self, fd: RawFd, peer: &mut RawSockAddrL2) -> io::Result<()>;
   fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
   fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
   fn close(&self, fd: RawFd) -> io::Result<()>;
}

fn cvt(ret: c_int) -> io::Result<c_int> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret)
   }
}

fn cvt_size(ret: isize) -> io::Result<usize> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret as usize)
   }
}

/// The running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

impl SocketOps for Kernel {
   fn socket(&self) -> io::Result<RawFd> {
      cvt(unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_SEQPACKET, BTPROTO_L2CAP) })
   }

   fn set_cloexec(&self, fd: RawFd) -> io::Result<()> {
      cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }).map(drop)
   }

   fn status_flags(&self, fd: RawFd) -> io::Result<c_int> {
      cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })
   }

   fn set_status_flags(&self, fd: RawFd, flags: c_int) -> io::Result<()> {
      cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
   }

   fn bind(&self, fd: RawFd, addr: &RawSockAddrL2) -> io::Result<()> {
      cvt(unsafe {
         libc::bind(
            fd,
            addr.as_ptr().cast::<libc::sockaddr>(),
            SOCKADDR_L2_LEN as socklen_t,
         )
      })
      .map(drop)
   }

   fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()> {
      cvt(unsafe { libc::listen(fd, backlog) }).map(drop)
   }

   fn accept(&self, fd: RawFd, peer: &mut RawSockAddrL2) -> io::Result<RawFd> {
      let mut len = SOCKADDR_L2_LEN as socklen_t;
      cvt(unsafe { libc::accept(fd, peer.as_mut_ptr().cast::<libc::sockaddr>(), &mut len) })
   }

   fn peer_addr(&self, fd: RawFd, peer: &mut RawSockAddrL2) -> io::Result<()> {
      let mut len = SOCKADDR_L2_LEN as socklen_t;
      cvt(unsafe { libc::getpeername(fd, peer.as_mut_ptr().cast::<libc::sockaddr>(), &mut len) })
         .map(drop)
   }

   fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
      cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) })
   }

   fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
      cvt_size(unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) })
   }

   fn close(&self, fd: RawFd) -> io::Result<()> {
      cvt(unsafe { libc::close(fd) }).map(drop)
   }
}
