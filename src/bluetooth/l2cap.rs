//! L2CAP socket implementation for the HID control and interrupt channels.
//!
//! This module wraps raw `AF_BLUETOOTH` sequential-packet sockets with
//! bind/listen/accept/read/write semantics. Sockets are non-blocking and
//! transient `EAGAIN` results are retried after a short delay.

use std::{
   fmt,
   os::fd::RawFd,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use libc::c_int;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tokio::time;

use crate::{
   bluetooth::{
      addr::{SOCKADDR_L2_LEN, SockAddrL2},
      sys::{Kernel, SocketOps},
   },
   error::{KbdError, Result},
};

pub type Packet = SmallVec<[u8; 32]>;

/// Delay between retries of an operation that reported `EAGAIN`.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
   pub delay: Duration,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         delay: DEFAULT_RETRY_DELAY,
      }
   }
}

/// Serializes raw `accept` calls across every listener sharing it.
///
/// Held only around the syscall itself, never across a retry sleep.
#[derive(Debug, Clone, Default)]
pub struct AcceptLock(Arc<Mutex<()>>);

impl AcceptLock {
   fn hold(&self) -> MutexGuard<'_, ()> {
      self.0.lock()
   }

   #[cfg(test)]
   pub fn same_as(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

/// Everything a socket needs besides its descriptor: the kernel interface,
/// the shared accept lock and the retry policy.
#[derive(Clone)]
pub struct SocketContext {
   ops: Arc<dyn SocketOps>,
   accept_lock: AcceptLock,
   retry: RetryPolicy,
}

impl SocketContext {
   pub fn kernel(retry: RetryPolicy) -> Self {
      Self::new(Arc::new(Kernel), retry)
   }

   pub fn new(ops: Arc<dyn SocketOps>, retry: RetryPolicy) -> Self {
      Self {
         ops,
         accept_lock: AcceptLock::default(),
         retry,
      }
   }

   #[cfg(test)]
   pub const fn accept_lock(&self) -> &AcceptLock {
      &self.accept_lock
   }

   /// Creates a socket listening on `psm` on every local adapter.
   ///
   /// The descriptor is closed again if any step fails.
   pub fn listen(&self, psm: u16, backlog: c_int, blocking: bool) -> Result<L2capSocket> {
      let fd = self.ops.socket()?;
      let local = SockAddrL2::any(psm);
      let socket = L2capSocket::from_fd(self.clone(), fd, Endpoint::Listener { local }, blocking);
      debug!("Socket created");

      socket.with_fd(|ops, fd| ops.set_cloexec(fd))?;
      socket.set_blocking(blocking)?;
      debug!("Socket blocking mode set");

      socket.with_fd(|ops, fd| ops.bind(fd, &local.pack()))?;
      debug!("Socket bound to {local}");

      socket.with_fd(|ops, fd| ops.listen(fd, backlog))?;
      debug!("Socket is listening");

      Ok(socket)
   }

   /// Takes ownership of a connected descriptor supplied from outside,
   /// e.g. the control channel BlueZ hands over in `NewConnection`.
   pub fn wrap(&self, fd: RawFd) -> Result<L2capSocket> {
      if fd < 0 {
         return Err(KbdError::InvalidArgument("invalid file descriptor"));
      }

      let mut raw = [0u8; SOCKADDR_L2_LEN];
      let peer = self
         .ops
         .peer_addr(fd, &mut raw)
         .map_err(KbdError::from)
         .and_then(|()| SockAddrL2::unpack(&raw));
      let peer = match peer {
         Ok(peer) => peer,
         Err(e) => {
            let _ = self.ops.close(fd);
            return Err(e);
         },
      };

      let socket = L2capSocket::from_fd(self.clone(), fd, Endpoint::Connection { peer }, true);
      socket.set_blocking(false)?;
      debug!("Wrapped socket {fd} connected to {peer}");
      Ok(socket)
   }

   /// Closes a descriptor that never made it into a socket.
   pub fn close_raw(&self, fd: RawFd) -> Result<()> {
      if fd < 0 {
         return Err(KbdError::InvalidArgument("invalid file descriptor"));
      }
      Ok(self.ops.close(fd)?)
   }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
   Listener { local: SockAddrL2 },
   Connection { peer: SockAddrL2 },
}

/// A raw L2CAP sequential-packet socket.
///
/// Either a listener (bound and listening, no peer) or a connection (has a
/// peer). The descriptor is owned and closed exactly once, by [`close`] or
/// on drop. Each syscall holds the per-socket lock, so reads and writes on
/// one socket never interleave.
///
/// [`close`]: L2capSocket::close
pub struct L2capSocket {
   ctx: SocketContext,
   fd: Mutex<Option<RawFd>>,
   endpoint: Endpoint,
   blocking: AtomicBool,
}

impl fmt::Debug for L2capSocket {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("L2capSocket")
         .field("fd", &self.raw_fd())
         .field("endpoint", &self.endpoint)
         .field("blocking", &self.is_blocking())
         .finish()
   }
}

fn is_errno(err: &KbdError, code: i32) -> bool {
   err.raw_os_error() == Some(code)
}

impl L2capSocket {
   fn from_fd(ctx: SocketContext, fd: RawFd, endpoint: Endpoint, blocking: bool) -> Self {
      Self {
         ctx,
         fd: Mutex::new(Some(fd)),
         endpoint,
         blocking: AtomicBool::new(blocking),
      }
   }

   /// Runs one syscall on the descriptor under the socket lock.
   fn with_fd<T>(&self, f: impl FnOnce(&dyn SocketOps, RawFd) -> std::io::Result<T>) -> Result<T> {
      let guard = self.fd.lock();
      let fd = (*guard).ok_or(KbdError::InvalidArgument("socket is closed"))?;
      Ok(f(self.ctx.ops.as_ref(), fd)?)
   }

   pub fn raw_fd(&self) -> Option<RawFd> {
      *self.fd.lock()
   }

   pub const fn is_listener(&self) -> bool {
      matches!(self.endpoint, Endpoint::Listener { .. })
   }

   pub const fn local_addr(&self) -> Option<SockAddrL2> {
      match self.endpoint {
         Endpoint::Listener { local } => Some(local),
         Endpoint::Connection { .. } => None,
      }
   }

   pub const fn peer_addr(&self) -> Option<SockAddrL2> {
      match self.endpoint {
         Endpoint::Connection { peer } => Some(peer),
         Endpoint::Listener { .. } => None,
      }
   }

   pub fn is_blocking(&self) -> bool {
      self.blocking.load(Ordering::Relaxed)
   }

   /// Sets blocking (`true`) or non-blocking (`false`) mode.
   pub fn set_blocking(&self, blocking: bool) -> Result<()> {
      self.with_fd(|ops, fd| {
         let flags = ops.status_flags(fd)?;
         let flags = if blocking {
            flags & !libc::O_NONBLOCK
         } else {
            flags | libc::O_NONBLOCK
         };
         ops.set_status_flags(fd, flags)
      })?;
      self.blocking.store(blocking, Ordering::Relaxed);
      Ok(())
   }

   /// Waits for the next incoming connection.
   ///
   /// `EAGAIN` is retried after the context's retry delay and
   /// `ECONNABORTED` immediately; any other error is returned.
   pub async fn accept(&self) -> Result<L2capSocket> {
      if !self.is_listener() {
         return Err(KbdError::InvalidArgument("accept on a connected socket"));
      }

      let (fd, raw) = loop {
         let attempt = self.with_fd(|ops, fd| {
            let _serial = self.ctx.accept_lock.hold();
            let mut raw = [0u8; SOCKADDR_L2_LEN];
            ops.accept(fd, &mut raw).map(|nfd| (nfd, raw))
         });
         match attempt {
            Ok(accepted) => break accepted,
            Err(e) if is_errno(&e, libc::EAGAIN) => time::sleep(self.ctx.retry.delay).await,
            Err(e) if is_errno(&e, libc::ECONNABORTED) => {},
            Err(e) => return Err(e),
         }
      };

      let peer = match SockAddrL2::unpack(&raw) {
         Ok(peer) => peer,
         Err(e) => {
            let _ = self.ctx.ops.close(fd);
            return Err(e);
         },
      };
      debug!("Remote address info {peer}");

      let conn = Self::from_fd(
         self.ctx.clone(),
         fd,
         Endpoint::Connection { peer },
         self.is_blocking(),
      );
      conn.with_fd(|ops, fd| ops.set_cloexec(fd))?;
      conn.set_blocking(false)?;
      debug!("Accepted socket {fd} set to non-blocking");

      Ok(conn)
   }

   /// Reads one packet, waiting while the socket reports `EAGAIN`.
   ///
   /// The lock is taken per attempt, so a concurrent [`close`] makes the
   /// next attempt fail instead of waiting behind the read.
   ///
   /// [`close`]: L2capSocket::close
   pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
      loop {
         match self.with_fd(|ops, fd| ops.read(fd, buf)) {
            Err(e) if is_errno(&e, libc::EAGAIN) => time::sleep(self.ctx.retry.delay).await,
            result => return result,
         }
      }
   }

   /// Writes one packet. Errors are not retried.
   pub fn write(&self, data: &[u8]) -> Result<usize> {
      self.with_fd(|ops, fd| ops.write(fd, data))
   }

   /// Closes the descriptor. Fails with `InvalidArgument` if already closed.
   pub fn close(&self) -> Result<()> {
      let fd = self
         .fd
         .lock()
         .take()
         .ok_or(KbdError::InvalidArgument("socket is already closed"))?;
      self.ctx.ops.close(fd)?;
      Ok(())
   }
}

impl Drop for L2capSocket {
   fn drop(&mut self) {
      if let Some(fd) = self.fd.get_mut().take() {
         let _ = self.ctx.ops.close(fd);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::sys::mock::{MockKernel, Op, peer};

   fn context(kernel: &Arc<MockKernel>) -> SocketContext {
      SocketContext::new(
         kernel.clone(),
         RetryPolicy {
            delay: Duration::ZERO,
         },
      )
   }

   #[test]
   fn test_listen_binds_wildcard_psm() {
      let kernel = MockKernel::new();
      let listener = context(&kernel).listen(0x13, 1, false).unwrap();
      let fd = listener.raw_fd().unwrap();

      let (bound, backlog) = kernel.bound(fd).unwrap();
      assert_eq!(bound, SockAddrL2::any(0x13));
      assert_eq!(backlog, Some(1));
      assert!(kernel.is_cloexec(fd));
      assert!(kernel.is_nonblocking(fd));
      assert!(listener.is_listener());
      assert!(listener.peer_addr().is_none());
      assert_eq!(listener.local_addr(), Some(SockAddrL2::any(0x13)));
   }

   #[test]
   fn test_listen_failure_closes_descriptor() {
      for op in [Op::Cloexec, Op::Bind, Op::Listen] {
         let kernel = MockKernel::new();
         kernel.fail_next(op, libc::EADDRINUSE);

         let err = context(&kernel).listen(0x13, 1, false).unwrap_err();
         assert!(is_errno(&err, libc::EADDRINUSE), "{op:?}: {err}");
         assert_eq!(kernel.open_count(), 0, "{op:?} leaked a descriptor");
      }
   }

   #[test]
   fn test_listen_socket_failure() {
      let kernel = MockKernel::new();
      kernel.fail_next(Op::Socket, libc::EAFNOSUPPORT);

      let err = context(&kernel).listen(0x13, 1, true).unwrap_err();
      assert!(matches!(err, KbdError::Socket(_)));
   }

   #[test]
   fn test_set_blocking_toggles_flag() {
      let kernel = MockKernel::new();
      let listener = context(&kernel).listen(0x13, 1, true).unwrap();
      let fd = listener.raw_fd().unwrap();
      assert!(!kernel.is_nonblocking(fd));
      assert!(listener.is_blocking());

      listener.set_blocking(false).unwrap();
      assert!(kernel.is_nonblocking(fd));
      assert!(!listener.is_blocking());

      listener.set_blocking(true).unwrap();
      assert!(!kernel.is_nonblocking(fd));
   }

   #[tokio::test]
   async fn test_accept_retries_eagain() {
      let kernel = MockKernel::new();
      let listener = context(&kernel).listen(0x13, 1, false).unwrap();
      let lfd = listener.raw_fd().unwrap();

      for _ in 0..50 {
         kernel.push_accept_error(lfd, libc::EAGAIN);
      }
      let conn_fd = kernel.push_accept(lfd, peer(6));

      let conn = listener.accept().await.unwrap();
      assert_eq!(kernel.accept_calls(), 51);
      assert_eq!(conn.raw_fd(), Some(conn_fd));
      assert_eq!(conn.peer_addr(), Some(peer(6)));
      assert!(kernel.is_cloexec(conn_fd));
      assert!(kernel.is_nonblocking(conn_fd));
   }

   #[tokio::test]
   async fn test_accept_retries_connection_aborted() {
      let kernel = MockKernel::new();
      let listener = context(&kernel).listen(0x13, 1, false).unwrap();
      let lfd = listener.raw_fd().unwrap();

      kernel.push_accept_error(lfd, libc::ECONNABORTED);
      kernel.push_accept_error(lfd, libc::ECONNABORTED);
      kernel.push_accept(lfd, peer(1));

      let conn = listener.accept().await.unwrap();
      assert_eq!(kernel.accept_calls(), 3);
      assert_eq!(conn.peer_addr(), Some(peer(1)));
   }

   #[tokio::test]
   async fn test_accept_fatal_error_surfaces() {
      let kernel = MockKernel::new();
      let listener = context(&kernel).listen(0x13, 1, false).unwrap();
      let lfd = listener.raw_fd().unwrap();

      kernel.push_accept_error(lfd, libc::EAGAIN);
      kernel.push_accept_error(lfd, libc::EBADF);
      kernel.push_accept(lfd, peer(1));

      let err = listener.accept().await.unwrap_err();
      assert!(is_errno(&err, libc::EBADF));
      assert_eq!(kernel.accept_calls(), 2);
   }

   #[tokio::test]
   async fn test_accept_on_connection_is_rejected() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let conn = ctx.wrap(kernel.external_fd(peer(2))).unwrap();

      assert!(matches!(
         conn.accept().await,
         Err(KbdError::InvalidArgument(_))
      ));
   }

   #[test]
   fn test_listeners_share_accept_lock() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let a = ctx.listen(0x11, 1, false).unwrap();
      let b = ctx.listen(0x13, 1, false).unwrap();

      assert!(a.ctx.accept_lock.same_as(&b.ctx.accept_lock));
      assert!(!AcceptLock::default().same_as(ctx.accept_lock()));
   }

   #[tokio::test]
   async fn test_read_retries_eagain_then_surfaces_errors() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let fd = kernel.external_fd(peer(3));
      let conn = ctx.wrap(fd).unwrap();

      kernel.push_read_error(fd, libc::EAGAIN);
      kernel.push_read_error(fd, libc::EAGAIN);
      kernel.push_read(fd, &[0x71, 0x01]);
      kernel.push_read_error(fd, libc::ECONNRESET);

      let mut buf = [0u8; 16];
      assert_eq!(conn.read(&mut buf).await.unwrap(), 2);
      assert_eq!(&buf[..2], &[0x71, 0x01]);

      let err = conn.read(&mut buf).await.unwrap_err();
      assert!(is_errno(&err, libc::ECONNRESET));
   }

   #[tokio::test]
   async fn test_close_wakes_pending_read() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let conn = Arc::new(ctx.wrap(kernel.external_fd(peer(4))).unwrap());

      let reader = {
         let conn = conn.clone();
         tokio::spawn(async move {
            let mut buf = [0u8; 8];
            conn.read(&mut buf).await
         })
      };
      tokio::task::yield_now().await;

      conn.close().unwrap();
      let result = reader.await.unwrap();
      assert!(matches!(result, Err(KbdError::InvalidArgument(_))));
   }

   #[test]
   fn test_write_records_packet() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let fd = kernel.external_fd(peer(5));
      let conn = ctx.wrap(fd).unwrap();

      assert_eq!(conn.write(&[0xa1, 0x13, 0x03]).unwrap(), 3);
      assert_eq!(kernel.writes(fd), vec![vec![0xa1, 0x13, 0x03]]);
   }

   #[test]
   fn test_close_twice_is_invalid_argument() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let fd = kernel.external_fd(peer(5));
      let conn = ctx.wrap(fd).unwrap();

      conn.close().unwrap();
      assert!(kernel.is_closed(fd));
      assert!(matches!(conn.close(), Err(KbdError::InvalidArgument(_))));
      assert!(matches!(conn.write(&[0]), Err(KbdError::InvalidArgument(_))));
   }

   #[test]
   fn test_drop_closes_once() {
      let kernel = MockKernel::new();
      let ctx = context(&kernel);
      let fd = kernel.external_fd(peer(5));
      drop(ctx.wrap(fd).unwrap());
      assert!(kernel.is_closed(fd));
   }

   #[test]
   fn test_wrap_rejects_negative_descriptor() {
      let kernel = MockKernel::new();
      assert!(matches!(
         context(&kernel).wrap(-1),
         Err(KbdError::InvalidArgument(_))
      ));
   }

   #[test]
   fn test_wrap_failure_closes_descriptor() {
      let kernel = MockKernel::new();
      let fd = kernel.external_fd(peer(5));
      kernel.fail_next(Op::PeerAddr, libc::ENOTCONN);

      assert!(context(&kernel).wrap(fd).is_err());
      assert!(kernel.is_closed(fd));
   }

   #[test]
   fn test_wrap_sets_nonblocking() {
      let kernel = MockKernel::new();
      let fd = kernel.external_fd(peer(7));
      let conn = context(&kernel).wrap(fd).unwrap();

      assert!(kernel.is_nonblocking(fd));
      assert!(!conn.is_listener());
      assert_eq!(conn.peer_addr(), Some(peer(7)));
   }
}
