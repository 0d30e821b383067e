//! Inter-domain transport over virtio vsock.
//!
//! Domains are addressed by `(domid, port)`; domain ids map directly onto
//! vsock context ids. tokio has no native `AF_VSOCK` support, so sockets are
//! created through libc, set non-blocking, and driven by
//! `AsyncFd<OwnedFd>` with raw `read`/`write` calls. Wrapping the fd in
//! `tokio::net::UnixStream` does not work because mio's bookkeeping expects
//! `AF_UNIX` semantics.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::channel::BoxedStream;

const AF_VSOCK: i32 = 40;

/// sockaddr_vm layout per include/uapi/linux/vm_sockets.h.
#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

fn sockaddr_vm(domid: u32, port: u32) -> SockaddrVm {
    SockaddrVm {
        svm_family: AF_VSOCK as libc::sa_family_t,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: domid,
        svm_flags: 0,
        svm_zero: [0u8; 3],
    }
}

/// Opens per-session channels toward a calling domain.
///
/// The session lifecycle reaches the transport only through this trait, so
/// tests substitute in-memory connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, domid: u32, port: u32) -> io::Result<BoxedStream>;
}

/// Production connector backed by `AF_VSOCK` stream sockets.
pub struct VsockConnector;

#[async_trait]
impl Connector for VsockConnector {
    async fn connect(&self, domid: u32, port: u32) -> io::Result<BoxedStream> {
        // connect(2) on a blocking vsock socket can stall the runtime, so it
        // runs on the blocking pool.
        let fd = tokio::task::spawn_blocking(move || connect_fd(domid, port))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(Box::new(VsockStream::new(fd)?))
    }
}

fn connect_fd(domid: u32, port: u32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_vm(domid, port);
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// An async vsock stream backed by `AsyncFd<OwnedFd>` with raw read/write.
pub struct VsockStream {
    inner: AsyncFd<OwnedFd>,
}

impl VsockStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n =
                    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let fd = self.inner.get_ref().as_raw_fd();
        let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        if ret == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::last_os_error()))
        }
    }
}

/// Accepts the dispatcher's control connection on a well-known port.
pub struct VsockListener {
    inner: AsyncFd<OwnedFd>,
}

impl VsockListener {
    /// Bind and listen on `port` for connections from any domain.
    pub fn bind(port: u32) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // VMADDR_CID_ANY
        let addr = sockaddr_vm(u32::MAX, port);
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const SockaddrVm as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let ret = unsafe { libc::listen(fd, 16) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            inner: AsyncFd::new(owned)?,
        })
    }

    /// Accept one connection, returning the stream and the peer's domain id.
    pub async fn accept(&self) -> io::Result<(VsockStream, u32)> {
        loop {
            let mut guard = self.inner.readable().await?;

            match guard.try_io(|inner| {
                let fd = unsafe {
                    libc::accept4(
                        inner.get_ref().as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if fd >= 0 {
                    Ok(fd)
                } else {
                    Err(io::Error::last_os_error())
                }
            }) {
                Ok(Ok(fd)) => {
                    let mut peer: SockaddrVm = unsafe { std::mem::zeroed() };
                    let mut addr_len = std::mem::size_of::<SockaddrVm>() as libc::socklen_t;
                    unsafe {
                        libc::getpeername(
                            fd,
                            &mut peer as *mut SockaddrVm as *mut libc::sockaddr,
                            &mut addr_len,
                        );
                    }
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    return Ok((VsockStream::new(owned)?, peer.svm_cid));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}
