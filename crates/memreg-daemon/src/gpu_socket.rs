//! Unix-socket transport to an external GPU profiler.
//!
//! Protocol, one stream per cluster:
//! - request: the single byte `S`, sent without blocking
//! - response: one 8-byte record `{i32 read_beats, i32 write_beats}`, little-endian
//!
//! EOF from the profiler closes the channel. Terminating the channel shuts
//! the socket down in both directions, which wakes a blocked receiver.

use memreg_common::config::ClusterId;
use memreg_common::error::{RegError, RegResult};
use memreg_engine::{GpuBeatSample, GpuChannel, GpuSampleReceiver, GpuSampleRequester, GPU_RECORD_SIZE};
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Request byte understood by the profiler.
pub const SAMPLE_REQUEST: u8 = b'S';

/// Expand `{cluster}` in `template`.
#[must_use]
pub fn socket_path(template: &str, cluster: ClusterId) -> PathBuf {
    PathBuf::from(template.replace("{cluster}", &cluster.to_string()))
}

/// Connect to the profiler listening at `path`.
///
/// # Errors
///
/// [`RegError::ChannelClosed`] if nobody listens at `path`,
/// [`RegError::Io`] for other socket errors.
pub fn connect(path: &Path) -> RegResult<GpuChannel> {
    let stream = UnixStream::connect(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "No GPU profiler listening");
            RegError::ChannelClosed
        }
        _ => RegError::Io(format!("connect {}: {e}", path.display())),
    })?;
    info!(path = %path.display(), "Connected to GPU profiler");
    from_stream(stream)
}

/// Wrap an already connected stream.
///
/// # Errors
///
/// [`RegError::Io`] if the stream cannot be duplicated.
pub fn from_stream(stream: UnixStream) -> RegResult<GpuChannel> {
    let terminated = Arc::new(AtomicBool::new(false));
    let reader = stream
        .try_clone()
        .map_err(|e| RegError::Io(format!("clone profiler stream: {e}")))?;
    Ok(GpuChannel {
        requester: Arc::new(SocketRequester {
            stream,
            terminated: Arc::clone(&terminated),
        }),
        receiver: Box::new(SocketReceiver {
            stream: reader,
            terminated,
        }),
    })
}

struct SocketRequester {
    stream: UnixStream,
    terminated: Arc<AtomicBool>,
}

impl GpuSampleRequester for SocketRequester {
    fn request(&self) -> RegResult<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(RegError::Shutdown);
        }
        let flags = MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL;
        match send(self.stream.as_raw_fd(), &[SAMPLE_REQUEST], flags) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => {
                trace!("Profiler socket full, request dropped");
                Ok(())
            }
            Err(Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN) => Err(RegError::ChannelClosed),
            Err(e) => Err(RegError::Io(format!("send sample request: {e}"))),
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        // Already shut down or disconnected is fine.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct SocketReceiver {
    stream: UnixStream,
    terminated: Arc<AtomicBool>,
}

impl SocketReceiver {
    fn map_read_error(&self, e: &std::io::Error) -> RegError {
        if self.terminated.load(Ordering::Acquire) {
            RegError::Shutdown
        } else if e.kind() == ErrorKind::UnexpectedEof {
            RegError::ChannelClosed
        } else {
            RegError::Io(format!("read profiler record: {e}"))
        }
    }
}

impl GpuSampleReceiver for SocketReceiver {
    fn recv(&mut self) -> RegResult<GpuBeatSample> {
        let mut record = [0u8; GPU_RECORD_SIZE];
        self.stream
            .read_exact(&mut record)
            .map_err(|e| self.map_read_error(&e))?;
        if self.terminated.load(Ordering::Acquire) {
            return Err(RegError::Shutdown);
        }
        Ok(GpuBeatSample::decode(record))
    }

    fn try_recv(&mut self) -> RegResult<Option<GpuBeatSample>> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(RegError::Shutdown);
        }
        let mut peek = [0u8; GPU_RECORD_SIZE];
        let flags = MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT;
        match recv(self.stream.as_raw_fd(), &mut peek, flags) {
            Ok(0) => Err(RegError::ChannelClosed),
            Ok(n) if n < GPU_RECORD_SIZE => Ok(None),
            Ok(_) => self.recv().map(Some),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(RegError::Io(format!("peek profiler record: {e}"))),
        }
    }
}
