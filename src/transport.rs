//! Outgoing and incoming transports, selected by URI.
//!
//! The session owns its transport exclusively and talks to it through the
//! `Transport` capability set: write, wait-for-writable, close, and (for
//! file-backed targets) seek. Raw layouts need the seek capability; live
//! streams run over any of them.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::api::{Error, RawMode, Result};

pub trait Transport: Send {
    /// Write some bytes. May return `WouldBlock` on a non-blocking socket;
    /// the codec then calls `wait_writable` and retries. `Interrupted` is
    /// retried directly.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Block until the transport can make progress again.
    fn wait_writable(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;

    /// Reposition the output. Only file-backed transports support this;
    /// raw layouts are incompatible with the rest.
    fn seek(&mut self, _pos: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "transport is not seekable"))
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// select(2) on writability, retrying EINTR. Returns once the fd is
/// writable.
fn select_writable(fd: RawFd) -> io::Result<()> {
    loop {
        let ret = unsafe {
            let mut wfds: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut wfds);
            libc::FD_SET(fd, &mut wfds);
            libc::select(fd + 1, std::ptr::null_mut(), &mut wfds, std::ptr::null_mut(), std::ptr::null_mut())
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(());
    }
}

/// Plain file target (`raw:PATH`, `rawlive:PATH`).
pub struct FileTransport {
    file: File,
}

impl FileTransport {
    pub fn create(path: &str) -> Result<FileTransport> {
        let file = File::create(path).map_err(Error::Io)?;
        Ok(FileTransport { file })
    }

    pub fn from_file(file: File) -> FileTransport {
        FileTransport { file }
    }
}

impl Transport for FileTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host_port: &str) -> Result<TcpTransport> {
        let stream = connect_retry(|| TcpStream::connect(host_port))?;
        stream.set_nonblocking(true).map_err(Error::Io)?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn wait_writable(&mut self) -> io::Result<()> {
        select_writable(self.stream.as_raw_fd())
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn connect(path: &str) -> Result<UnixTransport> {
        let stream = connect_retry(|| UnixStream::connect(path))?;
        stream.set_nonblocking(true).map_err(Error::Io)?;
        Ok(UnixTransport { stream })
    }
}

impl Transport for UnixTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn wait_writable(&mut self) -> io::Result<()> {
        select_writable(self.stream.as_raw_fd())
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

/// Pipe the stream into a shell command's stdin (`exec:CMD`).
pub struct ExecTransport {
    child: Child,
}

impl ExecTransport {
    pub fn spawn(command: &str) -> Result<ExecTransport> {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(Error::Io)?;
        Ok(ExecTransport { child })
    }
}

impl Transport for ExecTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.child.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "exec child stdin closed")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping stdin delivers EOF; reap the child so the pipe drains.
        drop(self.child.stdin.take());
        self.child.wait().map(|_| ())
    }
}

/// Adopt an already-open file descriptor (`fd:N`).
pub struct FdTransport {
    file: File,
}

impl FdTransport {
    pub fn from_name(name: &str) -> Result<FdTransport> {
        let fd: RawFd = name
            .parse()
            .map_err(|_| Error::invalid(format!("bad fd name \"{}\"", name)))?;
        // Ownership of the descriptor transfers to the session.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(FdTransport { file })
    }
}

impl Transport for FdTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// The destination may not have bound its listener by the time `migrate()`
/// runs; give it a moment before giving up.
fn connect_retry<S>(mut connect: impl FnMut() -> io::Result<S>) -> Result<S> {
    let mut last = None;
    for _ in 0..50 {
        match connect() {
            Ok(s) => return Ok(s),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused || e.kind() == io::ErrorKind::NotFound => {
                last = Some(e);
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Err(Error::Io(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))))
}

/// Map an outgoing migration URI to a transport and the layout it implies.
pub fn outgoing(uri: &str) -> Result<(Box<dyn Transport>, RawMode)> {
    if let Some(rest) = uri.strip_prefix("tcp:") {
        Ok((Box::new(TcpTransport::connect(rest)?), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("unix:") {
        Ok((Box::new(UnixTransport::connect(rest)?), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("exec:") {
        Ok((Box::new(ExecTransport::spawn(rest)?), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("fd:") {
        Ok((Box::new(FdTransport::from_name(rest)?), RawMode::Suspend))
    } else if let Some(rest) = uri.strip_prefix("raw:") {
        Ok((Box::new(FileTransport::create(rest)?), RawMode::Suspend))
    } else if let Some(rest) = uri.strip_prefix("rawlive:") {
        Ok((Box::new(FileTransport::create(rest)?), RawMode::Live))
    } else {
        Err(Error::invalid(format!("unknown migration protocol \"{}\"", uri)))
    }
}

/// The load side of the URI map. Network schemes bind and accept a single
/// connection; raw schemes open the snapshot file, which must be seekable.
pub enum IncomingSource {
    Stream(Box<dyn Read + Send>),
    File(File),
}

pub fn incoming(uri: &str) -> Result<(IncomingSource, RawMode)> {
    if let Some(rest) = uri.strip_prefix("tcp:") {
        let listener = std::net::TcpListener::bind(rest).map_err(Error::Io)?;
        let (stream, peer) = listener.accept().map_err(Error::Io)?;
        log::info!("incoming migration connection from {}", peer);
        Ok((IncomingSource::Stream(Box::new(stream)), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("unix:") {
        let listener = std::os::unix::net::UnixListener::bind(rest).map_err(Error::Io)?;
        let (stream, _) = listener.accept().map_err(Error::Io)?;
        Ok((IncomingSource::Stream(Box::new(stream)), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("exec:") {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(rest)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(Error::Io)?;
        let stdout = child
            .stdout
            .ok_or_else(|| Error::invalid("exec child has no stdout"))?;
        Ok((IncomingSource::Stream(Box::new(stdout)), RawMode::None))
    } else if let Some(rest) = uri.strip_prefix("fd:") {
        let fd: RawFd = rest
            .parse()
            .map_err(|_| Error::invalid(format!("bad fd name \"{}\"", rest)))?;
        let file = unsafe { File::from_raw_fd(fd) };
        Ok((IncomingSource::File(file), RawMode::Suspend))
    } else if let Some(rest) = uri.strip_prefix("raw:") {
        Ok((IncomingSource::File(File::open(rest).map_err(Error::Io)?), RawMode::Suspend))
    } else if let Some(rest) = uri.strip_prefix("rawlive:") {
        Ok((IncomingSource::File(File::open(rest).map_err(Error::Io)?), RawMode::Live))
    } else {
        Err(Error::invalid(format!("unknown migration protocol \"{}\"", uri)))
    }
}
