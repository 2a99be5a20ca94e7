//! Wire framing for migration streams.
//!
//! `StreamWriter` is the buffered, rate-limited, error-latching writer the
//! save paths emit through; `StreamReader` is its counterpart on the load
//! side. Values are big-endian. Chunk flag bits ride in the low bits of the
//! 64-bit offset word: offsets are page-aligned, so the low `log2(PAGE_SIZE)`
//! bits are guaranteed free.
//!
//! A chunk without CONTINUE is `{be64 flags|offset, u8 idlen, idlen bytes,
//! payload}`; with CONTINUE the idstr is omitted and the previously named
//! region is reused.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::api::{Error, Result, MAX_THROTTLE, PAGE_MASK, STREAM_MAGIC, STREAM_VERSION};
use crate::transport::Transport;

bitflags! {
    /// Flag bits packed into the low bits of a chunk's offset word.
    pub struct RamSaveFlags: u64 {
        /// Single-byte fill page follows.
        const COMPRESS = 0x02;
        /// Region table header; the high bits carry total RAM bytes.
        const MEM_SIZE = 0x04;
        /// Full page payload follows.
        const PAGE     = 0x08;
        /// End of stream.
        const EOS      = 0x10;
        /// Same region as the previous chunk; idstr omitted.
        const CONTINUE = 0x20;
        /// Raw-layout region chunk follows.
        const RAW      = 0x40;
    }
}

/// Split a wire word into its page-aligned offset and decoded flag set.
pub fn split_offset_word(word: u64) -> (u64, RamSaveFlags) {
    (word & PAGE_MASK, RamSaveFlags::from_bits_truncate(word & !PAGE_MASK))
}

const IO_BUF_SIZE: usize = 32 * 1024;
/// Rate accounting window. The per-window budget is `bandwidth_limit`
/// scaled down to one window.
const RATE_WINDOW: Duration = Duration::from_millis(100);
const RATE_WINDOWS_PER_SEC: u64 = 10;

/// Buffered writer over a [`Transport`].
///
/// The first transport error is latched; every write after that is a no-op
/// and the stored error is reported at the next checkpoint (`rate_limit`,
/// `flush`, `close`). Raising the shutdown flag (session cancel) behaves
/// like a latched error: no more bytes reach the transport.
pub struct StreamWriter {
    xport: Box<dyn Transport>,
    buf: Vec<u8>,
    /// Logical stream position used for raw page alignment. Distinct from
    /// the physical offset while bytes sit in the buffer.
    blob_pos: u64,
    flushed: u64,
    limit: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    bytes_xfer: u64,
    window: Instant,
    error: Option<io::ErrorKind>,
}

impl StreamWriter {
    pub fn new(xport: Box<dyn Transport>, limit: Arc<AtomicU64>, shutdown: Arc<AtomicBool>) -> StreamWriter {
        StreamWriter {
            xport,
            buf: Vec::with_capacity(IO_BUF_SIZE),
            blob_pos: 0,
            flushed: 0,
            limit,
            shutdown,
            bytes_xfer: 0,
            window: Instant::now(),
            error: None,
        }
    }

    /// Convenience constructor for file targets with the default throttle.
    pub fn file(file: File) -> StreamWriter {
        StreamWriter::new(
            Box::new(crate::transport::FileTransport::from_file(file)),
            Arc::new(AtomicU64::new(MAX_THROTTLE)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn put_byte(&mut self, value: u8) {
        self.put_buffer(&[value]);
    }

    pub fn put_be32(&mut self, value: u32) {
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, value);
        self.put_buffer(&word);
    }

    pub fn put_be64(&mut self, value: u64) {
        let mut word = [0u8; 8];
        BigEndian::write_u64(&mut word, value);
        self.put_buffer(&word);
    }

    pub fn put_buffer(&mut self, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if self.shutdown.load(Ordering::SeqCst) {
            // Cancelled sessions stop emitting; latch so later checkpoints
            // see the session went away.
            self.error = Some(io::ErrorKind::BrokenPipe);
            return;
        }
        self.blob_pos += data.len() as u64;
        self.bytes_xfer += data.len() as u64;
        self.buf.extend_from_slice(data);
        if self.buf.len() >= IO_BUF_SIZE {
            self.flush_buf();
        }
    }

    fn flush_buf(&mut self) {
        if self.error.is_some() || self.buf.is_empty() {
            return;
        }
        let mut written = 0;
        while written < self.buf.len() {
            match self.xport.write(&self.buf[written..]) {
                Ok(0) => {
                    self.error = Some(io::ErrorKind::WriteZero);
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = self.xport.wait_writable() {
                        log::warn!("migration stream wait failed: {}", e);
                        self.error = Some(e.kind());
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("migration stream write failed: {}", e);
                    self.error = Some(e.kind());
                    break;
                }
            }
        }
        self.flushed += written as u64;
        self.buf.clear();
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_buf();
        self.check_error()
    }

    /// Logical stream position (raw page alignment is computed from this,
    /// never from the physical offset).
    pub fn blob_pos(&self) -> u64 {
        self.blob_pos
    }

    /// Physical bytes handed to the transport so far.
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed
    }

    /// Reposition the logical stream. Flushes, then seeks the transport;
    /// only file-backed transports support this.
    pub fn set_blob_pos(&mut self, pos: u64) -> Result<()> {
        self.flush_buf();
        self.check_error()?;
        if let Err(e) = self.xport.seek(pos) {
            self.error = Some(e.kind());
            return Err(Error::Io(e));
        }
        self.blob_pos = pos;
        self.flushed = pos;
        Ok(())
    }

    pub fn is_seekable(&self) -> bool {
        self.xport.is_seekable()
    }

    /// True when this window's budget is spent and the saver should yield.
    /// Reports the latched error instead, if there is one.
    pub fn rate_limit(&mut self) -> Result<bool> {
        self.check_error()?;
        if self.window.elapsed() >= RATE_WINDOW {
            self.window = Instant::now();
            self.bytes_xfer = 0;
        }
        let budget = self.limit.load(Ordering::SeqCst) / RATE_WINDOWS_PER_SEC;
        Ok(self.bytes_xfer > budget)
    }

    /// Cooperative yield: push buffered bytes out and sleep off the rest of
    /// the accounting window.
    pub fn rate_wait(&mut self) {
        self.flush_buf();
        let elapsed = self.window.elapsed();
        if elapsed < RATE_WINDOW {
            std::thread::sleep(RATE_WINDOW - elapsed);
        }
        self.window = Instant::now();
        self.bytes_xfer = 0;
    }

    pub fn get_error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    pub(crate) fn check_error(&self) -> Result<()> {
        match self.error {
            Some(kind) => Err(Error::Io(io::Error::from(kind))),
            None => Ok(()),
        }
    }

    /// Flush and close the transport, reporting the first error the stream
    /// ever hit.
    pub fn close(&mut self) -> Result<()> {
        self.flush_buf();
        if let Err(e) = self.xport.close() {
            if self.error.is_none() {
                self.error = Some(e.kind());
            }
        }
        self.check_error()
    }
}

/// Emit the stream prologue: magic plus format version.
pub fn write_stream_header(w: &mut StreamWriter) {
    w.put_be32(STREAM_MAGIC);
    w.put_be32(STREAM_VERSION);
}

/// Validate the prologue and hand back the version for the loader's check.
pub fn read_stream_header(r: &mut StreamReader) -> Result<u32> {
    let magic = r.get_be32()?;
    if magic != STREAM_MAGIC {
        return Err(Error::invalid(format!("bad stream magic {:#010x}", magic)));
    }
    r.get_be32()
}

enum ReaderBackend {
    File(BufReader<File>),
    Stream(Box<dyn Read + Send>),
}

/// Buffered reader over a snapshot file or a live byte stream.
///
/// The raw restore path needs a real file: it seeks past mapped regions and
/// hands the descriptor to mmap. Live streams may come from any transport.
pub struct StreamReader {
    src: ReaderBackend,
    pos: u64,
}

impl StreamReader {
    pub fn from_file(file: File) -> StreamReader {
        StreamReader { src: ReaderBackend::File(BufReader::new(file)), pos: 0 }
    }

    pub fn from_stream(stream: Box<dyn Read + Send>) -> StreamReader {
        StreamReader { src: ReaderBackend::Stream(stream), pos: 0 }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let res = match &mut self.src {
            ReaderBackend::File(f) => f.read_exact(buf),
            ReaderBackend::Stream(s) => s.read_exact(buf),
        };
        match res {
            Ok(()) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::invalid("unexpected end of stream"))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn get_byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn get_be32(&mut self) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_exact(&mut word)?;
        Ok(BigEndian::read_u32(&word))
    }

    pub fn get_be64(&mut self) -> Result<u64> {
        let mut word = [0u8; 8];
        self.read_exact(&mut word)?;
        Ok(BigEndian::read_u64(&word))
    }

    /// Read the next chunk word, or `None` on a clean end of stream (EOF
    /// landing exactly on a word boundary). EOF inside a word is malformed.
    pub fn get_be64_or_eof(&mut self) -> Result<Option<u64>> {
        let mut word = [0u8; 8];
        let mut got = 0;
        while got < 8 {
            let res = match &mut self.src {
                ReaderBackend::File(f) => f.read(&mut word[got..]),
                ReaderBackend::Stream(s) => s.read(&mut word[got..]),
            };
            match res {
                Ok(0) if got == 0 => return Ok(None),
                Ok(0) => return Err(Error::invalid("unexpected end of stream")),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.pos += 8;
        Ok(Some(BigEndian::read_u64(&word)))
    }

    pub fn get_buffer(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)
    }

    /// Logical byte offset in the stream.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Reposition the stream; file-backed sources only.
    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        match &mut self.src {
            ReaderBackend::File(f) => {
                f.seek(SeekFrom::Start(pos)).map_err(Error::Io)?;
                self.pos = pos;
                Ok(())
            }
            ReaderBackend::Stream(_) => {
                Err(Error::invalid("raw layout requires a seekable source"))
            }
        }
    }

    /// Descriptor backing a file source, for the mmap restore path.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.src {
            ReaderBackend::File(f) => Some(f.get_ref().as_raw_fd()),
            ReaderBackend::Stream(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SinkCounter {
        written: Arc<AtomicU64>,
    }

    impl Transport for SinkCounter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
            Ok(buf.len())
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Transport for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"))
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn writer_with_limit(xport: Box<dyn Transport>, limit: u64) -> StreamWriter {
        StreamWriter::new(xport, Arc::new(AtomicU64::new(limit)), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn primitives_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");
        let mut w = StreamWriter::file(File::create(&path).unwrap());
        w.put_be64(0xdead_beef_0123_4567);
        w.put_byte(0x7f);
        w.put_be32(0x0badf00d);
        w.put_buffer(b"idstr");
        w.close().unwrap();

        let mut r = StreamReader::from_file(File::open(&path).unwrap());
        assert_eq!(r.get_be64().unwrap(), 0xdead_beef_0123_4567);
        assert_eq!(r.get_byte().unwrap(), 0x7f);
        assert_eq!(r.get_be32().unwrap(), 0x0badf00d);
        let mut id = [0u8; 5];
        r.get_buffer(&mut id).unwrap();
        assert_eq!(&id, b"idstr");
        assert_eq!(r.tell(), 8 + 1 + 4 + 5);
        assert!(matches!(r.get_byte(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn blob_pos_is_logical_not_physical() {
        let written = Arc::new(AtomicU64::new(0));
        let mut w = writer_with_limit(Box::new(SinkCounter { written: written.clone() }), MAX_THROTTLE);
        w.put_be64(1);
        w.put_byte(2);
        // Still buffered: nothing has physically moved.
        assert_eq!(w.blob_pos(), 9);
        assert_eq!(w.flushed_bytes(), 0);
        assert_eq!(written.load(Ordering::SeqCst), 0);
        w.flush().unwrap();
        assert_eq!(w.flushed_bytes(), 9);
        assert_eq!(written.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn set_blob_pos_seeks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse");
        let mut w = StreamWriter::file(File::create(&path).unwrap());
        w.put_buffer(b"head");
        w.set_blob_pos(4096).unwrap();
        assert_eq!(w.blob_pos(), 4096);
        w.put_buffer(b"tail");
        w.close().unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 4100);
        assert_eq!(&data[..4], b"head");
        assert_eq!(&data[4096..], b"tail");
    }

    #[test]
    fn first_error_is_latched() {
        let mut w = writer_with_limit(Box::new(BrokenSink), MAX_THROTTLE);
        w.put_buffer(&[0u8; IO_BUF_SIZE]);
        assert_eq!(w.get_error(), Some(io::ErrorKind::ConnectionReset));
        // Later writes are no-ops and checkpoints keep reporting the error.
        w.put_be64(7);
        assert!(matches!(w.rate_limit(), Err(Error::Io(_))));
        assert!(w.close().is_err());
    }

    #[test]
    fn shutdown_stops_writes() {
        let written = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut w = StreamWriter::new(
            Box::new(SinkCounter { written: written.clone() }),
            Arc::new(AtomicU64::new(MAX_THROTTLE)),
            shutdown.clone(),
        );
        w.put_byte(1);
        w.flush().unwrap();
        shutdown.store(true, Ordering::SeqCst);
        w.put_byte(2);
        assert!(w.get_error().is_some());
        let _ = w.close();
        assert_eq!(written.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_limit_trips_and_recovers() {
        // 100 bytes/s -> 10 bytes per window.
        let mut w = writer_with_limit(Box::new(SinkCounter { written: Arc::new(AtomicU64::new(0)) }), 100);
        assert!(!w.rate_limit().unwrap());
        w.put_buffer(&[0u8; 11]);
        assert!(w.rate_limit().unwrap());
        w.rate_wait();
        assert!(!w.rate_limit().unwrap());
    }

    #[test]
    fn offset_word_decode() {
        let word = 0x2000u64 | RamSaveFlags::PAGE.bits() | RamSaveFlags::CONTINUE.bits();
        let (offset, flags) = split_offset_word(word);
        assert_eq!(offset, 0x2000);
        assert!(flags.contains(RamSaveFlags::PAGE));
        assert!(flags.contains(RamSaveFlags::CONTINUE));
        assert!(!flags.contains(RamSaveFlags::EOS));
    }
}
