use std::fmt;
use std::io;

/// Guest page size. Fixed per build; every region length and every wire
/// offset is a multiple of this.
pub const PAGE_SIZE: usize = 4096;
/// Mask that strips the flag bits out of a wire offset word.
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Default outgoing bandwidth throttle: 32 MiB/s.
pub const MAX_THROTTLE: u64 = 32 << 20;
/// Default downtime bound for live convergence, in nanoseconds (30 ms).
/// Nanoseconds because that is the resolution of the round timer; all
/// user-visible units are seconds.
pub const DEFAULT_MAX_DOWNTIME_NS: u64 = 30_000_000;
/// Seed for the raw-layout page shuffle. Constant so that two saves of the
/// same registry produce byte-identical streams on any host.
pub const RAW_SHUFFLE_SEED: u64 = 12345;
/// Capacity of the load-side mmap bookkeeping table. These mappings live
/// until a well-defined shutdown point, so the table never grows.
pub const MMAP_TABLE_LEN: usize = 16;

/// Stream prologue: magic plus format version. Version 4 is the only
/// version this engine reads or writes.
pub const STREAM_MAGIC: u32 = 0x524d_4d47; // "RMMG"
pub const STREAM_VERSION: u32 = 4;

/// Layout selected for a save session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RawMode {
    /// Iterative pre-copy in the chunked live layout.
    None,
    /// One-shot page-aligned snapshot, suitable for mmap restore.
    Suspend,
    /// Iterative pre-copy in the page-aligned raw layout, driven by an
    /// external iterate/stop controller.
    Live,
}

/// Migration session state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MigState {
    Setup,
    Active,
    Completed,
    Cancelled,
    Error,
}

impl MigState {
    /// User-visible status string; `Setup` reports nothing because no
    /// migration has ever happened.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            MigState::Setup => None,
            MigState::Active => Some("active"),
            MigState::Completed => Some("completed"),
            MigState::Cancelled => Some("cancelled"),
            MigState::Error => Some("failed"),
        }
    }
}

/// Byte counters reported by `query_migrate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferStats {
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
}

/// Result of `query_migrate`. `disk` is populated by the block-migration
/// collaborator, which is outside this engine; it stays `None` here.
#[derive(Debug, Clone, Default)]
pub struct MigrationInfo {
    pub status: Option<&'static str>,
    pub ram: Option<XferStats>,
    pub disk: Option<XferStats>,
}

#[derive(Debug)]
pub enum Error {
    /// Malformed stream or registration: bad header, unknown region,
    /// length or version mismatch, CONTINUE with no prior region.
    InvalidInput(String),
    /// Transport read/write failure. EINTR is retried and EAGAIN waits for
    /// writable-readiness before this is ever surfaced.
    Io(io::Error),
    /// A second `migrate()` while a session is ongoing.
    MigrationActive,
    /// A registered blocker rejected the migration before any transport
    /// work was done.
    Blocked(String),
    /// Unrecoverable load-side failure: mmap failure or mmap table
    /// overflow.
    Fatal(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Error { Error::InvalidInput(msg.into()) }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid migration stream: {}", msg),
            Error::Io(err) => write!(f, "transport error: {}", err),
            Error::MigrationActive => write!(f, "a migration is already in progress"),
            Error::Blocked(reason) => write!(f, "migration is blocked: {}", reason),
            Error::Fatal(msg) => write!(f, "fatal load error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error { Error::Io(err) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_fit_under_page_alignment() {
        // All wire flags must fit in the bits a page-aligned offset leaves
        // free, or offsets and flags would alias.
        assert_eq!(PAGE_MASK & 0x7f, 0);
        assert_eq!(PAGE_SIZE % 8, 0);
    }

    #[test]
    fn status_strings() {
        assert_eq!(MigState::Setup.as_str(), None);
        assert_eq!(MigState::Active.as_str(), Some("active"));
        assert_eq!(MigState::Error.as_str(), Some("failed"));
        assert_eq!(MigState::Cancelled.as_str(), Some("cancelled"));
        assert_eq!(MigState::Completed.as_str(), Some("completed"));
    }
}
