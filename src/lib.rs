//! # rammig - guest RAM snapshot and migration engine
//!
//! Serializes a set of named, page-aligned guest memory regions to a byte
//! stream and restores them at a destination. Three modes:
//!
//! * **Live** - iterative pre-copy of dirty pages in a chunked layout, with
//!   bandwidth budgeting, converging once the estimated residue fits under
//!   a downtime bound.
//! * **Raw suspend** - one-shot page-aligned snapshot, restored by mapping
//!   the snapshot file directly over the guest's host pages.
//! * **Raw live** - iterative pre-copy in the raw layout, with an external
//!   driver deciding when to iterate and when to stop.
//!
//! ## Glossary
//!
//! * Region / RAM block - a named, page-aligned contiguous slice of guest
//!   physical memory mapped into host memory.
//! * idstr - the region's wire identifier, at most 255 bytes.
//! * Dirty bit (migration tag) - per-page flag set when the guest writes,
//!   cleared by the save engine when it transmits the page.
//! * Blob position - logical offset in the output stream, used for page
//!   alignment in raw mode; distinct from the physical offset while bytes
//!   sit in the write buffer.
//!
//! ## Code organization
//!
//! * [`ram`] - regions, the registry, dirty tracking, the dup-page scanner.
//! * [`codec`] - wire framing, buffered rate-limited writer, reader.
//! * [`save`] - the live and raw save state machines.
//! * [`load`] - the restore path, including mmap-based raw restore.
//! * [`migrate`] - the controller: session admission, state machine,
//!   notifiers, the raw-live driver handshake, control operations.
//! * [`transport`] - URI-selected transports and their capability set.
//!
//! Unix-only: raw restore and zero-page discard go through mmap/madvise.

pub mod api;
pub mod codec;
pub mod load;
pub mod migrate;
pub mod ram;
pub mod save;
pub mod transport;

pub use api::{
    Error, MigState, MigrationInfo, RawMode, Result, XferStats, DEFAULT_MAX_DOWNTIME_NS,
    MAX_THROTTLE, MMAP_TABLE_LEN, PAGE_MASK, PAGE_SIZE, RAW_SHUFFLE_SEED,
};
pub use load::MmapTable;
pub use migrate::{start_incoming_migration, GuestHooks, MigrationController, RunState};
pub use ram::{is_dup_page, DirtyLogBackend, DirtyTag, RamRegion, RamRegistry};
pub use save::{RamSaver, SaveStage};
