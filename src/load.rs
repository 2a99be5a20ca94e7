//! Restoring a migration stream into the local registry.
//!
//! One entry point reads both layouts: the chunk flags decide whether a
//! page is memcpy'd/memset into host memory (live layout) or a whole region
//! is mapped in place from the snapshot file (raw layout). Raw restore
//! requires a seekable, fd-backed source; that trade is what buys lazy
//! fault-in of guest pages after restore.

use crate::api::{Error, Result, MMAP_TABLE_LEN, PAGE_SIZE, STREAM_VERSION};
use crate::codec::{split_offset_word, RamSaveFlags, StreamReader};
use crate::ram::RamRegistry;

struct MmapEntry {
    addr: *mut u8,
    length: usize,
}

/// Bookkeeping for the fixed-address restore mappings. The table is bounded
/// because these mappings live for the rest of the process and are torn
/// down in one place; overflowing it is a hard error, not a growth event.
pub struct MmapTable {
    entries: Vec<MmapEntry>,
}

// Entries are addresses of mappings the loader owns until teardown.
unsafe impl Send for MmapTable {}

impl MmapTable {
    pub fn new() -> MmapTable {
        MmapTable { entries: Vec::with_capacity(MMAP_TABLE_LEN) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, addr: *mut u8, length: usize) -> Result<()> {
        if self.entries.len() >= MMAP_TABLE_LEN {
            return Err(Error::Fatal("mmap table overflow"));
        }
        self.entries.push(MmapEntry { addr, length });
        Ok(())
    }

    /// Tear down every restore mapping. Call this only at the shutdown
    /// point: the guest regions become unmapped.
    pub fn unmap_all(&mut self) {
        for entry in self.entries.drain(..) {
            unsafe {
                libc::munmap(entry.addr as *mut libc::c_void, entry.length);
            }
        }
    }
}

/// Read the MEM_SIZE region table and check it against the local registry:
/// every named region must exist here with a matching length, and the
/// per-region lengths must add up to the advertised total.
fn load_region_table(f: &mut StreamReader, regs: &RamRegistry, total_ram_bytes: u64) -> Result<()> {
    let mut remaining = total_ram_bytes;
    while remaining > 0 {
        let id = read_idstr(f)?;
        let length = f.get_be64()?;
        match regs.find(&id) {
            Some(index) if regs.get(index).len() as u64 == length => {}
            Some(index) => {
                return Err(Error::invalid(format!(
                    "region \"{}\" length mismatch: stream {} vs local {}",
                    id,
                    length,
                    regs.get(index).len()
                )));
            }
            None => {
                return Err(Error::invalid(format!(
                    "unknown ramblock \"{}\", cannot accept migration",
                    id
                )));
            }
        }
        if length > remaining {
            return Err(Error::invalid(format!(
                "region \"{}\" overruns the advertised total ram size",
                id
            )));
        }
        remaining -= length;
    }
    Ok(())
}

fn read_idstr(f: &mut StreamReader) -> Result<String> {
    let len = f.get_byte()? as usize;
    let mut id = vec![0u8; len];
    f.get_buffer(&mut id)?;
    String::from_utf8(id).map_err(|_| Error::invalid("region idstr is not valid utf-8"))
}

/// Resolve the region a PAGE/COMPRESS chunk targets. A chunk without
/// CONTINUE names its region; with CONTINUE the previous one is reused.
fn resolve_chunk_region(
    f: &mut StreamReader,
    regs: &RamRegistry,
    current: &mut Option<usize>,
    flags: RamSaveFlags,
) -> Result<usize> {
    if flags.contains(RamSaveFlags::CONTINUE) {
        return current.ok_or_else(|| Error::invalid("CONTINUE chunk with no prior region"));
    }
    let id = read_idstr(f)?;
    let index = regs
        .find(&id)
        .ok_or_else(|| Error::invalid(format!("chunk names unknown region \"{}\"", id)))?;
    *current = Some(index);
    Ok(index)
}

/// Restore a stream into `regs`. `version` is the stream version from the
/// prologue; only version 4 loads. Raw-layout mappings are recorded in
/// `table` for teardown at shutdown.
pub fn ram_load(
    f: &mut StreamReader,
    regs: &mut RamRegistry,
    version: u32,
    table: &mut MmapTable,
) -> Result<()> {
    if version != STREAM_VERSION {
        return Err(Error::invalid(format!("unsupported stream version {}", version)));
    }

    let mut current_region: Option<usize> = None;
    let mut at_round_boundary = false;

    // The save side emits one EOS per round (every live stage ends with
    // one); the stream as a whole ends at EOF on a round boundary. Loader
    // state, including the CONTINUE region, persists across rounds.
    loop {
        let word = match f.get_be64_or_eof()? {
            Some(word) => word,
            None if at_round_boundary => break,
            None => return Err(Error::invalid("stream ended without EOS")),
        };
        let (addr, flags) = split_offset_word(word);
        at_round_boundary = flags.contains(RamSaveFlags::EOS);

        if flags.contains(RamSaveFlags::MEM_SIZE) {
            // The offset bits of the header word carry the total RAM size.
            load_region_table(f, regs, addr)?;
        }

        if flags.contains(RamSaveFlags::RAW) {
            let id = read_idstr(f)?;
            // Padding up to the next page boundary, mirroring the writer's
            // arithmetic (a full page when already aligned).
            let mut padding = PAGE_SIZE as u64 - (f.tell() & (PAGE_SIZE as u64 - 1));
            while padding > 0 {
                f.get_byte()?;
                padding -= 1;
            }
            let index = regs
                .find(&id)
                .ok_or_else(|| Error::invalid(format!("raw chunk names unknown region \"{}\"", id)))?;
            map_region_from_stream(f, regs, index, table)?;
        }

        if flags.contains(RamSaveFlags::COMPRESS) {
            let index = resolve_chunk_region(f, regs, &mut current_region, flags)?;
            check_page_bounds(regs, index, addr)?;
            let fill = f.get_byte()?;
            let region = regs.get_mut(index);
            region.fill_page(addr as usize, fill);
            if fill == 0 {
                // Zero pages should not occupy physical memory; tell the
                // kernel to drop them (anonymous private maps read back as
                // zeros afterwards).
                unsafe {
                    libc::madvise(
                        region.host_ptr().add(addr as usize) as *mut libc::c_void,
                        PAGE_SIZE,
                        libc::MADV_DONTNEED,
                    );
                }
            }
        } else if flags.contains(RamSaveFlags::PAGE) {
            let index = resolve_chunk_region(f, regs, &mut current_region, flags)?;
            check_page_bounds(regs, index, addr)?;
            let page = regs.get_mut(index).page_mut(addr as usize);
            f.get_buffer(page)?;
        }

    }

    Ok(())
}

fn check_page_bounds(regs: &RamRegistry, index: usize, addr: u64) -> Result<()> {
    if addr as usize + PAGE_SIZE > regs.get(index).len() {
        return Err(Error::invalid(format!(
            "page offset {} out of bounds for region \"{}\"",
            addr,
            regs.get(index).idstr()
        )));
    }
    Ok(())
}

/// Map `region.length` bytes of the snapshot file, at the stream's current
/// byte offset, over the region's host pages, then step the stream past
/// the page array.
fn map_region_from_stream(
    f: &mut StreamReader,
    regs: &mut RamRegistry,
    index: usize,
    table: &mut MmapTable,
) -> Result<()> {
    let fd = match f.raw_fd() {
        Some(fd) => fd,
        None => return Err(Error::invalid("raw layout requires a seekable source")),
    };
    let offset = f.tell();
    let length = regs.get(index).len();
    let host = regs.get(index).host_ptr();

    let mapped = unsafe {
        libc::mmap(
            host as *mut libc::c_void,
            length,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if mapped == libc::MAP_FAILED {
        log::error!(
            "mmap of region \"{}\" failed: {}",
            regs.get(index).idstr(),
            std::io::Error::last_os_error()
        );
        return Err(Error::Fatal("mmap of raw region failed"));
    }
    table.record(mapped as *mut u8, length)?;
    log::debug!(
        "mapped region \"{}\" from stream offset {} over {:p}",
        regs.get(index).idstr(),
        offset,
        host
    );

    f.seek_to(offset + length as u64)
}

/// Load-side session boundary: validate the prologue, then restore the
/// stream. Returns the mmap table so raw mappings can be torn down at a
/// well-defined shutdown point (empty for live streams).
pub fn process_incoming(f: &mut StreamReader, regs: &mut RamRegistry) -> Result<MmapTable> {
    let version = crate::codec::read_stream_header(f)?;
    let mut table = MmapTable::new();
    ram_load(f, regs, version, &mut table)?;
    log::info!("incoming migration stream loaded ({} raw mappings)", table.len());
    Ok(table)
}
