//! The two save paths.
//!
//! Live: iterative pre-copy in the chunked layout. A round-robin cursor
//! walks the sorted registry, sending each dirty page as a COMPRESS chunk
//! (single-byte fill) or a PAGE chunk, until the rate budget is spent. The
//! controller keeps iterating until the estimated remaining downtime fits
//! under the configured bound, then drives the final drain.
//!
//! Raw: page-aligned fixed layout for mmap restore. The top half lays every
//! region's pages out contiguously at page-aligned file offsets, writing
//! them in a seeded-PRNG random order so that an aborted iteration leaves a
//! uniform random sample of pages behind rather than a prefix. The bottom
//! half overwrites re-dirtied pages in place on each later iteration.

use std::time::Instant;

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use crate::api::{Result, PAGE_SIZE, RAW_SHUFFLE_SEED};
use crate::codec::{RamSaveFlags, StreamWriter};
use crate::ram::{is_dup_page, DirtyTag, RamRegistry};

/// Save stage, as driven by the controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SaveStage {
    Setup,
    Iterate,
    Final,
    Abort,
}

#[derive(Default)]
struct Cursor {
    /// Region index of the last transmitted page; `None` before the first.
    region: Option<usize>,
    offset: usize,
}

/// Per-session save state: the round-robin cursor, transfer accounting, and
/// the raw-layout bookkeeping shared between the top and bottom halves.
pub struct RamSaver {
    cursor: Cursor,
    bytes_transferred: u64,
    dirty_log_started: bool,
    raw_last_blob_pos: u64,
    raw_iterations: u32,
}

impl RamSaver {
    pub fn new() -> RamSaver {
        RamSaver {
            cursor: Cursor::default(),
            bytes_transferred: 0,
            dirty_log_started: false,
            raw_last_blob_pos: 0,
            raw_iterations: 0,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Cleanup hook: any session that started dirty logging must stop it,
    /// whichever way the session ends.
    pub fn abort(&mut self, regs: &mut RamRegistry) {
        if self.dirty_log_started {
            regs.global_stop();
            self.dirty_log_started = false;
        }
    }

    /// One stage of the live save. Returns `true` when the session has
    /// converged: iterating, and the downtime estimate for the residue fits
    /// under `max_downtime_ns`.
    pub fn live(
        &mut self,
        f: &mut StreamWriter,
        regs: &mut RamRegistry,
        stage: SaveStage,
        max_downtime_ns: u64,
    ) -> Result<bool> {
        if let SaveStage::Abort = stage {
            self.abort(regs);
            return Ok(false);
        }

        regs.global_sync();

        if let SaveStage::Setup = stage {
            self.bytes_transferred = 0;
            self.cursor = Cursor::default();
            // Both hosts must walk regions in the same order.
            regs.sort_by_idstr();

            // Seed: every page starts dirty.
            for region in regs.iter_mut() {
                let length = region.len();
                region.set_dirty(0, length);
            }
            regs.global_start();
            self.dirty_log_started = true;

            f.put_be64(regs.total_bytes() | RamSaveFlags::MEM_SIZE.bits());
            for region in regs.iter() {
                f.put_byte(region.idstr().len() as u8);
                f.put_buffer(region.idstr().as_bytes());
                f.put_be64(region.len() as u64);
            }
            log::info!(
                "live save setup: {} regions, {} bytes total",
                regs.len(),
                regs.total_bytes()
            );
        }

        let bytes_round_start = self.bytes_transferred;
        let round_start = Instant::now();

        while !f.rate_limit()? {
            let sent = self.save_one_page(f, regs);
            self.bytes_transferred += sent as u64;
            if sent == 0 {
                break;
            }
        }

        let mut elapsed_ns = round_start.elapsed().as_nanos() as u64;
        if elapsed_ns == 0 {
            elapsed_ns = 1;
        }
        let mut bwidth = (self.bytes_transferred - bytes_round_start) as f64 / elapsed_ns as f64;
        if bwidth == 0.0 {
            // Nothing moved this round; keep the estimate finite.
            bwidth = 0.000001;
        }

        if let SaveStage::Final = stage {
            // Drain every remaining dirty page regardless of rate limiting.
            loop {
                let sent = self.save_one_page(f, regs);
                if sent == 0 {
                    break;
                }
                self.bytes_transferred += sent as u64;
            }
            regs.global_stop();
            self.dirty_log_started = false;
        }

        f.put_be64(RamSaveFlags::EOS.bits());
        f.check_error()?;

        let expected_ns = (regs.remaining_bytes() as f64 / bwidth) as u64;
        log::trace!(
            "live round: {} bytes, {} pages left, expected downtime {} ns",
            self.bytes_transferred - bytes_round_start,
            regs.remaining_pages(),
            expected_ns
        );

        Ok(stage == SaveStage::Iterate && expected_ns <= max_downtime_ns)
    }

    /// Transmit the next dirty page, scanning round-robin from the cursor.
    /// Returns the bytes accounted against the bandwidth budget: 1 for a
    /// fill chunk, `PAGE_SIZE` for a full page, 0 after a full lap with
    /// nothing dirty.
    fn save_one_page(&mut self, f: &mut StreamWriter, regs: &mut RamRegistry) -> usize {
        if regs.is_empty() {
            return 0;
        }
        let mut region = self.cursor.region.unwrap_or(0);
        let mut offset = self.cursor.offset;
        let lap_start = (region, offset);

        loop {
            if regs.get_dirty(region, offset, PAGE_SIZE, DirtyTag::Migration) {
                regs.reset_dirty(region, offset, PAGE_SIZE, DirtyTag::Migration);

                let cont = if self.cursor.region == Some(region) {
                    RamSaveFlags::CONTINUE
                } else {
                    RamSaveFlags::empty()
                };
                let r = regs.get(region);
                let page = r.page(offset);
                let sent = if is_dup_page(page) {
                    f.put_be64(offset as u64 | (cont | RamSaveFlags::COMPRESS).bits());
                    if cont.is_empty() {
                        f.put_byte(r.idstr().len() as u8);
                        f.put_buffer(r.idstr().as_bytes());
                    }
                    f.put_byte(page[0]);
                    1
                } else {
                    f.put_be64(offset as u64 | (cont | RamSaveFlags::PAGE).bits());
                    if cont.is_empty() {
                        f.put_byte(r.idstr().len() as u8);
                        f.put_buffer(r.idstr().as_bytes());
                    }
                    f.put_buffer(page);
                    PAGE_SIZE
                };

                self.cursor.region = Some(region);
                self.cursor.offset = offset;
                return sent;
            }

            offset += PAGE_SIZE;
            if offset >= regs.get(region).len() {
                offset = 0;
                region += 1;
                if region >= regs.len() {
                    region = 0;
                }
            }
            if (region, offset) == lap_start {
                return 0;
            }
        }
    }

    /// One-shot raw snapshot: top half only, no dirty-bit interaction.
    pub fn raw_suspend(&mut self, f: &mut StreamWriter, regs: &mut RamRegistry) -> Result<()> {
        self.raw_top_half(f, regs, false)?;
        f.put_be64(RamSaveFlags::EOS.bits());
        f.flush()
    }

    /// One stage of the raw-live save. `stop_check` is the external
    /// driver's non-blocking stop poll; it is consulted only while
    /// iterating, and returning `true` ends the session.
    pub fn raw_live(
        &mut self,
        f: &mut StreamWriter,
        regs: &mut RamRegistry,
        stage: SaveStage,
        stop_check: &mut dyn FnMut() -> bool,
    ) -> Result<bool> {
        match stage {
            SaveStage::Abort => {
                self.abort(regs);
                Ok(false)
            }
            SaveStage::Setup => {
                self.raw_iterations = 1;
                regs.global_start();
                self.dirty_log_started = true;
                self.raw_last_blob_pos = self.raw_top_half(f, regs, true)?;
                Ok(false)
            }
            SaveStage::Iterate | SaveStage::Final => {
                self.raw_iterations += 1;
                regs.global_sync();
                self.raw_bottom_half(f, regs)?;
                if stage == SaveStage::Final {
                    // The bottom half leaves the position at the last dirty
                    // page it rewrote; EOS belongs at the end of the layout.
                    f.set_blob_pos(self.raw_last_blob_pos)?;
                    f.put_be64(RamSaveFlags::EOS.bits());
                    regs.global_stop();
                    self.dirty_log_started = false;
                    return f.flush().map(|_| false);
                }
                let done = stop_check();
                if done {
                    log::info!("raw-live stop requested after {} iterations", self.raw_iterations);
                }
                Ok(done)
            }
        }
    }

    /// Raw top half: region table, then every page of every region at
    /// page-aligned positions, in a reproducible shuffled order.
    fn raw_top_half(&mut self, f: &mut StreamWriter, regs: &mut RamRegistry, live: bool) -> Result<u64> {
        f.put_be64(regs.total_bytes() | RamSaveFlags::MEM_SIZE.bits());
        for region in regs.iter() {
            f.put_byte(region.idstr().len() as u8);
            f.put_buffer(region.idstr().as_bytes());
            f.put_be64(region.len() as u64);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(RAW_SHUFFLE_SEED);
        let mut last_blob_pos = 0u64;

        for index in 0..regs.len() {
            f.put_be64(RamSaveFlags::RAW.bits());
            {
                let region = regs.get(index);
                f.put_byte(region.idstr().len() as u8);
                f.put_buffer(region.idstr().as_bytes());
            }

            // Pad so the page array lands page-aligned in the stream. The
            // padding count comes from the logical position, not the
            // physical offset, and an already-aligned position pads a full
            // page; the loader consumes padding with the same arithmetic.
            let mut padding = PAGE_SIZE as u64 - (f.blob_pos() & (PAGE_SIZE as u64 - 1));
            while padding > 0 {
                f.put_byte(0);
                padding -= 1;
            }

            let blob_pos = f.blob_pos();
            regs.get_mut(index).set_blob_pos(blob_pos);
            let num_pages = regs.get(index).num_pages();
            log::debug!(
                "raw layout: region \"{}\" at blob pos {}, {} pages",
                regs.get(index).idstr(),
                blob_pos,
                num_pages
            );

            // Fisher-Yates over the seeded PRNG; every page written exactly
            // once, at its own slot, in shuffled order.
            let mut order: Vec<u32> = (0..num_pages as u32).collect();
            for i in (1..num_pages).rev() {
                let j = (rng.next_u32() as usize) % (i + 1);
                order.swap(i, j);
            }

            for &page in &order {
                let offset = page as usize * PAGE_SIZE;
                f.set_blob_pos(blob_pos + offset as u64)?;
                if live {
                    regs.reset_dirty(index, offset, PAGE_SIZE, DirtyTag::Migration);
                }
                f.put_buffer(regs.get(index).page(offset));
            }

            last_blob_pos = blob_pos + (num_pages * PAGE_SIZE) as u64;
            f.set_blob_pos(last_blob_pos)?;
        }

        Ok(last_blob_pos)
    }

    /// Raw bottom half: overwrite re-dirtied pages in place, in ascending
    /// page order. EOS is not emitted here.
    fn raw_bottom_half(&mut self, f: &mut StreamWriter, regs: &mut RamRegistry) -> Result<()> {
        let mut count = 0u64;
        for index in 0..regs.len() {
            let length = regs.get(index).len();
            let mut offset = 0;
            while offset < length {
                if regs.get_dirty(index, offset, PAGE_SIZE, DirtyTag::Migration) {
                    f.set_blob_pos(regs.get(index).blob_pos() + offset as u64)?;
                    regs.reset_dirty(index, offset, PAGE_SIZE, DirtyTag::Migration);
                    f.put_buffer(regs.get(index).page(offset));
                    count += 1;
                }
                offset += PAGE_SIZE;
            }
        }
        log::debug!("raw bottom half rewrote {} pages", count);
        Ok(())
    }
}
