//! Locating, querying, and rewriting the on-flash bad block table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, trace, warn};

use crate::metadata::BadBlockConfig;
use crate::nand::client::NandClient;
use crate::nand::{NandController, NandGeometry};
use crate::{Error, Result};

use super::header::{OobHeader, BBT_MAGIC};

/// Hard cap on the number of reserved blocks eligible to host the table.
pub const BLOCK_LIST_MAX: usize = 8;

/// How many successive strides the scan probes before giving a reserved
/// block up as unreadable.
const SCAN_PROBES: u32 = 6;

/// Per-block health, one byte per device block on flash. Any nonzero byte
/// counts as bad.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum BlockStatus {
    Good = 0,
    Bad = 1,
}

impl From<u8> for BlockStatus {
    fn from(raw: u8) -> Self {
        if raw == BlockStatus::Good as u8 {
            Self::Good
        } else {
            Self::Bad
        }
    }
}

/// One reserved block eligible to host a table copy.
#[derive(Debug, Copy, Clone)]
struct BlockListEntry {
    block: u32,
    program_erase_cycles: u16,
    valid: bool,
}

/// What one entry position in the active block turned out to hold.
enum EntryKind {
    Unreadable,
    NotTable,
    Valid(u16),
}

/// Cursor and table state, all guarded by the store mutex. The client's
/// single pair of transfer regions is covered by the same lock.
struct Inner {
    client: NandClient,
    config: BadBlockConfig,
    table: Vec<BlockStatus>,
    block_list: Vec<BlockListEntry>,
    active: Option<usize>,
    next_page: u32,
    generation: u16,
    found: bool,
}

/// Owns the on-flash bad block table for one device.
///
/// Shared by every partition on the device. All methods serialize on one
/// internal mutex; the first query triggers the scan, and a failed scan
/// leaves the store uninitialized so a later query retries from scratch.
pub struct BadBlockStore {
    inner: Mutex<Inner>,
}

impl BadBlockStore {
    /// Build an empty store against the parent controller. No flash I/O
    /// happens until the first query.
    pub fn new(parent: Arc<dyn NandController>, config: BadBlockConfig) -> Arc<Self> {
        let (geometry, _) = parent.query();
        let table_len = geometry.num_blocks as usize;
        let page_size = geometry.page_size as usize;
        // The data region spans whole pages; the tail past the table is
        // zero padding.
        let data_len = table_len.div_ceil(page_size).max(1) * page_size;
        Arc::new(Self {
            inner: Mutex::new(Inner {
                client: NandClient::new(parent, data_len, OobHeader::SIZE),
                config,
                table: vec![BlockStatus::Good; table_len],
                block_list: Vec::new(),
                active: None,
                next_page: 0,
                generation: 0,
                found: false,
            }),
        })
    }

    /// Device-global indices of bad blocks within `[first_block, last_block)`.
    pub fn get_bad_block_list(&self, first_block: u32, last_block: u32) -> Result<Vec<u32>> {
        let mut inner = self.lock();
        inner.ensure_found()?;

        let limit = inner.table.len() as u32;
        if first_block > limit || last_block > limit {
            return Err(Error::InvalidArgs("bad block query outside table"));
        }

        let list: Vec<u32> = (first_block..last_block)
            .filter(|&block| inner.table[block as usize] != BlockStatus::Good)
            .collect();
        trace!(
            "bad blocks in [{first_block}, {last_block}): {}",
            list.len()
        );
        Ok(list)
    }

    /// Is the given device block marked bad?
    pub fn is_block_bad(&self, block: u32) -> Result<bool> {
        let mut inner = self.lock();
        inner.ensure_found()?;
        inner.check_block(block)?;
        Ok(inner.table[block as usize] != BlockStatus::Good)
    }

    /// Mark a device block bad and persist a new table generation.
    /// Idempotent when the block is already bad.
    ///
    /// When the reserved set is exhausted the persist fails with
    /// [`Error::NotFound`]; the in-memory mark is not rolled back.
    pub fn mark_block_bad(&self, block: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_found()?;
        inner.check_block(block)?;

        if inner.table[block as usize] != BlockStatus::Good {
            return Ok(());
        }
        inner.table[block as usize] = BlockStatus::Bad;
        inner.write_table(false)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn geometry(&self) -> &NandGeometry {
        self.client.geometry()
    }

    /// Pages one table copy occupies.
    fn page_stride(&self) -> u32 {
        (self.table.len() as u32).div_ceil(self.geometry().page_size)
    }

    fn check_block(&self, block: u32) -> Result<()> {
        let limit = self.table.len() as u32;
        if block >= limit {
            return Err(Error::OutOfRange {
                index: block.into(),
                limit: limit.into(),
            });
        }
        Ok(())
    }

    fn ensure_found(&mut self) -> Result<()> {
        if self.found {
            return Ok(());
        }
        self.find_table()
    }

    /// Read one page into the data region at page slot `data_offset` and
    /// decode its OOB header.
    fn read_page(&self, nand_page: u32, data_offset: u32) -> Result<OobHeader> {
        self.client.read_page(nand_page, data_offset)?;
        let oob = self.client.oob_bytes()?;
        OobHeader::decode(&oob).ok_or(Error::Internal("oob region shorter than header"))
    }

    /// Classify the table entry whose first page is `nand_page`.
    fn read_entry(&self, nand_page: u32, stride: u32) -> EntryKind {
        let mut generation = 0;
        for i in 0..stride {
            match self.read_page(nand_page + i, i) {
                Err(_) => return EntryKind::Unreadable,
                Ok(header) if !header.is_bbt() => return EntryKind::NotTable,
                Ok(header) => generation = header.generation,
            }
        }
        EntryKind::Valid(generation)
    }

    /// Scan the reserved range, select the block holding the newest table,
    /// and pull its latest complete copy into memory.
    fn find_table(&mut self) -> Result<()> {
        trace!("locating bad block table");
        let geometry = *self.geometry();

        if OobHeader::SIZE > geometry.oob_size as usize {
            error!(
                "oob too small for table header: need {}, found {}",
                OobHeader::SIZE,
                geometry.oob_size
            );
            return Err(Error::NotSupported("oob area cannot hold a table header"));
        }

        let BadBlockConfig {
            table_start_block,
            table_end_block,
        } = self.config;
        trace!("table reserved in blocks [{table_start_block}, {table_end_block}]");

        if table_end_block <= table_start_block || table_end_block >= geometry.num_blocks {
            error!("unsupported reserved range for the bad block table");
            return Err(Error::NotSupported("reserved table range is malformed"));
        }
        if (table_end_block - table_start_block + 1) as usize > BLOCK_LIST_MAX {
            error!("unsupported number of blocks reserved for the bad block table");
            return Err(Error::NotSupported("reserved table range exceeds slot cap"));
        }

        let stride = self.page_stride();
        let ppb = geometry.pages_per_block;

        self.block_list.clear();
        self.active = None;
        self.generation = 0;

        for block in table_start_block..=table_end_block {
            // Probe a handful of entry positions to decide whether the
            // block is readable at all.
            let mut header = None;
            for probe in 0..SCAN_PROBES {
                let offset = probe * stride;
                if offset >= ppb {
                    break;
                }
                if let Ok(h) = self.read_page(block * ppb + offset, 0) {
                    header = Some(h);
                    break;
                }
            }
            let Some(header) = header else {
                // Untrustworthy; leave it out of the slot list entirely.
                warn!("unable to read any pages in reserved block {block}");
                continue;
            };
            trace!("reserved block {block} is readable");

            self.block_list.push(BlockListEntry {
                block,
                program_erase_cycles: header.program_erase_cycles,
                valid: true,
            });

            if header.is_bbt() && header.generation >= self.generation {
                trace!("block {block} holds table generation {}", header.generation);
                self.active = Some(self.block_list.len() - 1);
                self.generation = header.generation;
            }
        }

        let Some(active) = self.active else {
            error!("no valid bad block table found in reserved range");
            return Err(Error::Internal("no valid bad block table copies"));
        };
        let active_block = self.block_list[active].block;

        // Walk the active block for the newest complete copy. Unreadable
        // positions are tolerated as long as a later one is intact.
        trace!("searching block {active_block} for the newest table entry");
        let mut found_one = false;
        let mut latest_entry_bad = true;
        let mut page = 0;
        while page + stride <= ppb {
            match self.read_entry(active_block * ppb + page, stride) {
                EntryKind::Unreadable => {
                    trace!("unreadable table entry at page {page}");
                    latest_entry_bad = true;
                }
                EntryKind::NotTable => break,
                EntryKind::Valid(generation) => {
                    latest_entry_bad = false;
                    found_one = true;
                    self.next_page = page;
                    self.generation = generation.wrapping_add(1);
                }
            }
            page += stride;
        }

        if !found_one {
            error!("unable to find a complete copy of the bad block table");
            return Err(Error::Internal("no complete table copy in active block"));
        }

        // The regions hold whatever the walk last read, so pull the newest
        // copy back in before trusting it.
        for i in 0..stride {
            let nand_page = active_block * ppb + self.next_page + i;
            let header = self.read_page(nand_page, i).map_err(|err| {
                error!("unable to re-read latest copy of the bad block table");
                err
            })?;
            if !header.is_bbt() {
                error!("latest copy of the bad block table went invalid");
                return Err(Error::Internal("latest table copy went unreadable"));
            }
        }
        self.load_table()?;

        if latest_entry_bad {
            warn!("newest entry in block {active_block} is damaged, moving the table");
            self.write_table(true)?;
        } else {
            info!("newest table entry found in page {}", self.next_page);
            self.next_page += stride;
        }

        self.found = true;
        Ok(())
    }

    /// Replace the in-memory table with the data region contents.
    fn load_table(&mut self) -> Result<()> {
        let mut bytes = vec![0u8; self.table.len()];
        self.client.copy_data(0, &mut bytes)?;
        for (status, raw) in self.table.iter_mut().zip(bytes) {
            *status = BlockStatus::from(raw);
        }
        Ok(())
    }

    /// Serialize the in-memory table into the data region.
    fn store_table(&self) -> Result<()> {
        let bytes: Vec<u8> = self.table.iter().map(|&status| status as u8).collect();
        self.client.fill_data(&bytes)
    }

    /// Commit the in-memory table as a new generation. Retries inside the
    /// reserved set, demoting blocks that fail to program; only exhaustion
    /// of the set surfaces an error.
    fn write_table(&mut self, mut use_new_block: bool) -> Result<()> {
        let stride = self.page_stride();
        let ppb = self.geometry().pages_per_block;

        loop {
            let active = self.active.ok_or(Error::Internal("no active table slot"))?;
            let active_block = self.block_list[active].block;
            if use_new_block
                || self.table[active_block as usize] != BlockStatus::Good
                || self.next_page + stride > ppb
            {
                // The current home is bad or full; rotate to a fresh block.
                use_new_block = false;
                info!("finding a new block to store the bad block table");
                self.allocate_slot()?;
            }

            let active = self.active.ok_or(Error::Internal("no active table slot"))?;
            let entry = self.block_list[active];
            self.store_table()?;
            self.client.set_oob_bytes(
                &OobHeader {
                    magic: BBT_MAGIC,
                    program_erase_cycles: entry.program_erase_cycles,
                    generation: self.generation,
                }
                .encode(),
            )?;

            let mut wrote_all = true;
            for i in 0..stride {
                let nand_page = entry.block * ppb + self.next_page + i;
                if let Err(err) = self.client.write_page(nand_page, i) {
                    warn!(
                        "table write to block {} failed ({err}), marking bad",
                        entry.block
                    );
                    self.table[entry.block as usize] = BlockStatus::Bad;
                    wrote_all = false;
                    break;
                }
                trace!(
                    "table write to block {} page {} complete",
                    entry.block,
                    self.next_page + i
                );
            }
            if wrote_all {
                break;
            }
        }

        self.next_page += stride;
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    /// Pick the least-worn readable slot other than the active one, erase
    /// it, and make it active.
    fn allocate_slot(&mut self) -> Result<()> {
        loop {
            let mut candidate: Option<usize> = None;
            for (index, entry) in self.block_list.iter().enumerate() {
                if !entry.valid || Some(index) == self.active {
                    continue;
                }
                let better = match candidate {
                    Some(best) => {
                        entry.program_erase_cycles < self.block_list[best].program_erase_cycles
                    }
                    None => true,
                };
                if better {
                    candidate = Some(index);
                }
            }
            let Some(index) = candidate else {
                error!("no usable block left to store the bad block table");
                return Err(Error::NotFound);
            };

            let block = self.block_list[index].block;
            if self.table[block as usize] != BlockStatus::Good {
                self.block_list[index].valid = false;
                continue;
            }

            if let Err(err) = self.client.erase_block(block) {
                warn!("failed to erase block {block} ({err}), marking bad");
                self.table[block as usize] = BlockStatus::Bad;
                self.block_list[index].valid = false;
                continue;
            }

            info!("moving bad block table to block {block}");
            self.active = Some(index);
            let entry = &mut self.block_list[index];
            entry.program_erase_cycles = entry.program_erase_cycles.wrapping_add(1);
            self.next_page = 0;
            return Ok(());
        }
    }
}
