//! A simulated in-memory NAND controller, for testing purposes.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::ensure;

use crate::{Error, Result};

use super::{NandController, NandGeometry, NandOperation, NandRequest, Payload};

/// Does this slice hold the all-1s erased pattern?
fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&x| x == 0xFF)
}

#[derive(Clone)]
struct SimPage {
    data: Box<[u8]>,
    oob: Box<[u8]>,
}

struct SimState {
    /// `blocks[block][page]`; `None` is an erased page.
    blocks: Vec<Vec<Option<SimPage>>>,
    fail_read_pages: HashSet<u32>,
    fail_write_pages: HashSet<u32>,
    fail_erase_blocks: HashSet<u32>,
}

/// In-memory NAND behind the controller interface.
///
/// Erased pages read back as all-0xFF in both data and OOB, matching a
/// controller that corrects them rather than erroring. Reprogramming a
/// page without an erase fails. Read, program, and erase failures can be
/// injected per page or per block.
pub struct SimController {
    geometry: NandGeometry,
    op_size: usize,
    state: Mutex<SimState>,
}

impl SimController {
    pub fn new(geometry: NandGeometry) -> Self {
        let pages = vec![None; geometry.pages_per_block as usize];
        let blocks = vec![pages; geometry.num_blocks as usize];
        Self {
            geometry,
            op_size: std::mem::size_of::<NandOperation>(),
            state: Mutex::new(SimState {
                blocks,
                fail_read_pages: HashSet::new(),
                fail_write_pages: HashSet::new(),
                fail_erase_blocks: HashSet::new(),
            }),
        }
    }

    /// Make every read of the given absolute page fail.
    pub fn fail_read_page(&self, page: u32) {
        self.lock().fail_read_pages.insert(page);
    }

    /// Make every read within the given block fail.
    pub fn fail_reads_in_block(&self, block: u32) {
        let ppb = self.geometry.pages_per_block;
        let mut state = self.lock();
        for page in block * ppb..(block + 1) * ppb {
            state.fail_read_pages.insert(page);
        }
    }

    /// Make every program of the given absolute page fail.
    pub fn fail_write_page(&self, page: u32) {
        self.lock().fail_write_pages.insert(page);
    }

    /// Make every program within the given block fail.
    pub fn fail_writes_in_block(&self, block: u32) {
        let ppb = self.geometry.pages_per_block;
        let mut state = self.lock();
        for page in block * ppb..(block + 1) * ppb {
            state.fail_write_pages.insert(page);
        }
    }

    /// Make erases of the given block fail.
    pub fn fail_erase_block(&self, block: u32) {
        self.lock().fail_erase_blocks.insert(block);
    }

    /// Program a page directly, bypassing the operation queue. Short
    /// payloads are padded with 0xFF.
    pub fn program_raw(&self, block: u32, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        let geometry = self.geometry;
        ensure!(block < geometry.num_blocks, "block {block} out of range");
        ensure!(page < geometry.pages_per_block, "page {page} out of range");
        ensure!(data.len() <= geometry.page_size as usize, "data not page-sized");
        ensure!(oob.len() <= geometry.oob_size as usize, "oob too long");

        let mut state = self.lock();
        let cell = &mut state.blocks[block as usize][page as usize];
        ensure!(cell.is_none(), "page already programmed");

        let mut padded_data = vec![0xFFu8; geometry.page_size as usize];
        padded_data[..data.len()].copy_from_slice(data);
        let mut padded_oob = vec![0xFFu8; geometry.oob_size as usize];
        padded_oob[..oob.len()].copy_from_slice(oob);
        *cell = Some(SimPage {
            data: padded_data.into(),
            oob: padded_oob.into(),
        });
        Ok(())
    }

    /// A copy of the page's data and OOB, or `None` if it is erased or out
    /// of range.
    pub fn peek_page(&self, block: u32, page: u32) -> Option<(Vec<u8>, Vec<u8>)> {
        let state = self.lock();
        state
            .blocks
            .get(block as usize)?
            .get(page as usize)?
            .as_ref()
            .map(|p| (p.data.to_vec(), p.oob.to_vec()))
    }

    /// Erase a block directly, bypassing the operation queue and any
    /// injected erase failures.
    pub fn erase_raw(&self, block: u32) -> anyhow::Result<()> {
        ensure!(block < self.geometry.num_blocks, "block {block} out of range");
        let mut state = self.lock();
        for page in state.blocks[block as usize].iter_mut() {
            *page = None;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, request: &NandRequest) -> Result<()> {
        let page_size = self.geometry.page_size as usize;
        match request {
            NandRequest::Erase {
                first_block,
                num_blocks,
            } => self.erase(*first_block, *num_blocks),
            NandRequest::ReadPageDataOob { page_num, data, oob } => {
                let count = data.length.div_ceil(page_size) as u32;
                self.rw_pages(*page_num, count, data, oob, false)
            }
            NandRequest::WritePageDataOob { page_num, data, oob } => {
                let count = data.length.div_ceil(page_size) as u32;
                self.rw_pages(*page_num, count, data, oob, true)
            }
            NandRequest::Read {
                offset_nand,
                length,
                data,
                oob,
            } => self.rw_pages(*offset_nand, *length, data, oob, false),
            NandRequest::Write {
                offset_nand,
                length,
                data,
                oob,
            } => self.rw_pages(*offset_nand, *length, data, oob, true),
            NandRequest::ReadBytes { .. } | NandRequest::WriteBytes { .. } => {
                Err(Error::NotSupported("raw byte access"))
            }
        }
    }

    fn erase(&self, first_block: u32, num_blocks: u32) -> Result<()> {
        let limit = self.geometry.num_blocks;
        let end = first_block
            .checked_add(num_blocks)
            .filter(|&end| end <= limit)
            .ok_or(Error::OutOfRange {
                index: u64::from(first_block) + u64::from(num_blocks),
                limit: limit.into(),
            })?;

        let mut state = self.lock();
        for block in first_block..end {
            if state.fail_erase_blocks.contains(&block) {
                return Err(Error::Io("simulated erase failure"));
            }
            for page in state.blocks[block as usize].iter_mut() {
                *page = None;
            }
        }
        Ok(())
    }

    fn rw_pages(
        &self,
        start_page: u32,
        count: u32,
        data: &Payload,
        oob: &Payload,
        write: bool,
    ) -> Result<()> {
        let geometry = self.geometry;
        let page_size = geometry.page_size as usize;
        let total_pages = u64::from(geometry.num_blocks) * u64::from(geometry.pages_per_block);

        let mut state = self.lock();
        for i in 0..count {
            let page = start_page + i;
            if u64::from(page) >= total_pages {
                return Err(Error::OutOfRange {
                    index: page.into(),
                    limit: total_pages,
                });
            }
            let block = (page / geometry.pages_per_block) as usize;
            let slot = (page % geometry.pages_per_block) as usize;
            let data_offset = data.offset + i as usize * page_size;
            let oob_len = oob.length.min(geometry.oob_size as usize);
            let oob_offset = oob.offset + i as usize * oob.length;

            if write {
                if state.fail_write_pages.contains(&page) {
                    return Err(Error::Io("simulated program failure"));
                }
                let mut page_data = vec![0u8; page_size];
                data.buffer.read_at(data_offset, &mut page_data)?;
                let mut page_oob = vec![0xFFu8; geometry.oob_size as usize];
                oob.buffer.read_at(oob_offset, &mut page_oob[..oob_len])?;

                let cell = &mut state.blocks[block][slot];
                if cell.is_some() {
                    return Err(Error::Io("page already programmed"));
                }
                // Programming all-1s content leaves the page erased.
                if !is_erased(&page_data) || !is_erased(&page_oob) {
                    *cell = Some(SimPage {
                        data: page_data.into(),
                        oob: page_oob.into(),
                    });
                }
            } else {
                if state.fail_read_pages.contains(&page) {
                    return Err(Error::Io("simulated read failure"));
                }
                match &state.blocks[block][slot] {
                    Some(p) => {
                        data.buffer.write_at(data_offset, &p.data)?;
                        oob.buffer.write_at(oob_offset, &p.oob[..oob_len])?;
                    }
                    None => {
                        data.buffer.write_at(data_offset, &vec![0xFFu8; page_size])?;
                        oob.buffer.write_at(oob_offset, &vec![0xFFu8; oob_len])?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl NandController for SimController {
    fn query(&self) -> (NandGeometry, usize) {
        (self.geometry, self.op_size)
    }

    fn queue(&self, op: NandOperation) {
        let status = self.dispatch(&op.request);
        op.complete(status);
    }
}
