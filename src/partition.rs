//! Per-partition logical NAND devices layered over one parent controller.

use std::sync::Arc;

use log::{info, trace, warn};

use crate::bbt::BadBlockStore;
use crate::metadata::{BadBlockConfig, PartitionMap, FVM_TYPE_GUID};
use crate::nand::{NandClass, NandController, NandGeometry, NandOperation, NandRequest};
use crate::{Error, Result};

/// A logical NAND device covering one partition map entry.
///
/// Presents the same command surface as the parent, with block-local
/// addresses rewritten into the parent's global space on the way down,
/// plus the bad-block query surface backed by the shared store.
pub struct Partition {
    parent: Arc<dyn NandController>,
    bad_block: Arc<BadBlockStore>,
    geometry: NandGeometry,
    parent_op_size: usize,
    erase_block_start: u32,
    /// Lazily filled list of bad blocks local to this partition, appended
    /// on local marks only.
    bad_block_cache: Option<Vec<u32>>,
    name: String,
}

/// Attach to a parent NAND device: build the shared bad block store and
/// one [`Partition`] per sanitized partition map entry.
pub fn attach(
    parent: Arc<dyn NandController>,
    bad_block_config: &[u8],
    partition_map: &[u8],
) -> Result<Vec<Partition>> {
    let (parent_geometry, parent_op_size) = parent.query();
    // Keep the translated-op trailer aligned when it lands behind the
    // parent's context.
    let parent_op_size = parent_op_size.next_multiple_of(8);

    let config = BadBlockConfig::parse(bad_block_config)?;
    let bad_block = BadBlockStore::new(Arc::clone(&parent), config);

    let mut map = PartitionMap::parse(partition_map)?;
    map.sanitize(&parent_geometry)?;

    let mut partitions = Vec::with_capacity(map.partitions.len());
    for (index, part) in map.partitions.iter().enumerate() {
        let num_blocks = (part.last_block - part.first_block + 1) as u32;
        // Only the FVM partition sits under the FTL.
        let nand_class = if part.type_guid == FVM_TYPE_GUID {
            NandClass::Ftl
        } else {
            NandClass::BadBlockSkip
        };
        let geometry = NandGeometry {
            num_blocks,
            nand_class,
            partition_guid: part.type_guid,
            ..parent_geometry
        };
        let name = format!("part-{index:03}");
        info!("binding {name} ({})", part.name);

        partitions.push(Partition {
            parent: Arc::clone(&parent),
            bad_block: Arc::clone(&bad_block),
            geometry,
            parent_op_size,
            erase_block_start: part.first_block as u32,
            bad_block_cache: None,
            name,
        });
    }
    Ok(partitions)
}

impl NandController for Partition {
    /// Effective geometry, plus the per-op context the parent needs with
    /// this device's translated-op trailer on top.
    fn query(&self) -> (NandGeometry, usize) {
        (
            self.geometry,
            self.parent_op_size + std::mem::size_of::<NandOperation>(),
        )
    }

    /// Rewrite the request into parent address space and hand it down.
    /// The caller's completion travels with the op and observes the
    /// parent's status unchanged. Commands that cannot be translated
    /// complete synchronously with `NotSupported`.
    fn queue(&self, mut op: NandOperation) {
        let page_base = self.erase_block_start * self.geometry.pages_per_block;
        match &mut op.request {
            NandRequest::Read { offset_nand, .. } | NandRequest::Write { offset_nand, .. } => {
                *offset_nand += page_base;
            }
            NandRequest::ReadPageDataOob { page_num, .. }
            | NandRequest::WritePageDataOob { page_num, .. } => {
                *page_num += page_base;
            }
            NandRequest::Erase { first_block, .. } => {
                *first_block += self.erase_block_start;
            }
            NandRequest::ReadBytes { .. } | NandRequest::WriteBytes { .. } => {
                trace!("{}: rejecting untranslatable command", self.name);
                op.complete(Err(Error::NotSupported("command cannot be address-translated")));
                return;
            }
        }
        self.parent.queue(op);
    }
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    /// Bad blocks local to this partition, zero-based and unordered.
    pub fn get_bad_blocks(&mut self) -> Result<Vec<u32>> {
        Ok(self.cache()?.clone())
    }

    /// Is the given partition-local block marked bad?
    ///
    /// The backing list is cached per partition. A mark made through a
    /// sibling partition becomes visible here only once this partition is
    /// recreated.
    pub fn is_block_bad(&mut self, block: u32) -> Result<bool> {
        self.check_block(block)?;
        // The list is small and unsorted; scan it.
        Ok(self.cache()?.contains(&block))
    }

    /// Mark a partition-local block bad, writing through to the shared
    /// persistent table. A failure to persist is propagated.
    pub fn mark_block_bad(&mut self, block: u32) -> Result<()> {
        self.check_block(block)?;
        warn!("{}: marking block {block} bad", self.name);

        let cache = self.cache()?;
        if !cache.contains(&block) {
            cache.push(block);
        }
        self.bad_block
            .mark_block_bad(block + self.erase_block_start)
    }

    fn check_block(&self, block: u32) -> Result<()> {
        if block >= self.geometry.num_blocks {
            return Err(Error::OutOfRange {
                index: block.into(),
                limit: self.geometry.num_blocks.into(),
            });
        }
        Ok(())
    }

    fn cache(&mut self) -> Result<&mut Vec<u32>> {
        if self.bad_block_cache.is_none() {
            let first = self.erase_block_start;
            let device_list = self
                .bad_block
                .get_bad_block_list(first, first + self.geometry.num_blocks)?;
            let local: Vec<u32> = device_list.into_iter().map(|block| block - first).collect();
            trace!("{}: bad block count: {}", self.name, local.len());
            self.bad_block_cache = Some(local);
        }
        Ok(self.bad_block_cache.get_or_insert_with(Vec::new))
    }
}
