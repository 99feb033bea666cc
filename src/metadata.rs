//! Attach-time metadata blobs: the reserved-range configuration for the
//! bad block table, and the device partition map.

use bytes::Buf;
use log::error;

use crate::nand::NandGeometry;
use crate::{Error, Result};

/// Reserved erase-block range dedicated to bad block table copies.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BadBlockConfig {
    pub table_start_block: u32,
    pub table_end_block: u32,
}

impl BadBlockConfig {
    /// Encoded size of the configuration blob.
    pub const SIZE: usize = 8;

    /// Decode the configuration blob supplied by the platform at attach.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            error!(
                "expected bad block config of size {}, got {}",
                Self::SIZE,
                bytes.len()
            );
            return Err(Error::Internal("bad block config blob has wrong size"));
        }
        Ok(Self {
            table_start_block: bytes.get_u32_le(),
            table_end_block: bytes.get_u32_le(),
        })
    }
}

/// Bytes reserved for a partition name in the map blob.
pub const PARTITION_NAME_LEN: usize = 32;

/// Well-known type GUID of the FVM partition. Partitions carrying it are
/// tagged for the FTL; everything else is raw.
pub const FVM_TYPE_GUID: [u8; 16] = [
    0x40, 0xe3, 0xd0, 0x41, 0xe3, 0x57, 0x4e, 0x95, 0x8c, 0x1e, 0x17, 0xec, 0xac, 0x7c, 0xc4, 0xce,
];

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 16 + 8 + 8 + PARTITION_NAME_LEN;

/// One partition map entry. Block addresses are in units of the map's
/// declared `block_size` until [`PartitionMap::sanitize`] rescales them
/// into parent erase blocks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub first_block: u64,
    /// Inclusive.
    pub last_block: u64,
    pub name: String,
}

/// The device partition map, decoded from the platform blob.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionMap {
    pub block_size: u64,
    pub partitions: Vec<PartitionEntry>,
}

impl PartitionMap {
    /// Decode the map blob: a fixed header
    /// `{partition_count: u32, reserved: u32, block_size: u64}` followed by
    /// `partition_count` entries of
    /// `{type_guid: [u8; 16], first_block: u64, last_block: u64, name: [u8; 32]}`.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            error!(
                "partition map is of size {}, needs to at least be {HEADER_SIZE}",
                bytes.len()
            );
            return Err(Error::Internal("partition map blob shorter than header"));
        }
        let partition_count = bytes.get_u32_le();
        let _reserved = bytes.get_u32_le();
        let block_size = bytes.get_u64_le();

        let wanted = partition_count as usize * ENTRY_SIZE;
        if bytes.remaining() < wanted {
            error!(
                "partition map has {} bytes of entries, needs {wanted}",
                bytes.remaining()
            );
            return Err(Error::Internal("partition map blob truncated"));
        }

        let mut partitions = Vec::with_capacity(partition_count as usize);
        for _ in 0..partition_count {
            let mut type_guid = [0u8; 16];
            bytes.copy_to_slice(&mut type_guid);
            let first_block = bytes.get_u64_le();
            let last_block = bytes.get_u64_le();
            let mut raw_name = [0u8; PARTITION_NAME_LEN];
            bytes.copy_to_slice(&mut raw_name);
            let name_len = raw_name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(PARTITION_NAME_LEN);
            let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();
            partitions.push(PartitionEntry {
                type_guid,
                first_block,
                last_block,
                name,
            });
        }

        Ok(Self {
            block_size,
            partitions,
        })
    }

    /// Check the map against the device geometry, sort it, and rescale the
    /// entries into parent erase-block units.
    pub fn sanitize(&mut self, geometry: &NandGeometry) -> Result<()> {
        if self.partitions.is_empty() {
            error!("partition count is zero");
            return Err(Error::Internal("empty partition map"));
        }
        if self.block_size == 0 {
            error!("partition map block size is zero");
            return Err(Error::Internal("partition map block size is zero"));
        }

        // Partitions must not overlap, checked in map units once sorted.
        self.partitions.sort_by_key(|part| part.first_block);
        for pair in self.partitions.windows(2) {
            if pair[0].last_block >= pair[1].first_block {
                error!("partitions {} and {} overlap", pair[0].name, pair[1].name);
                return Err(Error::Internal("overlapping partitions"));
            }
        }

        let erase_block_size = geometry.erase_block_size();
        if !erase_block_size.is_power_of_two() {
            error!("erase block size {erase_block_size} is not a power of two");
            return Err(Error::Internal("unusable geometry"));
        }
        let block_shift = erase_block_size.trailing_zeros();

        // Every partition must start and end on an erase block boundary.
        if self.block_size != erase_block_size {
            for part in &mut self.partitions {
                let first_byte_offset = part
                    .first_block
                    .checked_mul(self.block_size)
                    .ok_or(Error::Internal("partition offset overflow"))?;
                let last_byte_offset = part
                    .last_block
                    .checked_add(1)
                    .and_then(|blocks| blocks.checked_mul(self.block_size))
                    .ok_or(Error::Internal("partition offset overflow"))?;

                if first_byte_offset % erase_block_size != 0
                    || last_byte_offset % erase_block_size != 0
                {
                    error!(
                        "partition {} size is not a multiple of the erase block size",
                        part.name
                    );
                    return Err(Error::Internal("partition not aligned to erase blocks"));
                }
                part.first_block = first_byte_offset >> block_shift;
                part.last_block = (last_byte_offset >> block_shift) - 1;
            }
            self.block_size = erase_block_size;
        }

        // Partitions must exist within the device.
        let last = &self.partitions[self.partitions.len() - 1];
        if last.last_block >= u64::from(geometry.num_blocks) {
            return Err(Error::OutOfRange {
                index: last.last_block,
                limit: geometry.num_blocks.into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use crate::nand::NandClass;

    use super::*;

    const GEOMETRY: NandGeometry = NandGeometry {
        page_size: 2048,
        pages_per_block: 64,
        num_blocks: 1024,
        oob_size: 16,
        nand_class: NandClass::Partmap,
        partition_guid: [0u8; 16],
    };

    fn entry(name: &str, first_block: u64, last_block: u64) -> PartitionEntry {
        PartitionEntry {
            type_guid: [7u8; 16],
            first_block,
            last_block,
            name: name.to_string(),
        }
    }

    /// Build a map blob the way the platform hands it over.
    fn encode_map(block_size: u64, entries: &[PartitionEntry]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.put_u32_le(entries.len() as u32);
        blob.put_u32_le(0);
        blob.put_u64_le(block_size);
        for part in entries {
            blob.put_slice(&part.type_guid);
            blob.put_u64_le(part.first_block);
            blob.put_u64_le(part.last_block);
            let mut name = [0u8; PARTITION_NAME_LEN];
            name[..part.name.len()].copy_from_slice(part.name.as_bytes());
            blob.put_slice(&name);
        }
        blob
    }

    #[test]
    fn test_parse_round_trip() -> anyhow::Result<()> {
        let entries = vec![entry("boot", 0, 3), entry("data", 4, 9)];
        let blob = encode_map(131072, &entries);
        let map = PartitionMap::parse(&blob)?;
        assert_eq!(map.block_size, 131072);
        assert_eq!(map.partitions, entries);
        Ok(())
    }

    #[test]
    fn test_parse_truncated() {
        let blob = encode_map(131072, &[entry("boot", 0, 3)]);
        assert!(matches!(
            PartitionMap::parse(&blob[..HEADER_SIZE - 1]),
            Err(Error::Internal(_))
        ));
        assert!(matches!(
            PartitionMap::parse(&blob[..blob.len() - 1]),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_sanitize_rescales_to_device_units() -> anyhow::Result<()> {
        // Map declared in 4 KiB units over 128 KiB erase blocks: one
        // partition of exactly one erase block.
        let mut map = PartitionMap {
            block_size: 4096,
            partitions: vec![entry("fvm", 0, 31)],
        };
        map.sanitize(&GEOMETRY)?;
        assert_eq!(map.block_size, GEOMETRY.erase_block_size());
        assert_eq!(map.partitions[0].first_block, 0);
        assert_eq!(map.partitions[0].last_block, 0);
        Ok(())
    }

    #[test]
    fn test_sanitize_rejects_unaligned() {
        let mut map = PartitionMap {
            block_size: 4096,
            partitions: vec![entry("odd", 0, 30)],
        };
        assert_eq!(
            map.sanitize(&GEOMETRY),
            Err(Error::Internal("partition not aligned to erase blocks"))
        );
    }

    #[test]
    fn test_sanitize_rejects_overlap() {
        let mut map = PartitionMap {
            block_size: GEOMETRY.erase_block_size(),
            partitions: vec![entry("a", 0, 9), entry("b", 9, 19)],
        };
        assert_eq!(
            map.sanitize(&GEOMETRY),
            Err(Error::Internal("overlapping partitions"))
        );
    }

    #[test]
    fn test_sanitize_sorts_by_first_block() -> anyhow::Result<()> {
        let mut map = PartitionMap {
            block_size: GEOMETRY.erase_block_size(),
            partitions: vec![entry("late", 10, 19), entry("early", 0, 9)],
        };
        map.sanitize(&GEOMETRY)?;
        assert_eq!(map.partitions[0].name, "early");
        assert_eq!(map.partitions[1].name, "late");
        Ok(())
    }

    #[test]
    fn test_sanitize_rejects_empty_and_oversized() {
        let mut empty = PartitionMap {
            block_size: GEOMETRY.erase_block_size(),
            partitions: Vec::new(),
        };
        assert_eq!(
            empty.sanitize(&GEOMETRY),
            Err(Error::Internal("empty partition map"))
        );

        let mut outside = PartitionMap {
            block_size: GEOMETRY.erase_block_size(),
            partitions: vec![entry("big", 0, u64::from(GEOMETRY.num_blocks))],
        };
        assert!(matches!(
            outside.sanitize(&GEOMETRY),
            Err(Error::OutOfRange { .. })
        ));
    }
}
