//! End-to-end attach flow over the simulated controller: metadata blobs in,
//! partitions out, I/O translation and bad-block write-through against real
//! on-flash table state.

use std::sync::{Arc, Mutex};

use bytes::BufMut;

use nandpart::bbt::header::{OobHeader, BBT_MAGIC};
use nandpart::metadata::{FVM_TYPE_GUID, PARTITION_NAME_LEN};
use nandpart::nand::sim::SimController;
use nandpart::nand::{
    DmaBuffer, NandClass, NandController, NandGeometry, NandOperation, NandRequest, Payload,
};
use nandpart::{attach, Error};

const GEOMETRY: NandGeometry = NandGeometry {
    page_size: 256,
    pages_per_block: 8,
    num_blocks: 512,
    oob_size: 16,
    nand_class: NandClass::Partmap,
    partition_guid: [0u8; 16],
};

// One table copy is ceil(512 / 256) = 2 pages.
const STRIDE: u32 = 2;

const TABLE_START: u32 = 500;
const TABLE_END: u32 = 507;

fn bad_block_config() -> Vec<u8> {
    let mut blob = Vec::new();
    blob.put_u32_le(TABLE_START);
    blob.put_u32_le(TABLE_END);
    blob
}

fn partition_map(entries: &[([u8; 16], u64, u64, &str)]) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.put_u32_le(entries.len() as u32);
    blob.put_u32_le(0);
    blob.put_u64_le(GEOMETRY.erase_block_size());
    for &(type_guid, first_block, last_block, name) in entries {
        blob.put_slice(&type_guid);
        blob.put_u64_le(first_block);
        blob.put_u64_le(last_block);
        let mut raw_name = [0u8; PARTITION_NAME_LEN];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        blob.put_slice(&raw_name);
    }
    blob
}

/// Seed one valid table copy so the store has something to recover.
fn seed_table(sim: &SimController, block: u32, bad: &[u32], generation: u16) -> anyhow::Result<()> {
    let mut table = vec![0u8; GEOMETRY.num_blocks as usize];
    for &bad_block in bad {
        table[bad_block as usize] = 1;
    }
    let oob = OobHeader {
        magic: BBT_MAGIC,
        program_erase_cycles: 1,
        generation,
    }
    .encode();
    for i in 0..STRIDE {
        let chunk = &table[i as usize * GEOMETRY.page_size as usize..][..GEOMETRY.page_size as usize];
        sim.program_raw(block, i, chunk, &oob)?;
    }
    Ok(())
}

fn submit(partition: &nandpart::Partition, request: NandRequest) -> nandpart::Result<()> {
    let status = Arc::new(Mutex::new(None));
    let status_out = Arc::clone(&status);
    partition.queue(NandOperation::new(request, move |result| {
        *status_out.lock().unwrap() = Some(result);
    }));
    let status = status.lock().unwrap().take();
    status.expect("sim completes synchronously")
}

#[test]
fn test_attach_spawns_partitions() -> anyhow::Result<()> {
    let sim = Arc::new(SimController::new(GEOMETRY));
    let partitions = attach(
        sim,
        &bad_block_config(),
        &partition_map(&[
            (FVM_TYPE_GUID, 0, 199, "fvm"),
            ([9u8; 16], 200, 399, "cache"),
        ]),
    )?;

    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].name(), "part-000");

    let (fvm, _) = partitions[0].query();
    assert_eq!(fvm.num_blocks, 200);
    assert_eq!(fvm.nand_class, NandClass::Ftl);
    assert_eq!(fvm.partition_guid, FVM_TYPE_GUID);

    let (cache, _) = partitions[1].query();
    assert_eq!(cache.num_blocks, 200);
    assert_eq!(cache.nand_class, NandClass::BadBlockSkip);
    Ok(())
}

#[test]
fn test_attach_rejects_bad_map() {
    let sim = Arc::new(SimController::new(GEOMETRY));
    let result = attach(
        sim,
        &bad_block_config(),
        &partition_map(&[([1u8; 16], 0, 9, "a"), ([2u8; 16], 9, 19, "b")]),
    );
    assert_eq!(result.err(), Some(Error::Internal("overlapping partitions")));
}

#[test]
fn test_partition_io_lands_translated() -> anyhow::Result<()> {
    let sim = Arc::new(SimController::new(GEOMETRY));
    let partitions = attach(
        sim.clone(),
        &bad_block_config(),
        &partition_map(&[([9u8; 16], 100, 199, "data")]),
    )?;
    let partition = &partitions[0];

    let data = DmaBuffer::new(GEOMETRY.page_size as usize);
    let oob = DmaBuffer::new(GEOMETRY.oob_size as usize);
    data.write_at(0, &vec![0xC3u8; GEOMETRY.page_size as usize])?;

    // Page 5 of the partition is page 5 of device block 100.
    submit(
        partition,
        NandRequest::Write {
            offset_nand: 5,
            length: 1,
            data: Payload::new(&data, 0, GEOMETRY.page_size as usize),
            oob: Payload::new(&oob, 0, GEOMETRY.oob_size as usize),
        },
    )?;
    let (page_data, _) = sim.peek_page(100, 5).expect("write landed in parent space");
    assert_eq!(page_data, vec![0xC3u8; GEOMETRY.page_size as usize]);

    // A partition-local erase clears the same device block.
    submit(
        partition,
        NandRequest::Erase {
            first_block: 0,
            num_blocks: 1,
        },
    )?;
    assert!(sim.peek_page(100, 5).is_none());
    Ok(())
}

#[test]
fn test_bad_block_write_through() -> anyhow::Result<()> {
    let sim = Arc::new(SimController::new(GEOMETRY));
    // Device block 110 is already bad: local block 10 of the partition.
    seed_table(&sim, TABLE_START, &[110], 3)?;

    let mut partitions = attach(
        sim.clone(),
        &bad_block_config(),
        &partition_map(&[([9u8; 16], 100, 199, "data")]),
    )?;
    let partition = &mut partitions[0];

    assert_eq!(partition.get_bad_blocks()?, vec![10]);
    assert!(partition.is_block_bad(10)?);
    assert!(!partition.is_block_bad(11)?);

    // Marking local block 25 persists device block 125 and lands in the
    // local cache.
    partition.mark_block_bad(25)?;
    assert_eq!(partition.get_bad_blocks()?, vec![10, 25]);

    // A second mark of the same block appends nothing.
    partition.mark_block_bad(25)?;
    assert_eq!(partition.get_bad_blocks()?, vec![10, 25]);

    // The committed generation carries the device-global mark.
    let (_, oob) = sim
        .peek_page(TABLE_START, STRIDE)
        .expect("new table copy appended");
    assert_eq!(
        OobHeader::decode(&oob),
        Some(OobHeader {
            magic: BBT_MAGIC,
            program_erase_cycles: 1,
            generation: 4,
        })
    );

    // A fresh attach against the same flash recovers both marks.
    let mut reread = attach(
        sim,
        &bad_block_config(),
        &partition_map(&[([9u8; 16], 100, 199, "data")]),
    )?;
    assert_eq!(reread[0].get_bad_blocks()?, vec![10, 25]);
    Ok(())
}

#[test]
fn test_cached_list_is_stale_until_recreated() -> anyhow::Result<()> {
    let sim = Arc::new(SimController::new(GEOMETRY));
    seed_table(&sim, TABLE_START, &[], 1)?;

    let map = partition_map(&[([1u8; 16], 0, 99, "a")]);
    let mut stale = attach(sim.clone(), &bad_block_config(), &map)?;
    // Populate the cached list while the flash still records no marks.
    assert_eq!(stale[0].get_bad_blocks()?, Vec::<u32>::new());

    // Another actor over the same flash persists a mark in this range.
    let mut writer = attach(sim.clone(), &bad_block_config(), &map)?;
    writer[0].mark_block_bad(50)?;

    // The first partition keeps serving its cached view until recreated.
    assert!(!stale[0].is_block_bad(50)?);
    let mut fresh = attach(sim, &bad_block_config(), &map)?;
    assert!(fresh[0].is_block_bad(50)?);
    assert_eq!(fresh[0].get_bad_blocks()?, vec![50]);
    Ok(())
}

#[test]
fn test_mark_without_table_fails() -> anyhow::Result<()> {
    // Blank flash: the store never finds a table, so marking fails and
    // partition I/O still works.
    let sim = Arc::new(SimController::new(GEOMETRY));
    let mut partitions = attach(
        sim,
        &bad_block_config(),
        &partition_map(&[([9u8; 16], 0, 99, "data")]),
    )?;
    let partition = &mut partitions[0];

    assert_eq!(
        partition.mark_block_bad(1),
        Err(Error::Internal("no valid bad block table copies"))
    );
    assert!(partition.get_bad_blocks().is_err());
    Ok(())
}
