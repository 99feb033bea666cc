//! Blocking single-operation façade over a queued NAND controller.

use std::sync::Arc;

use crate::Result;

use super::{DmaBuffer, NandController, NandGeometry, NandOperation, NandRequest, OpFuture, Payload};

/// Submits one operation at a time against a controller and parks the
/// calling thread until the controller signals completion.
///
/// The client owns one data region and one OOB region, allocated up front
/// and reused by every operation so that transfers keep working when
/// memory is tight. Nothing here serializes access to them; the owner
/// (the bad block store) holds its own lock across each operation.
pub struct NandClient {
    controller: Arc<dyn NandController>,
    geometry: NandGeometry,
    data: Arc<DmaBuffer>,
    oob: Arc<DmaBuffer>,
}

impl NandClient {
    /// Allocate a client with a `data_len`-byte data region and an
    /// `oob_len`-byte OOB region.
    pub fn new(controller: Arc<dyn NandController>, data_len: usize, oob_len: usize) -> Self {
        let (geometry, _) = controller.query();
        Self {
            controller,
            geometry,
            data: DmaBuffer::new(data_len),
            oob: DmaBuffer::new(oob_len),
        }
    }

    pub fn geometry(&self) -> &NandGeometry {
        &self.geometry
    }

    /// Erase one erase block.
    pub fn erase_block(&self, block: u32) -> Result<()> {
        self.submit(NandRequest::Erase {
            first_block: block,
            num_blocks: 1,
        })
    }

    /// Read one page plus its OOB prefix. `data_offset` selects which page
    /// slot of the data region receives the payload, in pages.
    pub fn read_page(&self, page: u32, data_offset: u32) -> Result<()> {
        self.submit(self.page_request(page, data_offset, false))
    }

    /// Program one page plus its OOB prefix from the client's regions.
    pub fn write_page(&self, page: u32, data_offset: u32) -> Result<()> {
        self.submit(self.page_request(page, data_offset, true))
    }

    /// Snapshot of the OOB region.
    pub fn oob_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.oob.len()];
        self.oob.read_at(0, &mut bytes)?;
        Ok(bytes)
    }

    /// Replace the OOB region contents.
    pub fn set_oob_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.oob.write_at(0, bytes)
    }

    /// Copy out of the data region starting at byte `offset`.
    pub fn copy_data(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.data.read_at(offset, dst)
    }

    /// Replace the leading bytes of the data region and zero the remainder.
    pub fn fill_data(&self, src: &[u8]) -> Result<()> {
        self.data.write_at(0, src)?;
        let pad = vec![0u8; self.data.len() - src.len()];
        self.data.write_at(src.len(), &pad)
    }

    fn submit(&self, request: NandRequest) -> Result<()> {
        let (future, promise) = OpFuture::pair();
        self.controller
            .queue(NandOperation::new(request, move |status| {
                promise.fulfill(status)
            }));
        future.wait()
    }

    fn payloads(&self, data_offset: u32) -> (Payload, Payload) {
        let page_size = self.geometry.page_size as usize;
        (
            Payload::new(&self.data, data_offset as usize * page_size, page_size),
            Payload::new(&self.oob, 0, self.oob.len()),
        )
    }

    #[cfg(feature = "old-nand-proto")]
    fn page_request(&self, page: u32, data_offset: u32, write: bool) -> NandRequest {
        let (data, oob) = self.payloads(data_offset);
        if write {
            NandRequest::WritePageDataOob {
                page_num: page,
                data,
                oob,
            }
        } else {
            NandRequest::ReadPageDataOob {
                page_num: page,
                data,
                oob,
            }
        }
    }

    #[cfg(not(feature = "old-nand-proto"))]
    fn page_request(&self, page: u32, data_offset: u32, write: bool) -> NandRequest {
        let (data, oob) = self.payloads(data_offset);
        if write {
            NandRequest::Write {
                offset_nand: page,
                length: 1,
                data,
                oob,
            }
        } else {
            NandRequest::Read {
                offset_nand: page,
                length: 1,
                data,
                oob,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::sim::SimController;
    use super::super::{NandClass, NandGeometry};
    use super::*;

    const TEST_GEOMETRY: NandGeometry = NandGeometry {
        page_size: 64,
        pages_per_block: 4,
        num_blocks: 8,
        oob_size: 8,
        nand_class: NandClass::Partmap,
        partition_guid: [0u8; 16],
    };

    #[test]
    fn test_page_round_trip() -> anyhow::Result<()> {
        let sim = Arc::new(SimController::new(TEST_GEOMETRY));
        let client = NandClient::new(sim.clone(), 2 * 64, 8);

        client.fill_data(&[0xA5u8; 64])?;
        client.set_oob_bytes(&[1, 2, 3, 4, 5, 6, 7, 8])?;
        client.write_page(5, 0)?;

        // Read it back through the second page slot of the data region.
        client.read_page(5, 1)?;
        let mut data = [0u8; 64];
        client.copy_data(64, &mut data)?;
        assert_eq!(data, [0xA5u8; 64]);
        assert_eq!(client.oob_bytes()?, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn test_erase_block() -> anyhow::Result<()> {
        let sim = Arc::new(SimController::new(TEST_GEOMETRY));
        let client = NandClient::new(sim.clone(), 64, 8);

        client.fill_data(&[0x42u8; 64])?;
        client.write_page(9, 0)?;
        assert!(sim.peek_page(2, 1).is_some());

        client.erase_block(2)?;
        assert!(sim.peek_page(2, 1).is_none());
        Ok(())
    }
}
