//! Abstractions and types for talking to a queued NAND controller.
//!
//! The controller consumes [`NandOperation`]s: a request plus a completion
//! that is invoked exactly once with the final status. Read and write
//! requests reference caller-owned [`DmaBuffer`] regions, which stand in
//! for the DMA-capable handles the hardware moves bytes through.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

pub mod client;
pub mod sim;

/// NAND device classes advertised to upper layers. The tag is advisory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NandClass {
    /// A raw device carrying a partition map.
    Partmap,
    /// A partition meant to sit under a flash translation layer.
    Ftl,
    /// A raw partition whose consumers skip bad blocks themselves.
    BadBlockSkip,
}

/// A pub-fields struct describing the data layout of a NAND device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandGeometry {
    /// Bytes per page, excluding the OOB area.
    pub page_size: u32,
    /// Pages per erase block; `page_size * pages_per_block` must be a
    /// power of two.
    pub pages_per_block: u32,
    /// Total erase blocks on the device.
    pub num_blocks: u32,
    /// Out-of-band bytes available per page.
    pub oob_size: u32,
    pub nand_class: NandClass,
    pub partition_guid: [u8; 16],
}

impl NandGeometry {
    /// Size of one erase block in bytes.
    pub fn erase_block_size(&self) -> u64 {
        u64::from(self.page_size) * u64::from(self.pages_per_block)
    }
}

/// A separately allocated backing region the controller transfers bytes in
/// and out of. The region is shared between submitter and controller;
/// serializing access is the submitter's concern (the bad block store ties
/// its pair of regions to its own mutex).
#[derive(Debug)]
pub struct DmaBuffer {
    len: usize,
    bytes: Mutex<Box<[u8]>>,
}

impl DmaBuffer {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            len,
            bytes: Mutex::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the region at byte `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .ok_or(Error::InvalidArgs("payload range out of bounds"))?;
        let mut bytes = self.lock();
        let dst = bytes
            .get_mut(offset..end)
            .ok_or(Error::InvalidArgs("payload range out of bounds"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copy bytes out of the region at byte `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(dst.len())
            .ok_or(Error::InvalidArgs("payload range out of bounds"))?;
        let bytes = self.lock();
        let src = bytes
            .get(offset..end)
            .ok_or(Error::InvalidArgs("payload range out of bounds"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A byte range of a [`DmaBuffer`], carried by read and write requests.
#[derive(Debug, Clone)]
pub struct Payload {
    pub buffer: Arc<DmaBuffer>,
    /// Byte offset into `buffer`.
    pub offset: usize,
    /// Transfer length in bytes.
    pub length: usize,
}

impl Payload {
    pub fn new(buffer: &Arc<DmaBuffer>, offset: usize, length: usize) -> Self {
        Self {
            buffer: Arc::clone(buffer),
            offset,
            length,
        }
    }
}

/// A controller request.
///
/// Two command-set revisions are in circulation: the older combined
/// data+OOB page commands and the newer unified ones sharing a single
/// `offset_nand`. Controllers must dispatch both identically.
#[derive(Debug, Clone)]
pub enum NandRequest {
    /// Erase `num_blocks` erase blocks starting at `first_block`.
    Erase { first_block: u32, num_blocks: u32 },
    /// Older revision: read pages together with their OOB areas.
    ReadPageDataOob {
        page_num: u32,
        data: Payload,
        oob: Payload,
    },
    /// Older revision: program pages together with their OOB areas.
    WritePageDataOob {
        page_num: u32,
        data: Payload,
        oob: Payload,
    },
    /// Newer revision: read `length` pages starting at page `offset_nand`.
    Read {
        offset_nand: u32,
        length: u32,
        data: Payload,
        oob: Payload,
    },
    /// Newer revision: program `length` pages starting at page `offset_nand`.
    Write {
        offset_nand: u32,
        length: u32,
        data: Payload,
        oob: Payload,
    },
    /// Raw byte-addressed read, outside the paged command set.
    ReadBytes {
        offset_nand: u64,
        length: u64,
        data: Payload,
    },
    /// Raw byte-addressed write, outside the paged command set.
    WriteBytes {
        offset_nand: u64,
        length: u64,
        data: Payload,
    },
}

/// Completion callback carried by an operation. Invoked exactly once with
/// the operation's final status.
pub type CompletionFn = Box<dyn FnOnce(Result<()>) + Send>;

/// One queued NAND operation.
pub struct NandOperation {
    pub request: NandRequest,
    pub on_complete: CompletionFn,
}

impl NandOperation {
    pub fn new(request: NandRequest, on_complete: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self {
            request,
            on_complete: Box::new(on_complete),
        }
    }

    /// Deliver a status without submitting the operation anywhere.
    pub fn complete(self, status: Result<()>) {
        (self.on_complete)(status);
    }
}

/// The interface a NAND controller presents to the layers above it.
pub trait NandController: Send + Sync {
    /// Report the device geometry and the per-operation context size a
    /// submitter must account for.
    fn query(&self) -> (NandGeometry, usize);

    /// Enqueue an operation. The outcome is delivered through the
    /// operation's completion; `queue` itself never fails.
    fn queue(&self, op: NandOperation);
}

#[derive(Default)]
struct OpShared {
    status: Mutex<Option<Result<()>>>,
    signal: Condvar,
}

/// Wait half of a blocking submission/wait pair.
///
/// The promise half rides inside an operation's completion; the future
/// half stays on the submitter's stack and parks until fulfilled.
pub struct OpFuture {
    shared: Arc<OpShared>,
}

/// Fulfillment half of a blocking submission/wait pair.
pub struct OpPromise {
    shared: Arc<OpShared>,
}

impl OpFuture {
    /// Create a connected future/promise pair.
    pub fn pair() -> (OpFuture, OpPromise) {
        let shared = Arc::new(OpShared::default());
        (
            OpFuture {
                shared: Arc::clone(&shared),
            },
            OpPromise { shared },
        )
    }

    /// Park the calling thread until the promise is fulfilled. The wait is
    /// indefinite; a stuck controller hangs the caller.
    pub fn wait(self) -> Result<()> {
        let mut status = self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(status) = status.take() {
                return status;
            }
            status = self
                .shared
                .signal
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl OpPromise {
    /// Record the status and wake the waiter.
    pub fn fulfill(self, status: Result<()>) {
        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
        self.shared.signal.notify_one();
    }
}
