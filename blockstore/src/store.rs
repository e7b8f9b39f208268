use std::fmt;
use std::ops::Range;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::bitmap::{bytes_for, Bitmap, SetBits};
use crate::io::BlockNumber;

/// Default number of blocks on a device.
pub const TOTAL_BLOCKS: usize = 65536;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const BLOCK_SIZE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    Used,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unable to allocate {0} bytes of backing storage")]
    OutOfMemory(usize),
    #[error("bitmap needs {needed} bytes but the overlay region holds {len}")]
    OverlayTooSmall { needed: usize, len: usize },
    #[error("failed to reserve bitmap block {0}")]
    Reservation(BlockNumber),
    #[error("device image is truncated, expected {expected} bytes but read {read}")]
    ShortImage { expected: usize, read: usize },
    #[error("device image holds data past the expected {expected} bytes")]
    TrailingData { expected: usize },
    #[error("device image I/O failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An in-memory block device of `BLOCKS` blocks of `BLOCK_SIZE` bytes each.
///
/// The allocation bitmap is stored inside the device itself, in the last
/// [`BITMAP_BLOCKS`](Self::BITMAP_BLOCKS) blocks. Those blocks are reserved
/// when the store is created and are never handed out or released.
///
/// # Layout
/// ==============================================
/// | Data blocks ...                   | Bitmap |
/// ==============================================
///
/// Every block is either free or allocated. Reads and writes are only honored
/// on allocated blocks; any rejected request reports zero bytes transferred.
pub struct BlockStore<const BLOCKS: usize = TOTAL_BLOCKS, const BLOCK_SIZE: usize = BLOCK_SIZE_BYTES>
{
    /// The whole device, bitmap region included. Always exactly
    /// `IMAGE_BYTES` long.
    data: Vec<u8>,
}

impl<const BLOCKS: usize, const BLOCK_SIZE: usize> BlockStore<BLOCKS, BLOCK_SIZE> {
    /// Bytes needed for one bit per block.
    pub const BITMAP_BYTES: usize = bytes_for(BLOCKS);
    /// Whole blocks occupied by the bitmap.
    pub const BITMAP_BLOCKS: usize = (Self::BITMAP_BYTES + BLOCK_SIZE - 1) / BLOCK_SIZE;
    /// First block of the bitmap region.
    pub const BITMAP_START_BLOCK: usize = BLOCKS - Self::BITMAP_BLOCKS;
    /// Size of the device, and of its serialized image, in bytes.
    pub const IMAGE_BYTES: usize = BLOCKS * BLOCK_SIZE;

    const GEOMETRY: () = assert!(
        BLOCK_SIZE > 0 && Self::BITMAP_BLOCKS < BLOCKS,
        "device must leave room for data blocks next to its bitmap"
    );

    /// Creates a zeroed device with the bitmap blocks already reserved.
    ///
    /// # Errors
    ///
    /// Fails if the device memory can't be allocated or the bitmap region
    /// can't be reserved. Nothing is leaked on failure.
    pub fn new() -> Result<Self> {
        // Rejects impossible geometries at compile time.
        let () = Self::GEOMETRY;

        let mut data = Vec::new();
        data.try_reserve_exact(Self::IMAGE_BYTES)
            .map_err(|_| StoreError::OutOfMemory(Self::IMAGE_BYTES))?;
        data.resize(Self::IMAGE_BYTES, 0);

        let mut store = Self { data };
        for block in Self::bitmap_blocks() {
            if !store.request(block) {
                return Err(StoreError::Reservation(block));
            }
        }

        debug!(
            "Created block store of {} blocks of {} bytes, bitmap at blocks {:?}.",
            BLOCKS,
            BLOCK_SIZE,
            Self::bitmap_blocks()
        );
        Ok(store)
    }

    /// Number of blocks on the device. Needs no instance.
    pub const fn total_blocks() -> usize {
        BLOCKS
    }

    pub const fn block_size() -> usize {
        BLOCK_SIZE
    }

    /// Blocks holding the device's own bitmap.
    pub fn bitmap_blocks() -> Range<BlockNumber> {
        Self::BITMAP_START_BLOCK..Self::BITMAP_START_BLOCK + Self::BITMAP_BLOCKS
    }

    /// Whether `block` belongs to the self-reserved bitmap region.
    pub fn is_reserved(block: BlockNumber) -> bool {
        Self::bitmap_blocks().contains(&block)
    }

    /// Claims the lowest numbered free block.
    ///
    /// Returns `None` once every block is in use.
    pub fn allocate(&mut self) -> Option<BlockNumber> {
        let mut map = self.bitmap_mut();
        let block = match map.find_first_zero() {
            Some(block) => block,
            None => {
                debug!("No free blocks left out of {}.", BLOCKS);
                return None;
            }
        };
        map.set(block);
        trace!("Allocated block {}.", block);
        Some(block)
    }

    /// Claims a specific block.
    ///
    /// Returns `false` if the block is out of range or already in use. The bit
    /// is read back after being set so that a bitmap which silently drops
    /// writes is reported as a failure.
    pub fn request(&mut self, block: BlockNumber) -> bool {
        let mut map = self.bitmap_mut();
        match map.test(block) {
            None => {
                warn!("Requested block {} beyond device end of {} blocks.", block, BLOCKS);
                false
            }
            Some(true) => {
                debug!("Requested block {} is already in use.", block);
                false
            }
            Some(false) => {
                map.set(block);
                let claimed = map.test(block) == Some(true);
                if claimed {
                    trace!("Claimed block {}.", block);
                }
                claimed
            }
        }
    }

    /// Returns a block to the free pool. Releasing a free or out of range
    /// block does nothing, and neither does releasing a bitmap block.
    ///
    /// The block's contents are kept until it is next written.
    pub fn release(&mut self, block: BlockNumber) {
        if Self::is_reserved(block) {
            warn!("Refusing to release bitmap block {}.", block);
            return;
        }
        if self.bitmap_mut().reset(block) {
            trace!("Released block {}.", block);
        }
    }

    pub fn used_blocks(&self) -> usize {
        self.bitmap().total_set()
    }

    pub fn free_blocks(&self) -> usize {
        BLOCKS - self.used_blocks()
    }

    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        self.bitmap().test(block) == Some(true)
    }

    /// Allocation state of `block`, or `None` if it is out of range.
    pub fn state(&self, block: BlockNumber) -> Option<State> {
        self.bitmap().test(block).map(|used| if used { State::Used } else { State::Free })
    }

    /// Iterates over every allocated block, bitmap blocks included, in
    /// ascending order.
    pub fn allocated_blocks(&self) -> SetBits<'_> {
        SetBits::new(&self.data[Self::bitmap_span()], BLOCKS)
    }

    /// Copies the contents of `block` into the front of `buf`.
    ///
    /// Returns the number of bytes read: `BLOCK_SIZE` on success, or 0 if the
    /// block is out of range or unallocated, or `buf` is shorter than a block.
    /// `buf` is untouched on failure.
    pub fn read(&self, block: BlockNumber, buf: &mut [u8]) -> usize {
        let span = match self.allocated_span(block) {
            Some(span) => span,
            None => return 0,
        };
        if buf.len() < BLOCK_SIZE {
            warn!(
                "Buffer of {} bytes cannot hold block {} of {} bytes.",
                buf.len(),
                block,
                BLOCK_SIZE
            );
            return 0;
        }
        buf[..BLOCK_SIZE].copy_from_slice(&self.data[span]);
        BLOCK_SIZE
    }

    /// Copies the first `BLOCK_SIZE` bytes of `buf` into `block`.
    ///
    /// Returns the number of bytes written: `BLOCK_SIZE` on success, or 0 if the
    /// block is out of range, unallocated, or `buf` is shorter than a block.
    /// Writing never allocates.
    ///
    /// Bitmap blocks are allocated, so writing one rewrites the allocation map.
    pub fn write(&mut self, block: BlockNumber, buf: &[u8]) -> usize {
        let span = match self.allocated_span(block) {
            Some(span) => span,
            None => return 0,
        };
        if buf.len() < BLOCK_SIZE {
            warn!(
                "Buffer of {} bytes is shorter than block {} of {} bytes.",
                buf.len(),
                block,
                BLOCK_SIZE
            );
            return 0;
        }
        self.data[span].copy_from_slice(&buf[..BLOCK_SIZE]);
        BLOCK_SIZE
    }

    /// The raw device image, bitmap included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn bitmap(&self) -> Bitmap<&[u8]> {
        Bitmap::from_parts(&self.data[Self::bitmap_span()], BLOCKS)
    }

    fn bitmap_mut(&mut self) -> Bitmap<&mut [u8]> {
        Bitmap::from_parts(&mut self.data[Self::bitmap_span()], BLOCKS)
    }

    fn bitmap_span() -> Range<usize> {
        let start = Self::BITMAP_START_BLOCK * BLOCK_SIZE;
        start..start + Self::BITMAP_BYTES
    }

    /// Byte range of `block`, provided it exists and is allocated.
    fn allocated_span(&self, block: BlockNumber) -> Option<Range<usize>> {
        match self.bitmap().test(block) {
            Some(true) => {
                let start = block * BLOCK_SIZE;
                Some(start..start + BLOCK_SIZE)
            }
            Some(false) => {
                warn!("Block {} is not allocated.", block);
                None
            }
            None => {
                warn!("Block {} is beyond device end of {} blocks.", block, BLOCKS);
                None
            }
        }
    }
}

impl<const BLOCKS: usize, const BLOCK_SIZE: usize> fmt::Debug for BlockStore<BLOCKS, BLOCK_SIZE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &BLOCKS)
            .field("block_size", &BLOCK_SIZE)
            .field("used_blocks", &self.used_blocks())
            .finish()
    }
}
