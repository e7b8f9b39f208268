use crate::store::BlockStore;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Allocation tracked block storage as seen by the layers above it (inodes,
/// directories). Transfers are always whole blocks.
///
/// Failed calls report zero bytes transferred rather than returning an error,
/// so callers must check the returned counts.
pub trait BlockStorage {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;
    /// Total number of blocks, allocated or not.
    fn block_count(&self) -> usize;
    /// Claims any free block.
    fn allocate_block(&mut self) -> Option<BlockNumber>;
    /// Hands a block back. Releasing a block that isn't allocated does nothing.
    fn release_block(&mut self, blocknr: BlockNumber);
    /// Reads an allocated block into the front of `buf`.
    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> usize;
    /// Writes the front of `buf` into an allocated block.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> usize;
}

impl<const BLOCKS: usize, const BLOCK_SIZE: usize> BlockStorage for BlockStore<BLOCKS, BLOCK_SIZE> {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> usize {
        BLOCKS
    }

    fn allocate_block(&mut self) -> Option<BlockNumber> {
        self.allocate()
    }

    fn release_block(&mut self, blocknr: BlockNumber) {
        self.release(blocknr)
    }

    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> usize {
        self.read(blocknr, buf)
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> usize {
        self.write(blocknr, buf)
    }
}
