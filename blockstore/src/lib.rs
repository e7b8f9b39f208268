//! A fixed capacity block device kept in memory.
//!
//! [`BlockStore`] is a flat array of equally sized blocks with its allocation
//! bitmap embedded in its own last blocks. Blocks are claimed with
//! [`BlockStore::allocate`] or [`BlockStore::request`], accessed a whole block at
//! a time, and the entire device can be saved to and loaded from a flat image
//! file.
//!
//! The geometry is fixed at compile time. The default device has 65536 blocks of
//! 4096 bytes:
//!
//! ```no_run
//! use blockstore::BlockStore;
//!
//! let mut store: BlockStore = BlockStore::new()?;
//! let block = store.allocate().expect("device full");
//! store.write(block, &[0xAB; 4096]);
//! store.serialize("disk.img")?;
//!
//! let store: BlockStore = BlockStore::deserialize("disk.img")?;
//! let mut buf = [0; 4096];
//! assert_eq!(store.read(block, &mut buf), 4096);
//! # Ok::<(), blockstore::StoreError>(())
//! ```
pub mod bitmap;
pub mod io;
mod store;

pub use bitmap::Bitmap;
pub use io::{BlockNumber, BlockStorage, ImageLoader};
pub use store::{BlockStore, Result, State, StoreError, BLOCK_SIZE_BYTES, TOTAL_BLOCKS};
