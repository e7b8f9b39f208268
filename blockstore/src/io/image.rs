use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{self, ErrorKind};
use std::path::Path;

use log::{debug, error, warn};

use crate::store::{BlockStore, Result, StoreError};

/// Persistence of a whole device as a flat image file.
///
/// The image is a byte for byte copy of the device memory, bitmap blocks
/// included, with no header. Its length is always `IMAGE_BYTES`.
impl<const BLOCKS: usize, const BLOCK_SIZE: usize> BlockStore<BLOCKS, BLOCK_SIZE> {
    /// Writes the device image to `path`, creating or truncating the file.
    ///
    /// Returns the number of bytes written, which is always `IMAGE_BYTES`.
    pub fn serialize<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let mut fd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                error!("Unable to open {} for writing: {}", path.display(), e);
                e
            })?;

        let written = self.write_image(&mut fd)?;
        // Surfaces deferred write errors that dropping the file would swallow.
        fd.sync_all().map_err(|e| {
            error!("Unable to sync {}: {}", path.display(), e);
            e
        })?;
        debug!("Serialized {} bytes to {}.", written, path.display());
        Ok(written)
    }

    /// Writes the device image to `out`.
    ///
    /// Partial writes are accumulated until the whole image is out. A write
    /// that makes no progress or fails aborts immediately.
    pub fn write_image<W: Write>(&self, mut out: W) -> Result<usize> {
        let image = self.as_bytes();
        let mut written = 0;
        while written < image.len() {
            match out.write(&image[written..]) {
                Ok(0) => {
                    error!("Image write stalled after {} of {} bytes.", written, image.len());
                    return Err(io::Error::new(ErrorKind::WriteZero, "image write stalled").into());
                }
                Ok(n) => written += n,
                Err(e) => {
                    error!("Image write failed after {} of {} bytes: {}", written, image.len(), e);
                    return Err(e.into());
                }
            }
        }
        out.flush()?;

        debug_assert_eq!(written, Self::IMAGE_BYTES);
        Ok(written)
    }

    /// Rebuilds a device from the image at `path`. The image must be exactly
    /// `IMAGE_BYTES` long; see [`ImageLoader`] to accept padded images.
    ///
    /// The bitmap stored in the image replaces the one set up by
    /// [`BlockStore::new`].
    pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<Self> {
        ImageLoader::open(path)?.load()
    }
}

/// Loads a device image from an open file.
pub struct ImageLoader {
    fd: File,
    allow_padding: bool,
}

impl From<File> for ImageLoader {
    fn from(fd: File) -> Self {
        ImageLoader {
            fd,
            allow_padding: false,
        }
    }
}

impl ImageLoader {
    /// Opens the image at `path` for reading. Does not create the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fd = File::open(path).map_err(|e| {
            error!("Unable to open {} for reading: {}", path.display(), e);
            e
        })?;
        Ok(Self::from(fd))
    }

    /// Accept images longer than the device, ignoring the excess bytes.
    pub fn allow_padding(mut self, allow: bool) -> Self {
        self.allow_padding = allow;
        self
    }

    /// Reads the image into a freshly created device. The geometry is taken
    /// from the requested store type.
    ///
    /// # Errors
    ///
    /// Fails if the image is shorter than the device, longer than the device
    /// while padding isn't allowed, or can't be read. The partially loaded
    /// device is dropped.
    pub fn load<const BLOCKS: usize, const BLOCK_SIZE: usize>(
        mut self,
    ) -> Result<BlockStore<BLOCKS, BLOCK_SIZE>> {
        let expected = BlockStore::<BLOCKS, BLOCK_SIZE>::IMAGE_BYTES;
        let mut store = BlockStore::<BLOCKS, BLOCK_SIZE>::new()?;

        let read = fill(&mut self.fd, store.as_bytes_mut())?;
        if read != expected {
            error!("Image is truncated, read {} of {} bytes.", read, expected);
            return Err(StoreError::ShortImage { expected, read });
        }

        if !self.allow_padding && fill(&mut self.fd, &mut [0; 1])? != 0 {
            error!("Image is longer than the expected {} bytes.", expected);
            return Err(StoreError::TrailingData { expected });
        }

        let reserved = BlockStore::<BLOCKS, BLOCK_SIZE>::bitmap_blocks();
        if !reserved.clone().all(|block| store.is_allocated(block)) {
            warn!("Image does not mark bitmap blocks {:?} as in use.", reserved);
        }

        debug!(
            "Loaded image of {} bytes with {} blocks in use.",
            read,
            store.used_blocks()
        );
        Ok(store)
    }
}

/// Reads until `buf` is full or the reader is exhausted, returning the number
/// of bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Image read failed after {} bytes: {}", read, e);
                return Err(e.into());
            }
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tiny = BlockStore<64, 16>;

    /// Accepts a limited number of bytes per call, like a pipe or socket.
    struct Trickle {
        sink: Vec<u8>,
        per_call: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.per_call);
            self.sink.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stops accepting bytes once full.
    struct Full {
        room: usize,
    }

    impl Write for Full {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.room);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn populated_store() -> Tiny {
        let mut store = Tiny::new().unwrap();
        for block in &[0, 5, 6, 40] {
            assert!(store.request(*block));
            store.write(*block, &[*block as u8 + 1; 16]);
        }
        store
    }

    #[test]
    fn serialized_image_is_exactly_device_sized() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let store = populated_store();

        assert_eq!(store.serialize(disk.path()).unwrap(), 1024);
        assert_eq!(disk.as_file().metadata().unwrap().len(), 1024);
    }

    #[test]
    fn serialize_truncates_existing_file() {
        let mut disk = tempfile::NamedTempFile::new().unwrap();
        disk.write_all(&[0xEE; 4096]).unwrap();

        Tiny::new().unwrap().serialize(disk.path()).unwrap();

        assert_eq!(disk.as_file().metadata().unwrap().len(), 1024);
    }

    #[test]
    fn image_round_trips_through_file() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let store = populated_store();
        store.serialize(disk.path()).unwrap();

        let loaded = Tiny::deserialize(disk.path()).unwrap();

        assert_eq!(loaded.used_blocks(), store.used_blocks());
        assert_eq!(loaded.as_bytes(), store.as_bytes());
        let mut out = vec![0; 16];
        assert_eq!(loaded.read(40, &mut out), 16);
        assert_eq!(out, vec![41; 16]);
    }

    #[test]
    fn partial_writes_are_accumulated() {
        let store = populated_store();
        let mut out = Trickle {
            sink: Vec::new(),
            per_call: 100,
        };

        assert_eq!(store.write_image(&mut out).unwrap(), 1024);
        assert_eq!(out.sink, store.as_bytes());
    }

    #[test]
    fn stalled_writer_fails_the_image_write() {
        let store = populated_store();

        match store.write_image(Full { room: 512 }) {
            Err(StoreError::Io(e)) => assert_eq!(e.kind(), ErrorKind::WriteZero),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut disk = tempfile::NamedTempFile::new().unwrap();
        disk.write_all(&[0; 1000]).unwrap();

        match Tiny::deserialize(disk.path()) {
            Err(StoreError::ShortImage {
                expected: 1024,
                read: 1000,
            }) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn padded_image_needs_opt_in() {
        let mut disk = tempfile::NamedTempFile::new().unwrap();
        populated_store().write_image(disk.as_file_mut()).unwrap();
        disk.write_all(&[0xEE; 16]).unwrap();

        match Tiny::deserialize(disk.path()) {
            Err(StoreError::TrailingData { expected: 1024 }) => (),
            other => panic!("unexpected result {:?}", other),
        }

        let loaded: Tiny = ImageLoader::from(disk.reopen().unwrap())
            .allow_padding(true)
            .load()
            .unwrap();
        assert_eq!(loaded.used_blocks(), 5);
    }

    #[test]
    fn missing_image_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();

        match Tiny::deserialize(dir.path().join("missing.img")) {
            Err(StoreError::Io(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unwritable_destination_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();

        // A directory can't be opened as the image file.
        match populated_store().serialize(dir.path()) {
            Err(StoreError::Io(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn image_without_bitmap_reservation_is_loaded_as_is() {
        // Blocks 0..63 are marked used, but the bitmap's own block 63 is not.
        let mut image = vec![0; 1024];
        for byte in &mut image[1008..1015] {
            *byte = 0xFF;
        }
        image[1015] = 0x7F;
        let mut disk = tempfile::NamedTempFile::new().unwrap();
        disk.write_all(&image).unwrap();

        let mut loaded = Tiny::deserialize(disk.path()).unwrap();

        assert_eq!(loaded.used_blocks(), 63);
        assert!(!loaded.is_allocated(63));
        // The image is trusted, so its bitmap block is handed out like any other.
        assert_eq!(loaded.allocate(), Some(63));
        assert!(Tiny::is_reserved(63));
        assert_eq!(loaded.allocate(), None);
    }

    #[test]
    fn image_bitmap_replaces_fresh_bitmap() {
        // An image with every block marked used, data included.
        let mut image = vec![0; 1024];
        for byte in &mut image[1008..1016] {
            *byte = 0xFF;
        }
        let mut disk = tempfile::NamedTempFile::new().unwrap();
        disk.write_all(&image).unwrap();

        let mut loaded = Tiny::deserialize(disk.path()).unwrap();

        assert_eq!(loaded.used_blocks(), 64);
        assert_eq!(loaded.allocate(), None);
    }
}
