use blockstore::{BlockStore, ImageLoader};

pub fn main() {
    let tmp = tempfile::NamedTempFile::new().unwrap();

    // Build a small device, store a greeting and save it.
    let mut store: BlockStore<1024, 512> =
        BlockStore::new().expect("Could not initialize block store.");
    let block = store.allocate().expect("device should have free blocks");
    let mut content = [0; 512];
    content[..13].copy_from_slice(b"hello, block!");
    store.write(block, &content);
    store.serialize(tmp.path()).expect("should serialize");

    // Load it back, tolerating trailing padding.
    let store: BlockStore<1024, 512> = ImageLoader::open(tmp.path())
        .and_then(|loader| loader.allow_padding(true).load())
        .expect("should deserialize");
    let mut buf = [0; 512];
    store.read(block, &mut buf);
    println!(
        "block {}: {} ({} of {} blocks used)",
        block,
        String::from_utf8_lossy(&buf[..13]),
        store.used_blocks(),
        BlockStore::<1024, 512>::total_blocks()
    );
}
