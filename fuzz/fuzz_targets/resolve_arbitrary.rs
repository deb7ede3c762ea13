#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use zvle::blockdev::{Completion, MemDevice};
use zvle::vle::Resolver;
use zvle::{Config, Geometry, Superblock};

fuzz_target!(|data: &[u8]| {
    // Treat the input as an image whose metadata starts at block 0.
    let mut image = data.to_vec();
    image.resize(image.len().div_ceil(4096).max(1) * 4096, 0);
    let dev = Arc::new(MemDevice::new(image, Completion::Inline));
    let Ok(geometry) = Geometry::new(0, 12) else { return };
    let Ok(sb) = Superblock::new(dev, geometry, Config::default().with_workers(1)) else { return };
    let Ok(inode) = sb.read_inode(1) else { return };

    let mut resolver = Resolver::new(&sb, &inode);
    let size = inode.size.min(1 << 20);
    let mut offset = 0;
    while offset < size {
        match resolver.resolve(offset) {
            Ok(map) if map.is_mapped() => assert!(map.contains(offset)),
            _ => {}
        }
        offset += 1021;
    }
});
