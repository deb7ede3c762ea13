#![no_main]
use libfuzzer_sys::fuzz_target;
use zvle::codec::decompress_partial;

fuzz_target!(|data: &[u8]| {
    // Malformed input must come back as an error, never a panic.
    for target in [0usize, 1, 4096, 8192] {
        let mut dst = vec![0u8; target];
        if let Ok(n) = decompress_partial(data, &mut dst, target) {
            assert!(n <= target);
        }
    }

    // A target larger than the buffer is rejected up front.
    let mut small = [0u8; 16];
    assert!(decompress_partial(data, &mut small, 17).is_err());
});
