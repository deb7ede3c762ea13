#![no_main]
use libfuzzer_sys::fuzz_target;
use zvle::vle::IndexRecord;

fuzz_target!(|data: &[u8]| {
    let Some(rec) = IndexRecord::decode(data) else { return };
    let _ = rec.cluster_type();
    let _ = rec.blkaddr();
    let _ = (rec.delta(0), rec.delta(1));
    for bits in [12u32, 13, 14] {
        let _ = rec.previous_clusters(1 << bits);
    }
    // Encoding is the inverse of decoding for the record's own bytes.
    assert_eq!(&rec.encode()[..], &data[..8]);
});
