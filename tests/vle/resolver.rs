// Extent resolution against fixture images.
//
// Coverage:
//   - extents starting on and off cluster boundaries
//   - look-back into the previous cluster and NONHEAD chains
//   - PLAIN extents clear the zipped flag
//   - end-of-file clipping
//   - corrupt records: zero or oversized delta, look-back from cluster 0,
//     unknown cluster type
//   - compatibility records with and without the mount option, and PLAIN
//     records reaching back under it
//   - metadata block reuse across consecutive lookups
//   - resolved extents agree with the image layout (proptest)

use proptest::prelude::*;
use zvle::blockdev::Completion;
use zvle::config::BLOCK_SIZE;
use zvle::vle::{IndexRecord, MapBlocks, Resolver};
use zvle::ZipError;

use crate::support::{self, build, text, ExtentSpec, Image};

fn resolve(image: &Image, config: zvle::Config, offset: u64) -> zvle::Result<MapBlocks> {
    let m = support::mount(image, config, Completion::Inline);
    let mut resolver = Resolver::new(&m.sb, &m.inode);
    resolver.resolve(offset)
}

fn pa(image: &Image, k: usize) -> u64 {
    image.extents[k].pblk * BLOCK_SIZE as u64
}

/// Extents of 6000, 5000 and 3000 bytes over 4 KiB clusters.
fn unaligned() -> Image {
    let specs = [ExtentSpec::lz4(6000), ExtentSpec::lz4(5000), ExtentSpec::lz4(3000)];
    build(&text(14_000, 0), &specs, 12)
}

// ─────────────────────────────────────────────────────────────────────────────
// Well-formed images
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn aligned_extent_maps_whole_cluster() {
    let image = build(&text(3 * 4096, 0), &support::uniform(3, 4096), 12);
    let map = resolve(&image, support::config(), 4096 + 17).unwrap();
    assert!(map.is_mapped());
    assert!(map.is_zipped());
    assert_eq!(map.m_la, 4096);
    assert_eq!(map.m_llen, 4096);
    assert_eq!(map.m_pa, pa(&image, 1));
    assert_eq!(map.m_plen, 4096);
}

#[test]
fn offset_before_clusterofs_looks_back() {
    let image = unaligned();
    // lcn 1 starts extent 1 at 6000; 5000 still belongs to extent 0.
    let map = resolve(&image, support::config(), 5000).unwrap();
    assert_eq!(map.m_la, 0);
    assert_eq!(map.end(), 6000);
    assert_eq!(map.m_pa, pa(&image, 0));
}

#[test]
fn offset_after_clusterofs_starts_new_extent() {
    let image = unaligned();
    let map = resolve(&image, support::config(), 7000).unwrap();
    assert_eq!(map.m_la, 6000);
    assert_eq!(map.end(), 8192);
    assert_eq!(map.m_pa, pa(&image, 1));
}

#[test]
fn nonhead_follows_delta_to_head() {
    let image = unaligned();
    let map = resolve(&image, support::config(), 13_000).unwrap();
    assert_eq!(map.m_la, 11_000);
    assert_eq!(map.end(), 16_384);
    assert_eq!(map.m_pa, pa(&image, 2));
    assert!(map.is_zipped());
}

#[test]
fn plain_extent_is_not_zipped() {
    let specs = [ExtentSpec::plain(4096), ExtentSpec::lz4(8192)];
    let image = build(&text(12_288, 0), &specs, 12);
    let plain = resolve(&image, support::config(), 100).unwrap();
    assert!(plain.is_mapped());
    assert!(!plain.is_zipped());
    let zipped = resolve(&image, support::config(), 9000).unwrap();
    assert!(zipped.is_zipped());
    assert_eq!(zipped.m_la, 4096);
}

#[test]
fn plain_extent_reached_by_look_back_is_not_zipped() {
    // Only resolved, so the plain cluster's truncated store does not matter.
    let specs = [ExtentSpec::plain(5000), ExtentSpec::lz4(7096)];
    let image = build(&text(12_096, 0), &specs, 12);
    let map = resolve(&image, support::config(), 4500).unwrap();
    assert!(map.is_mapped());
    assert!(!map.is_zipped());
    assert_eq!(map.m_la, 0);
    assert_eq!(map.end(), 5000);
}

#[test]
fn offsets_past_eof_are_unmapped() {
    let image = unaligned();
    for offset in [14_000, 14_001, 20_000] {
        let map = resolve(&image, support::config(), offset).unwrap();
        assert!(!map.is_mapped(), "offset {offset}");
        assert_eq!(map.m_la, 14_000);
        assert_eq!(map.m_flags, 0);
    }
}

#[test]
fn metadata_block_is_reused() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    let before = m.sb.stats.snapshot().meta_reads;
    let mut resolver = Resolver::new(&m.sb, &m.inode);
    for offset in [0, 5000, 7000, 13_000, 9000] {
        resolver.resolve(offset).unwrap();
    }
    assert_eq!(m.sb.stats.snapshot().meta_reads, before + 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Corrupt records
// ─────────────────────────────────────────────────────────────────────────────

fn two_cluster_extent() -> Image {
    build(&text(8192, 0), &[ExtentSpec::lz4(8192)], 12)
}

#[test]
fn zero_delta_is_corrupt() {
    let mut image = two_cluster_extent();
    image.set_record(1, IndexRecord::nonhead(0, 0));
    let err = resolve(&image, support::config(), 5000).unwrap_err();
    assert!(matches!(err, ZipError::CorruptMetadata { lcn: 1, .. }), "{err}");
}

#[test]
fn delta_past_cluster_zero_is_corrupt() {
    let mut image = two_cluster_extent();
    image.set_record(1, IndexRecord::nonhead(2, 0));
    let err = resolve(&image, support::config(), 5000).unwrap_err();
    assert!(matches!(err, ZipError::CorruptMetadata { nid: 1, lcn: 1, .. }), "{err}");
}

#[test]
fn look_back_from_cluster_zero_is_corrupt() {
    let mut image = two_cluster_extent();
    let pblk = image.extents[0].pblk as u32;
    image.set_record(0, IndexRecord::head(100, pblk));
    let err = resolve(&image, support::config(), 10).unwrap_err();
    assert!(matches!(err, ZipError::CorruptMetadata { lcn: 0, .. }), "{err}");
}

#[test]
fn compat_record_needs_mount_option() {
    let mut image = two_cluster_extent();
    image.set_record(1, IndexRecord::huawei_compat(4096, 0, 0));
    let err = resolve(&image, support::config(), 5000).unwrap_err();
    assert!(matches!(err, ZipError::CorruptMetadata { lcn: 1, .. }), "{err}");

    let map = resolve(&image, support::config().with_huawei_compat(true), 5000).unwrap();
    assert_eq!(map.m_la, 0);
    assert_eq!(map.end(), 8192);
    assert_eq!(map.m_pa, pa(&image, 0));
}

#[test]
fn compat_record_before_cluster_zero_is_corrupt() {
    let mut image = two_cluster_extent();
    image.set_record(0, IndexRecord::huawei_compat(4096, 0, 0));
    let err = resolve(&image, support::config().with_huawei_compat(true), 10).unwrap_err();
    assert!(matches!(err, ZipError::CorruptMetadata { lcn: 0, .. }), "{err}");
}

#[test]
fn plain_record_reaches_back_under_compat_option() {
    let mut image = two_cluster_extent();
    image.set_record(1, IndexRecord::plain(4096, 0));
    let map = resolve(&image, support::config().with_huawei_compat(true), 5000).unwrap();
    assert_eq!(map.m_la, 0);
    assert_eq!(map.end(), 8192);
    assert_eq!(map.m_pa, pa(&image, 0));
    assert!(map.is_zipped());
}

#[test]
fn plain_record_found_by_look_back_honours_compat_option() {
    let mut image = build(&text(3 * 4096, 0), &support::uniform(3, 4096), 12);
    let pblk = image.extents[0].pblk as u32;
    // lcn 2 points one cluster back at a PLAIN record that reaches back one more.
    image.set_record(1, IndexRecord::plain(4096, pblk));
    image.set_record(2, IndexRecord::nonhead(1, 0));

    let map = resolve(&image, support::config().with_huawei_compat(true), 9000).unwrap();
    assert_eq!(map.m_la, 0);
    assert_eq!(map.m_pa, pa(&image, 0));
    assert!(!map.is_zipped());

    let map = resolve(&image, support::config(), 9000).unwrap();
    assert_eq!(map.m_la, 4096);
    assert!(!map.is_zipped());
}

// ─────────────────────────────────────────────────────────────────────────────
// Layout consistency
// ─────────────────────────────────────────────────────────────────────────────

fn extent_lengths() -> impl Strategy<Value = Vec<usize>> {
    (prop::collection::vec(4096usize..12_000, 0..5), 1usize..12_000).prop_map(|(mut inner, last)| {
        inner.push(last);
        inner
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn resolved_extent_contains_offset(lens in extent_lengths(), step in 401u64..3000) {
        let size: usize = lens.iter().sum();
        let specs: Vec<ExtentSpec> = lens.iter().map(|&l| ExtentSpec::lz4(l)).collect();
        let image = build(&text(size, 7), &specs, 12);
        let m = support::mount(&image, support::config(), Completion::Inline);
        let mut resolver = Resolver::new(&m.sb, &m.inode);

        let mut offset = 0;
        while offset < size as u64 {
            let map = resolver.resolve(offset).unwrap();
            let ext = image.extent_at(offset);
            prop_assert!(map.is_mapped());
            prop_assert!(map.contains(offset));
            prop_assert_eq!(map.m_la, ext.la);
            prop_assert_eq!(map.m_pa, ext.pblk * BLOCK_SIZE as u64);
            // The extent is cut at its end or at the resolved cluster's end.
            let cluster_end = ((offset >> 12) + 1) << 12;
            prop_assert!(map.end() <= (ext.la + ext.len as u64).max(cluster_end));
            offset += step;
        }
    }
}
