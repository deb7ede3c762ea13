// Workgroup registry under contention.
//
// Coverage:
//   - racing find-or-register settles on one workgroup per key
//   - references taken by readers are all given back
//   - the last put retires a workgroup and stales its handle

use std::sync::Arc;
use std::thread;

use zvle::stats::Stats;
use zvle::zip::{ChainLink, Format, InplaceStrategy, Registry, Workgroup};
use zvle::ZipError;

const KEYS: u64 = 8;

fn new_grp(key: u64) -> Arc<Workgroup> {
    Arc::new(Workgroup::new(key, Format::Lz4, 4096, 1, 0, InplaceStrategy::default(), ChainLink::Nil))
}

fn find_or_register(reg: &Registry, key: u64) -> Option<Arc<Workgroup>> {
    if let Some(grp) = reg.find(key) {
        return Some(grp);
    }
    reg.register(new_grp(key)).ok()
}

#[test]
fn racing_registration_keeps_one_group_per_key() {
    let stats = Arc::new(Stats::default());
    let reg = Arc::new(Registry::new(Arc::clone(&stats)));

    let workers: Vec<_> = (0..8u64)
        .map(|t| {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                for i in 0..2000u64 {
                    let key = (i + t) % KEYS;
                    if let Some(grp) = find_or_register(&reg, key) {
                        assert_eq!(grp.index, key);
                        reg.put(&grp);
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(reg.len(), KEYS as usize);
    assert_eq!(stats.snapshot().workgroups_created, KEYS);
    assert_eq!(stats.snapshot().workgroups_freed, 0);
    for key in 0..KEYS {
        let grp = reg.find(key).unwrap();
        // The registry's reference plus ours.
        assert_eq!(grp.refcount(), 2);
        reg.put(&grp);
    }
}

#[test]
fn last_put_retires_and_stales_handle() {
    let stats = Arc::new(Stats::default());
    let reg = Registry::new(Arc::clone(&stats));
    let grp = reg.register(new_grp(3)).unwrap();
    let handle = grp.handle().unwrap();

    let again = reg.find(3).unwrap();
    reg.put(&again);
    reg.put(&grp);
    assert!(reg.get(handle).is_ok());

    reg.put(&grp);
    assert!(matches!(reg.get(handle), Err(ZipError::StaleHandle)));
    assert!(reg.find(3).is_none());
    assert!(reg.is_empty());
    assert_eq!(stats.snapshot().workgroups_freed, 1);
}

#[test]
fn snapshot_lists_registered_groups() {
    let reg = Registry::new(Arc::new(Stats::default()));
    for key in [10, 20, 30] {
        let grp = reg.register(new_grp(key)).unwrap();
        reg.put(&grp);
    }
    let mut keys: Vec<u64> = reg.snapshot().iter().map(|g| g.index).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![10, 20, 30]);
    assert!(reg.snapshot().iter().all(|g| g.refcount() == 1));
}
