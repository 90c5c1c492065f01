use statusrelay::record::{ModuleEntry, ModuleState, StatusRecord};
use statusrelay::store::ModuleStateStore;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn record(entries: &[(&str, ModuleState)]) -> StatusRecord {
    StatusRecord::new(
        None,
        entries
            .iter()
            .map(|(id, state)| ModuleEntry::new(*id, *state))
            .collect(),
    )
}

#[test]
fn test_apply_twice_equals_apply_once() {
    let dir = tempdir().unwrap();
    let store = ModuleStateStore::open(&dir.path().join("db.sqlite")).unwrap();
    let message = record(&[("A", ModuleState::Run), ("B", ModuleState::Offline)]);

    let first = store.apply(&message).unwrap();
    let states_once: Vec<_> = store.list().unwrap().into_iter().map(|m| (m.module_id, m.state)).collect();

    let second = store.apply(&message).unwrap();
    let states_twice: Vec<_> = store.list().unwrap().into_iter().map(|m| (m.module_id, m.state)).collect();

    assert_eq!(first.created, 2);
    assert_eq!(second.unchanged, 2);
    assert_eq!(states_once, states_twice);
}

#[test]
fn test_states_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("db.sqlite");

    {
        let store = ModuleStateStore::open(&path).unwrap();
        store.apply(&record(&[("A", ModuleState::NotReady)])).unwrap();
    }

    let store = ModuleStateStore::open(&path).unwrap();
    assert_eq!(store.get("A").unwrap(), Some(ModuleState::NotReady));
    assert_eq!(store.get("missing").unwrap(), None);
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn test_concurrent_overlapping_records_stay_consistent() {
    let dir = tempdir().unwrap();
    let store = Arc::new(ModuleStateStore::open(&dir.path().join("db.sqlite")).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let state = ModuleState::ALL[i % ModuleState::ALL.len()];
                for _ in 0..10 {
                    // Reverse order on odd threads to exercise lock ordering.
                    let message = if i % 2 == 0 {
                        record(&[("shared-1", state), ("shared-2", state), ("own", state)])
                    } else {
                        record(&[("shared-2", state), ("shared-1", state)])
                    };
                    store.apply(&message).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every record writes the same state to both shared modules atomically.
    let one = store.get("shared-1").unwrap().unwrap();
    let two = store.get("shared-2").unwrap().unwrap();
    assert_eq!(one, two);
    assert_eq!(store.len().unwrap(), 3);
}
