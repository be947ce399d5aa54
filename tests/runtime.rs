//! Hit-file protocol tests against the public runtime surface.
//!
//! These mirror the contract the injected tracker follows in-process:
//! create-or-accumulate under the named mutex, strict length checking,
//! and idempotent unloads across isolation domains sharing one file.

use std::{sync::Arc, thread};

use ilcover::{
    hits::{HitFile, HitTracker, NamedMutex},
    Error,
};

fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn two_domain_unloads_accumulate() {
    // First unload writes [3, 4]; a second domain holds [1, 2] in
    // memory; the file ends as length 2 followed by [4, 6].
    let (_dir, path) = scratch("Widgets.dll_run1");

    let first = HitTracker::new(&path, 2);
    for _ in 0..3 {
        first.record_hit(1);
    }
    for _ in 0..4 {
        first.record_hit(2);
    }
    first.unload().unwrap();

    let second = HitTracker::new(&path, 2);
    second.record_hit(1);
    for _ in 0..2 {
        second.record_hit(2);
    }
    second.unload().unwrap();

    assert_eq!(HitFile::read(&path).unwrap(), vec![4, 6]);
}

#[test]
fn repeated_unload_of_one_tracker_is_idempotent() {
    let (_dir, path) = scratch("Widgets.dll_run2");
    let tracker = HitTracker::new(&path, 3);
    tracker.record_hit(2);

    tracker.unload().unwrap();
    tracker.unload().unwrap(); // both exit hooks firing
    assert_eq!(HitFile::read(&path).unwrap(), vec![0, 1, 0]);
}

#[test]
fn mismatched_update_is_rejected_without_write() {
    let (_dir, path) = scratch("Widgets.dll_run3");
    HitFile::write_or_merge(&path, &[5, 6, 7]).unwrap();

    let wrong_size = HitTracker::new(&path, 2);
    wrong_size.record_hit(1);
    match wrong_size.unload() {
        Err(Error::HitFileMismatch { expected, actual }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 3);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }

    assert_eq!(HitFile::read(&path).unwrap(), vec![5, 6, 7]);
}

#[test]
fn many_threads_one_tracker() {
    let (_dir, path) = scratch("Widgets.dll_run4");
    let tracker = Arc::new(HitTracker::new(&path, 4));

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let tracker = tracker.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    tracker.record_hit(1 + ((worker + i) % 4) as u32);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    tracker.unload().unwrap();
    let counts = HitFile::read(&path).unwrap();
    assert_eq!(counts.iter().map(|&c| c as i64).sum::<i64>(), 8 * 250);
}

#[test]
fn named_mutex_serialises_writers() {
    let (_dir, path) = scratch("Widgets.dll_run5");

    let guard = NamedMutex::acquire(&path).unwrap();
    let path_for_thread = path.clone();
    let contender = thread::spawn(move || {
        // Blocks until the holder releases, then succeeds.
        let _guard = NamedMutex::acquire(&path_for_thread).unwrap();
    });

    thread::sleep(std::time::Duration::from_millis(50));
    drop(guard);
    contender.join().unwrap();
}
