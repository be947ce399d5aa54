//! Hit-file protocol and the in-process hit tracker.
//!
//! The injected tracker persists counters to a binary *hit file*:
//! a little-endian `i32` count `N` followed by `N` little-endian `i32`
//! counters. Accumulation is read-modify-write: when the file already
//! exists, on-disk and in-memory counters are summed element-wise, so
//! multiple isolation domains (and multiple processes) sharing one hit
//! file compose. Writers exclude each other with a named inter-process
//! mutex derived from the hit file's basename; on this side it is
//! realised as an `O_EXCL` lock file beside the hit file.
//!
//! [`HitTracker`] mirrors the injected runtime natively: lazily
//! registered per-thread counter arrays, a mutex-guarded registry, and an
//! idempotent unload that merges, persists, and clears. It backs the
//! engine's tests and host-side tooling; inside the instrumented process
//! the same protocol is executed by the injected IL.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{Error, Result};

/// Suffix of the inter-process mutex name, appended to the hit file's
/// basename.
pub const MUTEX_SUFFIX: &str = "_Mutex";

/// Reads and accumulates hit files.
pub struct HitFile;

impl HitFile {
    /// Reads all counters from a hit file, validating the length prefix.
    ///
    /// # Errors
    /// [`Error::Io`] on filesystem failure, [`Error::HitFileMismatch`]
    /// when the prefix disagrees with the payload size.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<i32>> {
        let bytes = fs::read(path)?;
        if bytes.len() < 4 {
            return Err(Error::HitFileMismatch {
                expected: 0,
                actual: 0,
            });
        }

        let count = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let count = usize::try_from(count).unwrap_or(0);
        if bytes.len() != 4 + count * 4 {
            return Err(Error::HitFileMismatch {
                expected: (bytes.len() - 4) / 4,
                actual: count,
            });
        }

        let mut counters = Vec::with_capacity(count);
        for chunk in bytes[4..].chunks_exact(4) {
            counters.push(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(counters)
    }

    /// Creates the hit file with `counts`, or sums `counts` into an
    /// existing one, under the named mutex.
    ///
    /// On a length mismatch nothing is written and
    /// [`Error::HitFileMismatch`] is returned.
    pub fn write_or_merge(path: impl AsRef<Path>, counts: &[i32]) -> Result<()> {
        let path = path.as_ref();
        let _guard = NamedMutex::acquire(path)?;

        let merged = if path.exists() {
            let existing = HitFile::read(path)?;
            if existing.len() != counts.len() {
                return Err(Error::HitFileMismatch {
                    expected: counts.len(),
                    actual: existing.len(),
                });
            }
            existing
                .iter()
                .zip(counts)
                .map(|(disk, memory)| disk.wrapping_add(*memory))
                .collect()
        } else {
            counts.to_vec()
        };

        let mut bytes = Vec::with_capacity(4 + merged.len() * 4);
        bytes.extend_from_slice(&(merged.len() as i32).to_le_bytes());
        for value in &merged {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Inter-process exclusion for one hit file.
///
/// The lock is a file named `<basename>_Mutex` beside the hit file,
/// created with `O_EXCL` semantics and removed on drop.
pub struct NamedMutex {
    lock_path: PathBuf,
}

impl NamedMutex {
    /// Acquires the mutex guarding `hits_file_path`, waiting for a
    /// bounded time for a concurrent holder.
    ///
    /// # Errors
    /// [`Error::Io`] when the lock file cannot be created or the wait
    /// times out.
    pub fn acquire(hits_file_path: &Path) -> Result<NamedMutex> {
        let lock_path = Self::lock_path(hits_file_path);

        // 10ms backoff, bounded: unload must terminate even if a peer
        // died while holding the lock.
        for _ in 0..500 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(NamedMutex { lock_path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Io(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("timed out waiting for {}", lock_path.display()),
        )))
    }

    /// The lock-file path for a hit file: `<basename>_Mutex` in the same
    /// directory.
    #[must_use]
    pub fn lock_path(hits_file_path: &Path) -> PathBuf {
        let basename = hits_file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        hits_file_path.with_file_name(format!("{basename}{MUTEX_SUFFIX}"))
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_HITS: RefCell<HashMap<u64, Arc<Vec<AtomicI32>>>> =
        RefCell::new(HashMap::new());
}

/// Native mirror of the injected per-module runtime tracker.
///
/// Hot path: each thread owns a lazily allocated counter array, so
/// recording a hit takes no cross-thread synchronisation. The registry
/// of all per-thread arrays is guarded by a mutex paid once per thread.
/// [`HitTracker::unload`] merges every per-thread array into the module
/// array, persists it to the hit file, and clears both, making a repeat
/// unload contribute zero.
pub struct HitTracker {
    id: u64,
    size: usize,
    hits_file_path: PathBuf,
    hits: Mutex<Vec<i32>>,
    registry: Mutex<Vec<Arc<Vec<AtomicI32>>>>,
}

impl HitTracker {
    /// Creates a tracker with `size` counter slots persisting to
    /// `hits_file_path`.
    #[must_use]
    pub fn new(hits_file_path: impl Into<PathBuf>, size: usize) -> Self {
        HitTracker {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            size,
            hits_file_path: hits_file_path.into(),
            hits: Mutex::new(vec![0; size]),
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Number of counter slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Records one hit for the 1-based hit index.
    ///
    /// Out-of-range indices are ignored; the instrumenter guarantees the
    /// injected code never produces one.
    pub fn record_hit(&self, hit_index: u32) {
        if hit_index == 0 || hit_index as usize > self.size {
            return;
        }
        let slot = hit_index as usize - 1;

        let counters = THREAD_HITS.with(|tls| {
            if let Some(existing) = tls.borrow().get(&self.id) {
                return existing.clone();
            }

            // Slow path, once per thread: allocate and register under
            // the registry lock, double-checking the thread-local.
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let mut map = tls.borrow_mut();
            if let Some(existing) = map.get(&self.id) {
                return existing.clone();
            }
            let fresh: Arc<Vec<AtomicI32>> =
                Arc::new((0..self.size).map(|_| AtomicI32::new(0)).collect());
            registry.push(fresh.clone());
            map.insert(self.id, fresh.clone());
            fresh
        });

        // Single writer per array: relaxed is enough, the registry lock
        // at unload orders the final reads.
        counters[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Merges all per-thread counters into the module array, persists it
    /// to the hit file, and clears all state.
    ///
    /// Safe to call more than once: a repeat unload finds an empty
    /// registry and a zeroed array, and contributes zero on disk.
    ///
    /// # Errors
    /// Propagates hit-file I/O and length-mismatch errors; in-memory
    /// state is cleared only after a successful write.
    pub fn unload(&self) -> Result<()> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            for thread_counters in registry.iter() {
                for (slot, counter) in thread_counters.iter().enumerate() {
                    hits[slot] = hits[slot].wrapping_add(counter.load(Ordering::Acquire));
                }
            }
            registry.clear();
        }

        HitFile::write_or_merge(&self.hits_file_path, &hits)?;

        // Defends against both unload hooks firing for one module.
        hits.iter_mut().for_each(|slot| *slot = 0);
        Ok(())
    }

    /// The hit file this tracker persists to.
    #[must_use]
    pub fn hits_file_path(&self) -> &Path {
        &self.hits_file_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn fresh_write_produces_prefix_and_counters() {
        let (_dir, path) = scratch("mod_abc");
        HitFile::write_or_merge(&path, &[3, 4]).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &2i32.to_le_bytes());
        assert_eq!(HitFile::read(&path).unwrap(), vec![3, 4]);
    }

    #[test]
    fn merge_sums_element_wise() {
        // S4: first unload writes [3,4]; second holds [1,2] in memory.
        let (_dir, path) = scratch("mod_abc");
        HitFile::write_or_merge(&path, &[3, 4]).unwrap();
        HitFile::write_or_merge(&path, &[1, 2]).unwrap();

        assert_eq!(HitFile::read(&path).unwrap(), vec![4, 6]);
    }

    #[test]
    fn length_mismatch_leaves_file_untouched() {
        let (_dir, path) = scratch("mod_abc");
        HitFile::write_or_merge(&path, &[1, 2, 3]).unwrap();

        let err = HitFile::write_or_merge(&path, &[1, 2]).unwrap_err();
        match err {
            Error::HitFileMismatch { expected, actual } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(HitFile::read(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mutex_name_derives_from_basename() {
        let path = Path::new("/tmp/widgets.dll_xyz");
        assert_eq!(
            NamedMutex::lock_path(path),
            Path::new("/tmp/widgets.dll_xyz_Mutex")
        );
    }

    #[test]
    fn mutex_excludes_and_releases() {
        let (_dir, path) = scratch("mod_abc");

        let guard = NamedMutex::acquire(&path).unwrap();
        assert!(NamedMutex::lock_path(&path).exists());
        drop(guard);
        assert!(!NamedMutex::lock_path(&path).exists());

        // Re-acquirable after release.
        let _second = NamedMutex::acquire(&path).unwrap();
    }

    #[test]
    fn tracker_counts_across_threads_and_unloads_once() {
        let (_dir, path) = scratch("mod_abc");
        let tracker = Arc::new(HitTracker::new(&path, 3));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record_hit(1);
                        tracker.record_hit(3);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        tracker.unload().unwrap();
        assert_eq!(HitFile::read(&path).unwrap(), vec![400, 0, 400]);

        // Second unload (both exit hooks firing) adds nothing.
        tracker.unload().unwrap();
        assert_eq!(HitFile::read(&path).unwrap(), vec![400, 0, 400]);
    }

    #[test]
    fn out_of_range_hits_are_ignored() {
        let (_dir, path) = scratch("mod_abc");
        let tracker = HitTracker::new(&path, 1);
        tracker.record_hit(0);
        tracker.record_hit(2);
        tracker.record_hit(1);
        tracker.unload().unwrap();
        assert_eq!(HitFile::read(&path).unwrap(), vec![1]);
    }

    #[test]
    fn two_trackers_share_one_hit_file() {
        let (_dir, path) = scratch("mod_abc");
        let first = HitTracker::new(&path, 2);
        let second = HitTracker::new(&path, 2);

        first.record_hit(1);
        second.record_hit(2);
        first.unload().unwrap();
        second.unload().unwrap();

        assert_eq!(HitFile::read(&path).unwrap(), vec![1, 1]);
    }
}
