//! Registry service implementation
//!
//! The operation-level API over the record list. Every mutation follows the
//! same path:
//!
//! 1. locate the current record under a reader session and check the
//!    precondition
//! 2. build the replacement and allocate its node, outside any lock
//! 3. publish it under the writer lock
//! 4. end the session and hand the old node to the reclamation scheduler
//!
//! A failure at any step publishes nothing.

use std::io;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::list::Registry;
use super::record::{truncate_field, Record, RecordId};
use super::writer::WriterLock;
use crate::rcu::{ReaderSession, ReclaimMode, ReclamationScheduler};
use crate::stats::RegistryStats;

/// Concurrent record registry
///
/// Reads never block. Writers serialize only around the publish step.
/// Share it between threads behind an `Arc`.
#[derive(Debug)]
pub struct RegistryService {
    // Dropped before the scheduler, so reachable records are freed first and
    // the worker then drains whatever is still retired
    registry: Registry,
    writer: WriterLock,
    scheduler: ReclamationScheduler,
    config: RegistryConfig,
}

impl RegistryService {
    /// Create a new registry with default configuration
    pub fn new() -> io::Result<Self> {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> io::Result<Self> {
        let scheduler = ReclamationScheduler::with_config(config.reclaim.clone())?;
        let registry = Registry::new(scheduler.domain(), config.max_allocated_records);

        Ok(Self {
            registry,
            writer: WriterLock::new(),
            scheduler,
            config,
        })
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Lock-free view of the records, read under [`read_session`](Self::read_session)
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The reclamation scheduler backing this registry
    pub fn scheduler(&self) -> &ReclamationScheduler {
        &self.scheduler
    }

    /// Begin a reader session for direct traversal of [`registry`](Self::registry)
    pub fn read_session(&self) -> ReaderSession<'_> {
        self.scheduler.read_lock()
    }

    /// Add a record
    ///
    /// `id` must not be in use; duplicates are not detected. Name and author
    /// are truncated to the configured maximum length.
    pub fn add(&self, id: RecordId, name: &str, author: &str) -> Result<(), RegistryError> {
        let name = truncate_field(name, self.config.max_field_len);
        let author = truncate_field(author, self.config.max_field_len);

        let pending = self.registry.prepare(Record::new(id, name, author))?;
        {
            let writer = self.writer.lock();
            self.registry.insert(pending, &writer);
        }

        tracing::info!(id = id, name = name, author = author, "Record added");
        Ok(())
    }

    /// Get a copy of the record with `id`
    pub fn find(&self, id: RecordId) -> Result<Record, RegistryError> {
        let session = self.scheduler.read_lock();
        self.registry
            .find(id, &session)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Check whether the record with `id` is borrowed
    pub fn is_borrowed(&self, id: RecordId) -> Result<bool, RegistryError> {
        let session = self.scheduler.read_lock();
        self.registry
            .find(id, &session)
            .map(Record::is_borrowed)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Mark the record as borrowed
    pub fn borrow(&self, id: RecordId, mode: ReclaimMode) -> Result<(), RegistryError> {
        self.update_if(id, mode, |record| {
            if record.borrowed {
                return Err(RegistryError::AlreadyBorrowed(id));
            }
            Ok(record.with_borrowed(true))
        })?;

        tracing::info!(id = id, mode = ?mode, "Record borrowed");
        Ok(())
    }

    /// Mark the record as returned
    pub fn return_item(&self, id: RecordId, mode: ReclaimMode) -> Result<(), RegistryError> {
        self.update_if(id, mode, |record| {
            if !record.borrowed {
                return Err(RegistryError::NotBorrowed(id));
            }
            Ok(record.with_borrowed(false))
        })?;

        tracing::info!(id = id, mode = ?mode, "Record returned");
        Ok(())
    }

    /// Replace the record with `id` by the value `mutate` builds from it
    ///
    /// `mutate` sees the current record and either returns its replacement or
    /// an error, which aborts the update with nothing published. It may run
    /// more than once if another writer replaces the record concurrently. The
    /// replacement always keeps `id`.
    ///
    /// In [`ReclaimMode::Sync`] this waits for a grace period, so the calling
    /// thread must not hold a reader session.
    pub fn update_if<F>(&self, id: RecordId, mode: ReclaimMode, mutate: F) -> Result<(), RegistryError>
    where
        F: Fn(&Record) -> Result<Record, RegistryError>,
    {
        loop {
            let session = self.scheduler.read_lock();
            let old = self
                .registry
                .entry(id, &session)
                .ok_or(RegistryError::NotFound(id))?;

            let mut new = mutate(old.record())?;
            new.id = id;
            let pending = self.registry.prepare(new)?;

            let published = {
                let writer = self.writer.lock();
                self.registry.replace(old, pending, &writer)
            };
            session.end();

            match published {
                Ok(retired) => {
                    self.scheduler.retire(retired, mode);
                    return Ok(());
                }
                Err(RegistryError::NotFound(_)) => {
                    tracing::debug!(id = id, "Record superseded before publish, relocating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the record with `id`
    ///
    /// In [`ReclaimMode::Sync`] this waits for a grace period, so the calling
    /// thread must not hold a reader session.
    pub fn delete(&self, id: RecordId, mode: ReclaimMode) -> Result<(), RegistryError> {
        let retired = {
            let writer = self.writer.lock();
            self.registry.remove(id, &writer)?
        };
        self.scheduler.retire(retired, mode);

        tracing::info!(id = id, mode = ?mode, "Record deleted");
        Ok(())
    }

    /// Copies of all reachable records, in registry order
    pub fn snapshot(&self) -> Vec<Record> {
        let session = self.scheduler.read_lock();
        self.registry.iter(&session).cloned().collect()
    }

    /// Number of reachable records
    pub fn len(&self) -> usize {
        let session = self.scheduler.read_lock();
        self.registry.len(&session)
    }

    /// Check if the registry has no reachable records
    pub fn is_empty(&self) -> bool {
        let session = self.scheduler.read_lock();
        self.registry.is_empty(&session)
    }

    /// Wait until every reader session open now has ended
    pub fn synchronize(&self) {
        self.scheduler.synchronize();
    }

    /// Wait until every deferred reclamation queued so far has run
    ///
    /// Blocking; from async code use [`barrier_async`](Self::barrier_async).
    pub fn barrier(&self) {
        self.scheduler.barrier();
    }

    /// Wait until every deferred reclamation queued so far has run
    pub async fn barrier_async(&self) {
        self.scheduler.barrier_async().await;
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            records: self.len(),
            allocated_records: self.registry.allocated(),
            reclaim: self.scheduler.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn books() -> RegistryService {
        let service = RegistryService::new().unwrap();
        service.add(0, "book1", "jb").unwrap();
        service.add(1, "book2", "jb").unwrap();
        service
    }

    #[test]
    fn test_add_find_round_trip() {
        let service = RegistryService::new().unwrap();
        assert_ok!(service.add(7, "book1", "jb"));

        let record = assert_ok!(service.find(7));
        assert_eq!(
            record,
            Record {
                id: 7,
                name: "book1".into(),
                author: "jb".into(),
                borrowed: false,
            }
        );
    }

    #[test]
    fn test_borrow_return_delete_scenario() {
        let service = books();

        assert_ok!(service.borrow(0, ReclaimMode::Sync));
        assert!(assert_ok!(service.is_borrowed(0)));
        assert_eq!(
            assert_err!(service.borrow(0, ReclaimMode::Sync)),
            RegistryError::AlreadyBorrowed(0)
        );
        assert_ok!(service.return_item(0, ReclaimMode::Sync));
        assert!(!assert_ok!(service.is_borrowed(0)));
        assert_ok!(service.delete(0, ReclaimMode::Async));
        assert_eq!(assert_err!(service.find(0)), RegistryError::NotFound(0));

        // The other record is untouched
        assert_eq!(&*assert_ok!(service.find(1)).name, "book2");
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn test_borrow_conflict_is_idempotent() {
        let service = books();
        assert_ok!(service.borrow(1, ReclaimMode::Sync));
        let before = service.stats();

        for _ in 0..3 {
            assert_eq!(
                assert_err!(service.borrow(1, ReclaimMode::Sync)),
                RegistryError::AlreadyBorrowed(1)
            );
        }

        let after = service.stats();
        assert_eq!(before, after);
        assert!(assert_ok!(service.is_borrowed(1)));
    }

    #[test]
    fn test_return_not_borrowed() {
        let service = books();

        assert_eq!(
            assert_err!(service.return_item(0, ReclaimMode::Async)),
            RegistryError::NotBorrowed(0)
        );
        assert_eq!(service.stats().reclaim.retired, 0);
    }

    #[test]
    fn test_missing_record() {
        let service = books();

        assert_eq!(assert_err!(service.find(9)), RegistryError::NotFound(9));
        assert_eq!(assert_err!(service.is_borrowed(9)), RegistryError::NotFound(9));
        assert_eq!(
            assert_err!(service.borrow(9, ReclaimMode::Sync)),
            RegistryError::NotFound(9)
        );
        assert_eq!(
            assert_err!(service.return_item(9, ReclaimMode::Async)),
            RegistryError::NotFound(9)
        );
        assert_eq!(
            assert_err!(service.delete(9, ReclaimMode::Sync)),
            RegistryError::NotFound(9)
        );
        assert_eq!(service.len(), 2);
    }

    #[test]
    fn test_snapshot_in_insertion_order() {
        let service = books();
        service.add(2, "book3", "kim").unwrap();
        service.borrow(1, ReclaimMode::Sync).unwrap();

        let snapshot = service.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(snapshot[1].borrowed);
        assert_eq!(&*snapshot[2].author, "kim");
    }

    #[test]
    fn test_delete_then_reuse_id() {
        let service = books();

        service.delete(0, ReclaimMode::Sync).unwrap();
        assert!(service.find(0).is_err());

        service.add(0, "book1-2nd", "jb").unwrap();
        assert_eq!(&*service.find(0).unwrap().name, "book1-2nd");
        assert_eq!(service.snapshot().iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_fields_truncated() {
        let service =
            RegistryService::with_config(RegistryConfig::default().max_field_len(4)).unwrap();
        service.add(0, "abcdefgh", "jb").unwrap();

        let record = service.find(0).unwrap();
        assert_eq!(&*record.name, "abcd");
        assert_eq!(&*record.author, "jb");
    }

    #[test]
    fn test_out_of_memory_leaves_old_record() {
        let service = RegistryService::with_config(
            RegistryConfig::default().max_allocated_records(2),
        )
        .unwrap();
        service.add(0, "book1", "jb").unwrap();
        service.add(1, "book2", "jb").unwrap();

        assert_eq!(
            assert_err!(service.borrow(0, ReclaimMode::Sync)),
            RegistryError::OutOfMemory
        );
        assert_eq!(
            assert_err!(service.add(2, "book3", "jb")),
            RegistryError::OutOfMemory
        );

        assert_eq!(service.find(0).unwrap(), Record::new(0, "book1", "jb"));
        assert_eq!(service.len(), 2);
        assert_eq!(service.stats().allocated_records, 2);
        assert_eq!(service.stats().reclaim.retired, 0);

        // Deleting frees a slot once reclaimed
        service.delete(1, ReclaimMode::Sync).unwrap();
        assert_ok!(service.borrow(0, ReclaimMode::Sync));
    }

    #[test]
    fn test_sync_mode_frees_inline() {
        let service = books();

        service.borrow(0, ReclaimMode::Sync).unwrap();

        let stats = service.stats();
        assert_eq!(stats.allocated_records, 2);
        assert_eq!(stats.reclaim.reclaimed_inline, 1);
        assert_eq!(stats.reclaim.pending(), 0);
    }

    #[test]
    fn test_async_callbacks_counted() {
        let service = books();

        for _ in 0..10 {
            service.borrow(0, ReclaimMode::Async).unwrap();
            service.return_item(0, ReclaimMode::Async).unwrap();
        }
        service.delete(1, ReclaimMode::Async).unwrap();
        service.barrier();

        let stats = service.stats();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.allocated_records, 1);
        assert_eq!(stats.reclaim.retired, 21);
        assert_eq!(stats.reclaim.reclaimed_deferred, 21);
        assert_eq!(stats.reclaim.reclaimed_inline, 0);
    }

    #[tokio::test]
    async fn test_async_mode_from_runtime() {
        let service = books();

        service.borrow(0, ReclaimMode::Async).unwrap();
        service.delete(1, ReclaimMode::Async).unwrap();
        service.barrier_async().await;

        let stats = service.stats();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.allocated_records, 1);
        assert_eq!(stats.reclaim.reclaimed_deferred, 2);
    }

    #[test]
    fn test_update_if_keeps_id() {
        let service = books();

        service
            .update_if(1, ReclaimMode::Sync, |record| {
                Ok(Record {
                    id: 42,
                    name: "book2, revised".into(),
                    ..record.clone()
                })
            })
            .unwrap();

        assert!(service.find(42).is_err());
        assert_eq!(&*service.find(1).unwrap().name, "book2, revised");
    }

    #[test]
    fn test_update_if_error_publishes_nothing() {
        let service = books();

        let result = service.update_if(0, ReclaimMode::Sync, |_| Err(RegistryError::OutOfMemory));

        assert_eq!(result, Err(RegistryError::OutOfMemory));
        assert_eq!(service.find(0).unwrap(), Record::new(0, "book1", "jb"));
        assert_eq!(service.stats().allocated_records, 2);
    }

    #[test]
    fn test_update_if_relocates_after_concurrent_borrow() {
        let service = books();
        let calls = AtomicUsize::new(0);

        let result = service.update_if(0, ReclaimMode::Sync, |record| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Another writer gets in between locate and publish
                thread::scope(|s| {
                    s.spawn(|| service.borrow(0, ReclaimMode::Async).unwrap());
                });
            }
            if record.borrowed {
                return Err(RegistryError::AlreadyBorrowed(0));
            }
            Ok(record.with_borrowed(true))
        });

        assert_eq!(result, Err(RegistryError::AlreadyBorrowed(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(service.is_borrowed(0).unwrap());

        service.barrier();
        assert_eq!(service.stats().allocated_records, 2);
        assert_eq!(service.stats().reclaim.retired, 1);
    }

    #[test]
    fn test_update_if_after_concurrent_delete() {
        let service = RegistryService::new().unwrap();
        service.add(0, "book1", "jb").unwrap();
        let calls = AtomicUsize::new(0);

        let result = service.update_if(0, ReclaimMode::Sync, |record| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                thread::scope(|s| {
                    s.spawn(|| service.delete(0, ReclaimMode::Async).unwrap());
                });
            }
            Ok(record.with_borrowed(true))
        });

        assert_eq!(result, Err(RegistryError::NotFound(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.is_empty());

        service.barrier();
        assert_eq!(service.stats().allocated_records, 0);
        assert_eq!(service.stats().reclaim.pending(), 0);
    }

    #[test]
    fn test_reader_keeps_old_record_async() {
        let service = books();
        let service = &service;
        let (captured_tx, captured_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let reader = s.spawn(move || {
                let session = service.read_session();
                let old = service.registry().find(0, &session).unwrap();
                captured_tx.send(()).unwrap();
                release_rx.recv().unwrap();

                // Still the complete pre-update value
                assert_eq!(*old, Record::new(0, "book1", "jb"));
            });

            captured_rx.recv().unwrap();
            service.borrow(0, ReclaimMode::Async).unwrap();
            assert!(service.is_borrowed(0).unwrap());

            thread::sleep(Duration::from_millis(30));
            let stats = service.stats();
            assert_eq!(stats.reclaim.pending(), 1);
            assert_eq!(stats.allocated_records, 3);

            release_tx.send(()).unwrap();
            reader.join().unwrap();
        });

        service.barrier();
        assert_eq!(service.stats().allocated_records, 2);
        assert_eq!(service.stats().reclaim.pending(), 0);
    }

    #[test]
    fn test_reader_keeps_old_record_sync() {
        let service = books();
        let service = &service;
        let done = AtomicBool::new(false);
        let done = &done;
        let (captured_tx, captured_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let reader = s.spawn(move || {
                let session = service.read_session();
                let old = service.registry().find(0, &session).unwrap();
                captured_tx.send(()).unwrap();
                release_rx.recv().unwrap();

                assert!(!old.borrowed);
                assert!(!done.load(Ordering::SeqCst));
            });

            captured_rx.recv().unwrap();
            let writer = s.spawn(move || {
                service.borrow(0, ReclaimMode::Sync).unwrap();
                done.store(true, Ordering::SeqCst);
            });

            // Published, but the writer is stuck in its grace period
            thread::sleep(Duration::from_millis(50));
            assert!(!done.load(Ordering::SeqCst));
            assert!(service.is_borrowed(0).unwrap());
            assert_eq!(service.stats().allocated_records, 3);

            release_tx.send(()).unwrap();
            reader.join().unwrap();
            writer.join().unwrap();
        });

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(service.stats().allocated_records, 2);
    }

    #[test]
    fn test_no_torn_reads() {
        const UPDATES: usize = 500;

        let service = RegistryService::new().unwrap();
        service.add(0, "gen-0", "gen-0").unwrap();
        let service = &service;
        let finished = AtomicBool::new(false);
        let finished = &finished;
        let reads = AtomicUsize::new(0);
        let reads = &reads;

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(move || {
                    while !finished.load(Ordering::Acquire) {
                        let record = service.find(0).unwrap();
                        assert_eq!(record.name, record.author);

                        let session = service.read_session();
                        for record in service.registry().iter(&session) {
                            assert_eq!(record.name, record.author);
                        }
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }

            s.spawn(move || {
                for n in 1..=UPDATES {
                    let mode = if n % 2 == 0 {
                        ReclaimMode::Sync
                    } else {
                        ReclaimMode::Async
                    };
                    let generation = format!("gen-{}", n);
                    service
                        .update_if(0, mode, |record| {
                            Ok(Record {
                                name: generation.as_str().into(),
                                author: generation.as_str().into(),
                                ..record.clone()
                            })
                        })
                        .unwrap();
                }
                finished.store(true, Ordering::Release);
            });
        });

        service.barrier();
        assert!(reads.load(Ordering::Relaxed) > 0);
        assert_eq!(&*service.find(0).unwrap().name, format!("gen-{}", UPDATES));

        let stats = service.stats();
        assert_eq!(stats.allocated_records, 1);
        assert_eq!(stats.reclaim.retired, UPDATES as u64);
        assert_eq!(stats.reclaim.reclaimed(), UPDATES as u64);
    }

    #[test]
    fn test_concurrent_writers_stay_consistent() {
        const ROUNDS: usize = 200;

        let service = books();
        let service = &service;
        let borrows = AtomicUsize::new(0);
        let returns = AtomicUsize::new(0);
        let (borrows, returns) = (&borrows, &returns);

        thread::scope(|s| {
            for t in 0..4 {
                s.spawn(move || {
                    for i in 0..ROUNDS {
                        let mode = if (t + i) % 3 == 0 {
                            ReclaimMode::Sync
                        } else {
                            ReclaimMode::Async
                        };
                        match service.borrow(0, mode) {
                            Ok(()) => {
                                borrows.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => assert_eq!(e, RegistryError::AlreadyBorrowed(0)),
                        }
                        match service.return_item(0, mode) {
                            Ok(()) => {
                                returns.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => assert_eq!(e, RegistryError::NotBorrowed(0)),
                        }
                    }
                });
            }

            // Readers run alongside the writers
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    assert_eq!(service.len(), 2);
                    assert!(service.find(1).is_ok());
                }
            });
        });

        service.barrier();

        // Each success flips the flag, so the counts can differ by the final state only
        let borrowed = service.is_borrowed(0).unwrap();
        let borrows = borrows.load(Ordering::Relaxed);
        let returns = returns.load(Ordering::Relaxed);
        assert_eq!(borrows - returns, usize::from(borrowed));

        let stats = service.stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.allocated_records, 2);
        assert_eq!(stats.reclaim.retired, (borrows + returns) as u64);
        assert_eq!(stats.reclaim.pending(), 0);
    }
}
