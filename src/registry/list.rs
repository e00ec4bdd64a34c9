//! RCU-protected record list
//!
//! A singly linked list of heap nodes. Readers walk it with `Acquire` loads and
//! no lock. Writers, holding the writer lock, change it only by storing a
//! single link:
//!
//! ```text
//!  replace:   prev ──► old ──► next          prev ──► new ──► next
//!                                    ==>              old ──┘
//!  remove:    prev ──► old ──► next          prev ──────────► next
//!                                    ==>              old ──┘
//! ```
//!
//! The unlinked node keeps pointing at its successor, so a reader standing on
//! it finishes its traversal normally. The node is returned as a [`Retired`]
//! value and must go through the reclamation scheduler before it is freed.
//!
//! Each node also remembers the link that points at it, and the registry
//! remembers the link at the tail. Both are only read and written under the
//! writer lock, so appending and replacing a located record never walk the
//! list.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use super::error::RegistryError;
use super::record::{Record, RecordId};
use super::writer::WriterGuard;
use crate::rcu::ReaderSession;

type Link = AtomicPtr<Node>;

struct Node {
    record: Record,
    next: Link,
    /// Link currently pointing at this node; writer-only
    link: AtomicPtr<Link>,
    /// Set once the node is unlinked; writer-only
    unlinked: AtomicBool,
}

/// Accounting for allocated record nodes
#[derive(Debug)]
pub(crate) struct Budget {
    allocated: AtomicUsize,
    limit: usize,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            limit,
        }
    }

    fn reserve(&self) -> Result<(), RegistryError> {
        if self.limit == 0 {
            self.allocated.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RegistryError::OutOfMemory)
    }

    fn release(&self) {
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

fn alloc_node(record: Record, budget: &Budget) -> Result<NonNull<Node>, RegistryError> {
    budget.reserve()?;

    // SAFETY: Node is not zero-sized
    let raw = unsafe { alloc::alloc(Layout::new::<Node>()) }.cast::<Node>();
    let Some(node) = NonNull::new(raw) else {
        budget.release();
        return Err(RegistryError::OutOfMemory);
    };

    // SAFETY: freshly allocated with Node's layout and not yet shared
    unsafe {
        node.as_ptr().write(Node {
            record,
            next: AtomicPtr::new(ptr::null_mut()),
            link: AtomicPtr::new(ptr::null_mut()),
            unlinked: AtomicBool::new(false),
        });
    }
    Ok(node)
}

/// Free a node produced by [`alloc_node`]
///
/// # Safety
///
/// Nobody else may reference the node, now or later.
unsafe fn free_node(node: NonNull<Node>, budget: &Budget) {
    // Allocated through the global allocator with Node's layout, as Box does
    drop(Box::from_raw(node.as_ptr()));
    budget.release();
}

fn link_ptr(link: &Link) -> *mut Link {
    link as *const Link as *mut Link
}

/// A record node built but not yet published
///
/// Dropping it frees the node immediately.
pub(crate) struct PendingRecord<'r> {
    node: NonNull<Node>,
    budget: &'r Budget,
}

// SAFETY: the node is owned exclusively and Record is Send + Sync
unsafe impl Send for PendingRecord<'_> {}

impl PendingRecord<'_> {
    fn into_raw(self) -> NonNull<Node> {
        let node = self.node;
        std::mem::forget(self);
        node
    }
}

impl Drop for PendingRecord<'_> {
    fn drop(&mut self) {
        // SAFETY: never published, so nothing else can see it
        unsafe { free_node(self.node, self.budget) }
    }
}

/// A record node unlinked from the registry but not yet freed
///
/// Readers that began before the unlink may still hold it. Dropping it frees
/// the node, so it must only be dropped by the reclamation scheduler.
pub(crate) struct Retired {
    node: NonNull<Node>,
    budget: Arc<Budget>,
}

// SAFETY: readers only ever take shared references to the record, which is
// Send + Sync; the free happens once, wherever the value is dropped
unsafe impl Send for Retired {}

impl Retired {
    pub(crate) fn record(&self) -> &Record {
        // SAFETY: the node stays allocated until this value is dropped
        unsafe { &self.node.as_ref().record }
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        // SAFETY: unlinked, and the scheduler only drops it after the grace period
        unsafe { free_node(self.node, &self.budget) }
    }
}

/// A record located under a reader session
///
/// Valid for as long as the session it was found under. Writers pass it back
/// to [`Registry::replace`] to publish a successor without searching again.
#[derive(Clone, Copy)]
pub(crate) struct Entry<'g> {
    registry: &'g Registry,
    node: NonNull<Node>,
}

impl<'g> Entry<'g> {
    pub(crate) fn record(&self) -> &'g Record {
        // SAFETY: the session borrowed for 'g keeps the node allocated
        unsafe { &(*self.node.as_ptr()).record }
    }
}

/// Ordered collection of records with lock-free reads
///
/// Reads require a [`ReaderSession`] from the scheduler this registry was
/// created with; the references they return live as long as the session.
pub struct Registry {
    // Boxed so the tail and back links can point at it across moves
    head: Box<Link>,
    tail: AtomicPtr<Link>,
    budget: Arc<Budget>,
    domain: u64,
}

impl Registry {
    /// Create an empty registry whose reads are guarded by sessions of `domain`
    pub(crate) fn new(domain: u64, max_allocated_records: usize) -> Self {
        let head = Box::new(AtomicPtr::new(ptr::null_mut()));
        let tail = AtomicPtr::new(link_ptr(&head));

        Self {
            head,
            tail,
            budget: Arc::new(Budget::new(max_allocated_records)),
            domain,
        }
    }

    /// Iterate over reachable records in registry order
    ///
    /// # Panics
    ///
    /// Panics if `session` belongs to a different scheduler.
    pub fn iter<'g>(&'g self, session: &'g ReaderSession<'_>) -> Iter<'g> {
        assert_eq!(
            session.domain(),
            self.domain,
            "reader session belongs to a different scheduler"
        );

        Iter {
            next: self.head.load(Ordering::Acquire),
            _session: PhantomData,
        }
    }

    /// Find the record with `id`
    pub fn find<'g>(&'g self, id: RecordId, session: &'g ReaderSession<'_>) -> Option<&'g Record> {
        self.iter(session).find(|record| record.id == id)
    }

    /// Number of reachable records
    pub fn len(&self, session: &ReaderSession<'_>) -> usize {
        self.iter(session).count()
    }

    /// Check if no record is reachable
    pub fn is_empty(&self, session: &ReaderSession<'_>) -> bool {
        self.iter(session).next().is_none()
    }

    /// Record nodes currently in memory, including retired ones not yet freed
    pub fn allocated(&self) -> usize {
        self.budget.allocated()
    }

    /// Locate the record with `id` for a later [`replace`](Self::replace)
    pub(crate) fn entry<'g>(
        &'g self,
        id: RecordId,
        session: &'g ReaderSession<'_>,
    ) -> Option<Entry<'g>> {
        let mut iter = self.iter(session);
        while let Some(node) = iter.next_node() {
            // SAFETY: reachable during the session
            if unsafe { node.as_ref() }.record.id == id {
                return Some(Entry {
                    registry: self,
                    node,
                });
            }
        }
        None
    }

    /// Allocate an unpublished node for `record`
    pub(crate) fn prepare(&self, record: Record) -> Result<PendingRecord<'_>, RegistryError> {
        let node = alloc_node(record, &self.budget)?;
        Ok(PendingRecord {
            node,
            budget: &self.budget,
        })
    }

    /// Append a record at the tail
    pub(crate) fn insert(&self, new: PendingRecord<'_>, _writer: &WriterGuard<'_>) {
        let new = new.into_raw();
        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: tail is the head or the next link of the last reachable node,
        // and new is ours until published
        unsafe {
            let new = new.as_ref();
            new.link.store(tail, Ordering::Relaxed);
            self.tail.store(link_ptr(&new.next), Ordering::Relaxed);
        }
        // SAFETY: see above
        unsafe { &*tail }.store(new.as_ptr(), Ordering::Release);
    }

    /// Publish `new` in the position of `old` and unlink `old`
    ///
    /// If another writer already superseded or removed `old`, nothing is
    /// published and `NotFound` is returned.
    ///
    /// # Panics
    ///
    /// Panics if `old` was located in a different registry.
    pub(crate) fn replace(
        &self,
        old: Entry<'_>,
        new: PendingRecord<'_>,
        _writer: &WriterGuard<'_>,
    ) -> Result<Retired, RegistryError> {
        assert!(
            ptr::eq(old.registry, self),
            "entry belongs to a different registry"
        );

        // SAFETY: the entry's session keeps old allocated
        let old_node = unsafe { old.node.as_ref() };
        if old_node.unlinked.load(Ordering::Relaxed) {
            return Err(RegistryError::NotFound(old_node.record.id));
        }

        let new = new.into_raw();
        let link = old_node.link.load(Ordering::Relaxed);
        let next = old_node.next.load(Ordering::Relaxed);

        // SAFETY: new is ours until published; link and next are kept current
        // for every reachable node under the writer lock
        unsafe {
            let new_node = new.as_ref();
            new_node.next.store(next, Ordering::Relaxed);
            new_node.link.store(link, Ordering::Relaxed);
            (*link).store(new.as_ptr(), Ordering::Release);
            self.relink_after(next, &new_node.next);
        }
        old_node.unlinked.store(true, Ordering::Relaxed);

        Ok(self.retired(old.node))
    }

    /// Unlink the record with `id`
    pub(crate) fn remove(
        &self,
        id: RecordId,
        _writer: &WriterGuard<'_>,
    ) -> Result<Retired, RegistryError> {
        let node = self
            .locked_find(|node| node.record.id == id)
            .ok_or(RegistryError::NotFound(id))?;

        // SAFETY: node is reachable, so it is still allocated, and its link and
        // next are current under the writer lock
        unsafe {
            let node_ref = node.as_ref();
            let link = node_ref.link.load(Ordering::Relaxed);
            let next = node_ref.next.load(Ordering::Relaxed);
            (*link).store(next, Ordering::Release);
            self.relink_after(next, &*link);
            node_ref.unlinked.store(true, Ordering::Relaxed);
        }

        Ok(self.retired(node))
    }

    /// Point the back link of `next`, or the tail if there is none, at `link`
    ///
    /// # Safety
    ///
    /// Must hold the writer lock; `next` must be null or reachable.
    unsafe fn relink_after(&self, next: *mut Node, link: &Link) {
        match NonNull::new(next) {
            Some(next) => next.as_ref().link.store(link_ptr(link), Ordering::Relaxed),
            None => self.tail.store(link_ptr(link), Ordering::Relaxed),
        }
    }

    fn retired(&self, node: NonNull<Node>) -> Retired {
        Retired {
            node,
            budget: Arc::clone(&self.budget),
        }
    }

    /// First reachable node matching `pred`; only called under the writer lock
    fn locked_find(&self, pred: impl Fn(&Node) -> bool) -> Option<NonNull<Node>> {
        let mut next = self.head.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(next) {
            // SAFETY: reachable nodes cannot be retired while the writer lock is held
            let node_ref = unsafe { node.as_ref() };
            if pred(node_ref) {
                return Some(node);
            }
            next = node_ref.next.load(Ordering::Acquire);
        }
        None
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut next = *self.head.get_mut();
        while let Some(node) = NonNull::new(next) {
            // SAFETY: exclusive access; no session can still reference the registry
            unsafe {
                next = (*node.as_ptr()).next.load(Ordering::Relaxed);
                free_node(node, &self.budget);
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("allocated", &self.allocated())
            .field("domain", &self.domain)
            .finish()
    }
}

/// Iterator over reachable records, valid for the session it was created with
pub struct Iter<'g> {
    next: *const Node,
    _session: PhantomData<&'g Record>,
}

impl Iter<'_> {
    fn next_node(&mut self) -> Option<NonNull<Node>> {
        let node = NonNull::new(self.next as *mut Node)?;
        // SAFETY: a node reachable during the session is not freed before it ends
        self.next = unsafe { node.as_ref() }.next.load(Ordering::Acquire);
        Some(node)
    }
}

impl<'g> Iterator for Iter<'g> {
    type Item = &'g Record;

    fn next(&mut self) -> Option<&'g Record> {
        let node = self.next_node()?;
        // SAFETY: see next_node
        Some(unsafe { &(*node.as_ptr()).record })
    }
}
