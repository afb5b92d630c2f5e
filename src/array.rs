//! Sparse object table: object number -> object, with lazily allocated pages.
//!
//! Not synchronized; the CQ and QP tables wrap it in their own lock.
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::hw::PAGE_SIZE;

/// Entries per backing page, one pointer-sized slot each.
const ENTRIES_PER_PAGE: usize = PAGE_SIZE / std::mem::size_of::<usize>();

struct ArrayPage<T> {
    page: Option<Box<[Option<T>]>>,
    used: usize,
}

pub struct SparseArray<T> {
    pages: Vec<ArrayPage<T>>,
    nent: usize,
}

impl<T> SparseArray<T> {
    pub fn new(nent: usize) -> Self {
        let npage = (nent + ENTRIES_PER_PAGE - 1) / ENTRIES_PER_PAGE;
        SparseArray {
            pages: (0..npage).map(|_| ArrayPage { page: None, used: 0 }).collect(),
            nent,
        }
    }

    #[inline]
    fn locate(index: usize) -> (usize, usize) {
        (index / ENTRIES_PER_PAGE, index % ENTRIES_PER_PAGE)
    }

    /// `index` must already be masked into `0..nent`.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.nent {
            return None;
        }
        let (p, off) = Self::locate(index);
        self.pages[p].page.as_ref().and_then(|page| page[off].as_ref())
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        if index >= self.nent {
            return Err(Error::InvalidAttribute("object table index out of range"));
        }
        let (p, off) = Self::locate(index);
        let entry = &mut self.pages[p];
        if entry.page.is_none() {
            let mut slots = Vec::new();
            slots
                .try_reserve_exact(ENTRIES_PER_PAGE)
                .map_err(|_| Error::OutOfMemory)?;
            slots.resize_with(ENTRIES_PER_PAGE, || None);
            entry.page = Some(slots.into_boxed_slice());
        }
        let page = entry.page.as_mut().ok_or(Error::OutOfMemory)?;
        if page[off].replace(value).is_none() {
            entry.used += 1;
        }
        Ok(())
    }

    /// Removes and returns the entry; frees the page when it empties.
    pub fn clear(&mut self, index: usize) -> Option<T> {
        if index >= self.nent {
            return None;
        }
        let (p, off) = Self::locate(index);
        let entry = &mut self.pages[p];
        let old = entry.page.as_mut()?[off].take();
        if old.is_some() {
            entry.used -= 1;
            if entry.used == 0 {
                entry.page = None;
            }
        }
        old
    }

    #[cfg(test)]
    fn pages_allocated(&self) -> usize {
        self.pages.iter().filter(|p| p.page.is_some()).count()
    }
}

/// How long destroy waits for handlers on other threads to let go.
pub(crate) const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Counts event handlers currently using an object found through a table.
/// Destroy clears the table entry first, then waits for the count to drain.
pub(crate) struct RefCount {
    /// One entry per live `Held`, naming the thread that took it.
    holders: Mutex<Vec<ThreadId>>,
    idle: Condvar,
}

impl RefCount {
    pub(crate) fn new() -> Self {
        RefCount {
            holders: Mutex::new(Vec::new()),
            idle: Condvar::new(),
        }
    }

    fn inc(&self, holder: ThreadId) {
        self.holders.lock().push(holder);
    }

    fn dec(&self, holder: ThreadId) {
        let mut holders = self.holders.lock();
        if let Some(i) = holders.iter().position(|t| *t == holder) {
            holders.swap_remove(i);
        }
        self.idle.notify_all();
    }

    /// Waits until no other thread holds the object. A hold of the calling
    /// thread is a handler tearing down its own object and is not waited
    /// for. Returns false if other holders remain after `timeout`.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut holders = self.holders.lock();
        while holders.iter().any(|t| *t != me) {
            if self.idle.wait_until(&mut holders, deadline).timed_out() {
                return holders.iter().all(|t| *t == me);
            }
        }
        true
    }
}

pub(crate) trait Refcounted {
    fn refs(&self) -> &RefCount;
}

/// A counted reference taken under the owning table's lock.
pub(crate) struct Held<T: Refcounted> {
    obj: Arc<T>,
    holder: ThreadId,
}

impl<T: Refcounted> Held<T> {
    /// Must be called with the table lock held.
    pub(crate) fn new(obj: Arc<T>) -> Self {
        let holder = thread::current().id();
        obj.refs().inc(holder);
        Held { obj, holder }
    }
}

impl<T: Refcounted> Deref for Held<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: Refcounted> Drop for Held<T> {
    fn drop(&mut self) {
        self.obj.refs().dec(self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_has_nothing() {
        let a: SparseArray<u32> = SparseArray::new(4096);
        for i in (0..4096).step_by(97) {
            assert!(a.get(i).is_none());
        }
        assert!(a.get(1 << 20).is_none());
        assert_eq!(a.pages_allocated(), 0);
    }

    #[test]
    fn set_get_clear() {
        let mut a = SparseArray::new(2048);
        a.set(700, "cq").unwrap();
        assert_eq!(a.get(700), Some(&"cq"));
        assert_eq!(a.pages_allocated(), 1);
        assert_eq!(a.clear(700), Some("cq"));
        assert!(a.get(700).is_none());
        assert_eq!(a.pages_allocated(), 0);
    }

    #[test]
    fn neighbours_on_one_page_are_independent() {
        let mut a = SparseArray::new(1024);
        a.set(1, 10).unwrap();
        a.set(2, 20).unwrap();
        a.set(3, 30).unwrap();
        a.clear(2);
        assert_eq!(a.get(1), Some(&10));
        assert!(a.get(2).is_none());
        assert_eq!(a.get(3), Some(&30));
        a.set(2, 21).unwrap();
        a.clear(1);
        a.clear(3);
        assert_eq!(a.get(2), Some(&21));
        assert_eq!(a.pages_allocated(), 1);
        a.clear(2);
        assert_eq!(a.pages_allocated(), 0);
    }

    #[test]
    fn overwrite_and_stray_clear_keep_count() {
        let mut a = SparseArray::new(16);
        a.set(5, 1).unwrap();
        a.set(5, 2).unwrap();
        assert_eq!(a.clear(6), None);
        assert_eq!(a.clear(5), Some(2));
        assert_eq!(a.pages_allocated(), 0);
    }

    struct Obj(RefCount);

    impl Refcounted for Obj {
        fn refs(&self) -> &RefCount {
            &self.0
        }
    }

    #[test]
    fn wait_idle_blocks_until_guards_drop() {
        let obj = Arc::new(Obj(RefCount::new()));
        let held = Held::new(Arc::clone(&obj));
        let waiter = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || obj.0.wait_idle(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn own_hold_is_not_waited_for() {
        let obj = Arc::new(Obj(RefCount::new()));
        let _held = Held::new(Arc::clone(&obj));
        assert!(obj.0.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn stuck_holder_times_out() {
        let obj = Arc::new(Obj(RefCount::new()));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let obj = Arc::clone(&obj);
            std::thread::spawn(move || {
                let _held = Held::new(obj);
                let _ = rx.recv();
            })
        };
        while obj.0.holders.lock().is_empty() {
            std::thread::yield_now();
        }
        assert!(!obj.0.wait_idle(Duration::from_millis(20)));
        drop(tx);
        holder.join().unwrap();
        assert!(obj.0.wait_idle(Duration::from_millis(20)));
    }
}
