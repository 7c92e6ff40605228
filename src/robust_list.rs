#![cfg(target_os = "linux")]

//! Per-unit robust list: the lock sites a unit currently holds, laid out the way
//! the kernel walks them when the unit exits.
//!
//! The list is circular through the head's own link; an empty registry points back
//! at itself. A registry that has never been touched holds a null link, which is
//! treated the same way.

use std::{
    fmt,
    marker::PhantomPinned,
    mem::{offset_of, size_of},
    pin::Pin,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use static_assertions::const_assert_eq;

use crate::{
    error::FutexError,
    futex::sys,
    word::{self, FutexWord},
};

/// Upper bound on entries followed in one walk. Same bound the kernel uses.
pub const ROBUST_LIST_LIMIT: usize = 2048;

/// Kernel ABI for the single "link" node that every lock site contributes.
/// SAFETY: Layout must match <linux/futex.h>.
#[repr(C)]
#[derive(Debug)]
pub struct RobustLink {
    next: AtomicPtr<RobustLink>,
}

impl RobustLink {
    const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Kernel ABI for the per‑thread head –– the kernel expects this exact layout.
#[repr(C)]
#[derive(Debug)]
pub struct RobustListHead {
    list: RobustLink,
    /// offset between a site's link and its futex word
    futex_offset: isize,
    list_op_pending: AtomicPtr<RobustLink>,
}

const_assert_eq!(size_of::<RobustListHead>(), 3 * size_of::<usize>());

/// The record a held lock contributes to its owner's robust list.
#[repr(C)]
#[derive(Debug, Default)]
pub struct LockSite {
    link: RobustLink,
    word: FutexWord,
}

const_assert_eq!(offset_of!(LockSite, link), 0);

impl Default for RobustLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LockSite {
    const WORD_OFFSET: isize =
        offset_of!(LockSite, word) as isize - offset_of!(LockSite, link) as isize;

    pub const fn new() -> Self {
        Self {
            link: RobustLink::new(),
            word: FutexWord::new(),
        }
    }

    #[inline]
    pub fn word(&self) -> &FutexWord {
        &self.word
    }

    #[inline]
    fn link_ptr(&self) -> *mut RobustLink {
        &self.link as *const _ as *mut RobustLink
    }

    /// # Safety
    ///
    /// `link` must point at the link of a live `LockSite`.
    #[inline]
    unsafe fn from_link<'a>(link: *mut RobustLink) -> &'a LockSite {
        // link is the first field of a repr(C) LockSite
        unsafe { &*(link as *const LockSite) }
    }
}

/// One execution unit's robust list.
///
/// Pinned because the kernel and the list's own terminator refer to the head by
/// address. Use [`with_current`] for the calling thread's registry; standalone
/// registries (`Box::pin(RobustRegistry::new())`) are for explicit-id units.
pub struct RobustRegistry {
    head: RobustListHead,
    _pin: PhantomPinned,
}

impl Default for RobustRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RobustRegistry {
    pub const fn new() -> Self {
        Self {
            head: RobustListHead {
                list: RobustLink::new(),
                futex_offset: LockSite::WORD_OFFSET,
                list_op_pending: AtomicPtr::new(ptr::null_mut()),
            },
            _pin: PhantomPinned,
        }
    }

    #[inline]
    fn sentinel(&self) -> *mut RobustLink {
        &self.head.list as *const _ as *mut RobustLink
    }

    #[inline]
    fn first(&self) -> *mut RobustLink {
        let p = self.head.list.next.load(Ordering::Acquire);
        if p.is_null() { self.sentinel() } else { p }
    }

    #[inline]
    fn is_end(&self, p: *mut RobustLink) -> bool {
        p.is_null() || p == self.sentinel()
    }

    pub fn address(self: Pin<&Self>) -> usize {
        &self.head as *const RobustListHead as usize
    }

    /// Hands this registry to the kernel as the calling thread's robust list.
    ///
    /// # Safety
    ///
    /// The registry must stay alive until the calling thread exits or publishes
    /// another registry.
    pub unsafe fn publish(self: Pin<&Self>) -> Result<(), FutexError> {
        let _ = self.head.list.next.compare_exchange(
            ptr::null_mut(),
            self.sentinel(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        unsafe { sys::set_robust_list(&self.head) }?;
        log::debug!(
            "published robust list {:#x} (futex_offset {})",
            self.address(),
            self.head.futex_offset
        );
        Ok(())
    }

    /// `(head address, head length)` the kernel holds for thread `tid` (0 = calling thread).
    pub fn query(tid: u32) -> Result<(usize, usize), FutexError> {
        sys::get_robust_list(tid as libc::pid_t)
    }

    pub(crate) fn set_pending(self: Pin<&Self>, site: &LockSite) {
        self.head
            .list_op_pending
            .store(site.link_ptr(), Ordering::Release);
    }

    pub(crate) fn clear_pending(self: Pin<&Self>) {
        self.head
            .list_op_pending
            .store(ptr::null_mut(), Ordering::Release);
    }

    /// Prepends `site`. Caller has already published it in the pending slot.
    pub(crate) fn link(self: Pin<&Self>, site: &LockSite) {
        site.link.next.store(self.first(), Ordering::Release);
        self.head.list.next.store(site.link_ptr(), Ordering::Release);
    }

    /// Removes `site` if present. O(n), the list is tiny.
    pub(crate) fn unlink(self: Pin<&Self>, site: &LockSite) -> bool {
        let target = site.link_ptr();
        let mut prev: &RobustLink = &self.head.list;
        let mut cur = self.first();
        let mut seen = 0;
        while !self.is_end(cur) && seen < ROBUST_LIST_LIMIT {
            let node = unsafe { LockSite::from_link(cur) };
            let next = node.link.next.load(Ordering::Acquire);
            if cur == target {
                prev.next.store(next, Ordering::Release);
                return true;
            }
            prev = &node.link;
            cur = next;
            seen += 1;
        }
        false
    }

    /// Pushes `site` at the front: pending, link, publish as head, clear pending.
    ///
    /// # Safety
    ///
    /// `site` must stay alive and in place until it is unregistered, and must not
    /// be linked into any other registry.
    pub unsafe fn register_site(self: Pin<&Self>, site: &LockSite) {
        self.set_pending(site);
        self.link(site);
        self.clear_pending();
    }

    /// Inverse of [`register_site`](Self::register_site). Returns whether `site` was linked.
    ///
    /// # Safety
    ///
    /// Same contract as `register_site` for every site currently linked.
    pub unsafe fn unregister_site(self: Pin<&Self>, site: &LockSite) -> bool {
        self.set_pending(site);
        let found = self.unlink(site);
        self.clear_pending();
        found
    }

    /// Held sites, most recently acquired first. Restart by calling again or cloning.
    pub fn walk(self: Pin<&Self>) -> Walk<'_> {
        let registry = self.get_ref();
        Walk {
            registry,
            next: registry.first(),
            seen: 0,
        }
    }

    pub fn pending(self: Pin<&Self>) -> Option<SiteEntry<'_>> {
        let p = self.head.list_op_pending.load(Ordering::Acquire);
        (!p.is_null()).then(|| SiteEntry {
            site: unsafe { LockSite::from_link(p) },
        })
    }

    pub fn is_empty(self: Pin<&Self>) -> bool {
        self.is_end(self.first())
    }

    /// Repairs what a dead unit left behind, the way the kernel does at thread exit.
    ///
    /// Every word reachable from the list or the pending slot that `dead_id` still
    /// owns becomes `FUTEX_OWNER_DIED` (waiter flag kept) and one waiter is woken
    /// if there were any. The registry is empty afterwards. Returns the number of
    /// repaired words.
    ///
    /// # Safety
    ///
    /// The unit owning this registry must be gone: never call this on a live
    /// thread's registry, published or not. It must also run before any of the
    /// dead unit's locks is taken by someone else, and every linked site must
    /// still be alive.
    pub unsafe fn recover(self: Pin<&Self>, dead_id: u32) -> Result<usize, FutexError> {
        let pending = self.head.list_op_pending.load(Ordering::Acquire);
        let mut repaired = 0;

        for entry in self.walk() {
            if entry.site.link_ptr() == pending {
                continue;
            }
            repaired += repair(entry.site, dead_id)? as usize;
        }
        if !pending.is_null() {
            let site = unsafe { LockSite::from_link(pending) };
            repaired += repair(site, dead_id)? as usize;
        }

        self.head.list.next.store(self.sentinel(), Ordering::Release);
        self.clear_pending();
        Ok(repaired)
    }
}

fn repair(site: &LockSite, dead_id: u32) -> Result<bool, FutexError> {
    let Some(prev) = site.word().mark_owner_died(dead_id) else {
        return Ok(false);
    };
    log::warn!(
        "owner {} died holding futex {:p} ({prev:#x})",
        word::owner_of(prev),
        site.word()
    );
    if word::has_waiters(prev) {
        sys::wake(site.word(), 1)?;
    }
    Ok(true)
}

impl fmt::Debug for RobustRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustRegistry")
            .field("head", &self.head)
            .finish()
    }
}

/// Lazy walk over a registry. Bounded by [`ROBUST_LIST_LIMIT`].
#[derive(Clone)]
pub struct Walk<'a> {
    registry: &'a RobustRegistry,
    next: *mut RobustLink,
    seen: usize,
}

impl<'a> Iterator for Walk<'a> {
    type Item = SiteEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.registry.is_end(self.next) || self.seen >= ROBUST_LIST_LIMIT {
            return None;
        }
        let site = unsafe { LockSite::from_link(self.next) };
        self.next = site.link.next.load(Ordering::Acquire);
        self.seen += 1;
        Some(SiteEntry { site })
    }
}

#[derive(Clone, Copy)]
pub struct SiteEntry<'a> {
    site: &'a LockSite,
}

impl<'a> SiteEntry<'a> {
    pub fn site(&self) -> &'a LockSite {
        self.site
    }

    pub fn site_addr(&self) -> usize {
        self.site as *const LockSite as usize
    }

    pub fn word_addr(&self) -> usize {
        self.site.word() as *const FutexWord as usize
    }

    pub fn value(&self) -> u32 {
        self.site.word().load()
    }
}

impl fmt::Debug for SiteEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}(futex: {:#x}, futex_val: {:#x})",
            self.site_addr(),
            self.word_addr(),
            self.value()
        )
    }
}

thread_local! {
    static CURRENT: RobustRegistry = const { RobustRegistry::new() };
}

/// Runs `f` with the calling thread's registry.
pub fn with_current<R>(f: impl FnOnce(Pin<&RobustRegistry>) -> R) -> R {
    // a thread-local never moves while its thread runs
    CURRENT.with(|reg| f(unsafe { Pin::new_unchecked(reg) }))
}

pub(crate) fn publish_current() -> Result<(), FutexError> {
    // the thread-local outlives every point at which the kernel reads it
    with_current(|reg| unsafe { reg.publish() })
}
