// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The window cache: files, windows, contexts and the LRU recycling pool.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::geometry::{self, Limits, Span};
use crate::mmap::{self, Prot};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./cache_test.rs"]
mod cache_test;

/// Number of context slots available to callers of [`MmapCache::get`].
///
/// A context is a stable cursor: repeated reads through the same slot in
/// the same neighborhood are answered by the window the slot already
/// points at, without any list walking. Callers with distinct access
/// patterns (say, one per object type in a journal file) should use
/// distinct slots.
pub const MAX_CONTEXTS: usize = 8;

// window attachments are tracked as a per-window bitmask of context slots
const_assert!(MAX_CONTEXTS <= u16::BITS as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId(u32);

/// Handle to a file registered with [`MmapCache::add_fd`].
///
/// Handles are small copyable tokens. Using one after
/// [`MmapCache::remove_fd`] panics instead of silently touching whatever
/// file was registered into the reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdHandle {
    index: u32,
    generation: u32,
}

/// Counters describing how read requests were served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Requests answered by the window already bound to the context slot.
    pub context_cache_hits: u64,
    /// Requests answered by scanning the file's window list.
    pub window_list_hits: u64,
    /// Requests that had to map a new window.
    pub misses: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Links {
    prev: Option<WindowId>,
    next: Option<WindowId>,
}

/// One contiguous mapping into one file.
struct Window {
    file: FileId,
    ptr: NonNull<u8>,
    offset: u64,
    size: usize,

    /// Remapped to anonymous pages after a bus fault.
    invalidated: bool,
    /// Pinned; never parked on the unused list. Write-once-true.
    keep_always: bool,
    in_unused: bool,

    /// Bitmask of context slots currently bound to this window.
    contexts: u16,

    by_file: Links,
    by_unused: Links,
}

impl Window {
    fn covers(&self, offset: u64, size: u64) -> bool {
        offset >= self.offset && offset + size <= self.offset + self.size as u64
    }

    /// Pointer to the bytes that sit at `offset` of the underlying file.
    fn project(&self, offset: u64) -> NonNull<u8> {
        debug_assert!(self.covers(offset, 1));
        // SAFETY: only covered offsets are projected, so the result stays
        // inside the window's mapping
        unsafe { self.ptr.add((offset - self.offset) as usize) }
    }
}

struct MmapFile {
    fd: RawFd,
    prot: Prot,
    /// A bus fault was attributed to one of this file's windows.
    sigbus: bool,
    /// Head of the window list, most recently created first.
    windows: Option<WindowId>,
}

struct FileSlot {
    generation: u32,
    entry: Option<MmapFile>,
}

/// A bounded pool of memory-mapped windows over a set of registered file
/// descriptors.
///
/// The cache is single-threaded by design: callers that share one wrap it
/// in their own synchronization. Dropping the cache unmaps every window
/// it created.
pub struct MmapCache {
    limits: Limits,
    n_windows: usize,
    stats: Stats,

    fds: HashMap<RawFd, FileId>,
    files: Vec<FileSlot>,
    free_files: Vec<u32>,

    windows: Vec<Option<Window>>,
    free_windows: Vec<u32>,

    /// The window each context slot last served, if any.
    contexts: [Option<WindowId>; MAX_CONTEXTS],

    /// Unused, unpinned windows. The head is the most recently released
    /// window, the tail is the next recycling victim.
    unused_head: Option<WindowId>,
    unused_tail: Option<WindowId>,
}

impl Default for MmapCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapCache {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    /// A cache with explicit sizing, mostly useful to force the recycling
    /// paths under test.
    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits: limits.normalized(),
            n_windows: 0,
            stats: Stats::default(),
            fds: HashMap::new(),
            files: Vec::new(),
            free_files: Vec::new(),
            windows: Vec::new(),
            free_windows: Vec::new(),
            contexts: [None; MAX_CONTEXTS],
            unused_head: None,
            unused_tail: None,
        }
    }

    /// Register `fd` for reading through this cache.
    ///
    /// Registering a descriptor that is already known returns the existing
    /// handle and leaves its protection unchanged. The cache never closes
    /// `fd`; it must stay open until the handle is removed.
    pub fn add_fd(&mut self, fd: RawFd, prot: Prot) -> FdHandle {
        assert!(fd >= 0, "file descriptor must be non-negative");
        if let Some(&FileId(index)) = self.fds.get(&fd) {
            return FdHandle {
                index,
                generation: self.files[index as usize].generation,
            };
        }

        let entry = MmapFile {
            fd,
            prot,
            sigbus: false,
            windows: None,
        };
        let index = match self.free_files.pop() {
            Some(index) => {
                self.files[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.files.push(FileSlot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.files.len() - 1) as u32
            }
        };
        self.fds.insert(fd, FileId(index));
        FdHandle {
            index,
            generation: self.files[index as usize].generation,
        }
    }

    /// Drop `handle` and every window mapped on its behalf.
    ///
    /// Queued bus faults are dispatched first: a queued fault address may
    /// lie inside one of this file's windows, and once those are unmapped
    /// it could no longer be attributed.
    pub fn remove_fd(&mut self, handle: FdHandle) {
        self.process_sigbus();
        let file = self.resolve(handle);
        while let Some(wid) = self.file(file).windows {
            self.window_free(wid);
        }
        let slot = &mut self.files[file.0 as usize];
        let entry = slot.entry.take().expect("resolved file entry is live");
        slot.generation = slot.generation.wrapping_add(1);
        self.fds.remove(&entry.fd);
        self.free_files.push(file.0);
    }

    /// Resolve `size` bytes at `offset` of the file behind `handle` to a
    /// pointer into a shared mapping of that file.
    ///
    /// `context` names one of [`MAX_CONTEXTS`] cursor slots. `keep_always`
    /// pins the serving window: it will never be recycled while the file
    /// stays registered. `file_size`, when provided, is trusted as the
    /// current size of the file and bounds both the request and the
    /// mapping.
    ///
    /// The returned pointer is valid for `size` bytes and stays valid
    /// until the serving window is recycled (never, while pinned), the
    /// file is removed, or the cache is dropped. After a bus fault on the
    /// file the backing pages are replaced with zeroed anonymous memory,
    /// so stale pointers read zeroes rather than faulting.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero, `context` is out of range, or `handle`
    /// is stale.
    pub fn get(
        &mut self,
        handle: FdHandle,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: u64,
        file_size: Option<u64>,
    ) -> Result<NonNull<u8>> {
        assert!(context < MAX_CONTEXTS, "context id out of range");
        assert!(size > 0, "cannot request an empty range");
        let file = self.resolve(handle);

        if let Some(file_size) = file_size {
            if offset >= file_size {
                return Err(Error::OffsetPastEndOfFile { offset, file_size });
            }
        }

        if let Some(ptr) = self.try_context(file, context, keep_always, offset, size)? {
            return Ok(ptr);
        }
        if let Some(ptr) = self.find_window(file, context, keep_always, offset, size)? {
            return Ok(ptr);
        }
        self.stats.misses += 1;
        self.add_window(file, context, keep_always, offset, size, file_size)
    }

    /// Dispatch any queued bus faults, then report whether this file has
    /// been poisoned by one.
    pub fn got_sigbus(&mut self, handle: FdHandle) -> bool {
        self.process_sigbus();
        let file = self.resolve(handle);
        self.file(file).sigbus
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Emit the hit/miss counters to the debug log.
    pub fn log_stats(&self) {
        tracing::debug!(
            context_cache_hits = self.stats.context_cache_hits,
            window_list_hits = self.stats.window_list_hits,
            misses = self.stats.misses,
            "mmap cache statistics",
        );
    }

    // ------------------------------------------------------------------
    // read paths

    /// Fast path: the window already bound to the context slot.
    fn try_context(
        &mut self,
        file: FileId,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: u64,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(wid) = self.contexts[context] else {
            return Ok(None);
        };

        let window = self.win(wid);
        if window.file != file || !window.covers(offset, size) {
            // the slot moved on; release the window before the wider lookup
            self.context_detach(context);
            return Ok(None);
        }

        if self.file(file).sigbus {
            return Err(Error::FileIsPoisoned);
        }

        let window = self.win_mut(wid);
        window.keep_always |= keep_always;
        let ptr = window.project(offset);
        self.stats.context_cache_hits += 1;
        Ok(Some(ptr))
    }

    /// Middle path: scan the file's window list for a covering window and
    /// rebind the context to it.
    fn find_window(
        &mut self,
        file: FileId,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: u64,
    ) -> Result<Option<NonNull<u8>>> {
        if self.file(file).sigbus {
            return Err(Error::FileIsPoisoned);
        }

        let mut cursor = self.file(file).windows;
        let found = loop {
            let Some(wid) = cursor else { return Ok(None) };
            let window = self.win(wid);
            if window.covers(offset, size) {
                break wid;
            }
            cursor = window.by_file.next;
        };

        self.context_attach(context, found);
        let window = self.win_mut(found);
        window.keep_always |= keep_always;
        let ptr = window.project(offset);
        self.stats.window_list_hits += 1;
        Ok(Some(ptr))
    }

    /// Slow path: map a fresh window for the request.
    fn add_window(
        &mut self,
        file: FileId,
        context: usize,
        keep_always: bool,
        offset: u64,
        size: u64,
        file_size: Option<u64>,
    ) -> Result<NonNull<u8>> {
        let span = geometry::window_span(
            offset,
            size,
            self.limits.window_size,
            file_size,
            mmap::page_size() as u64,
        )?;
        let ptr = self.map_retrying(file, span)?;
        let wid = self.window_create(file, keep_always, span, ptr);
        self.context_attach(context, wid);
        Ok(self.win(wid).project(offset))
    }

    /// Map the span, evicting one unused window and retrying whenever the
    /// kernel reports address space exhaustion.
    fn map_retrying(&mut self, file: FileId, span: Span) -> Result<NonNull<u8>> {
        let (fd, prot) = {
            let f = self.file(file);
            (f.fd, f.prot)
        };
        loop {
            match mmap::map_file(fd, prot, span.offset, span.size as usize) {
                Ok(ptr) => return Ok(ptr),
                Err(nix::errno::Errno::ENOMEM) => {
                    let Some(victim) = self.unused_tail else {
                        return Err(nix::errno::Errno::ENOMEM.into());
                    };
                    self.window_free(victim);
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    // ------------------------------------------------------------------
    // window pool

    /// Bring a new window into service. Once the pool is past its soft
    /// floor the coldest unused window is recycled in place instead of
    /// growing the pool.
    fn window_create(
        &mut self,
        file: FileId,
        keep_always: bool,
        span: Span,
        ptr: NonNull<u8>,
    ) -> WindowId {
        let window = Window {
            file,
            ptr,
            offset: span.offset,
            size: span.size as usize,
            invalidated: false,
            keep_always,
            in_unused: false,
            contexts: 0,
            by_file: Links::default(),
            by_unused: Links::default(),
        };

        let wid = match self.unused_tail {
            Some(victim) if self.n_windows > self.limits.windows_min => {
                self.window_unlink(victim);
                self.windows[victim.0 as usize] = Some(window);
                victim
            }
            _ => {
                self.n_windows += 1;
                match self.free_windows.pop() {
                    Some(index) => {
                        self.windows[index as usize] = Some(window);
                        WindowId(index)
                    }
                    None => {
                        self.windows.push(Some(window));
                        WindowId((self.windows.len() - 1) as u32)
                    }
                }
            }
        };
        self.file_list_prepend(file, wid);
        wid
    }

    /// Take a window out of service: unmap it and sever every reference
    /// to it. The slot itself stays allocated for the caller to reuse or
    /// release.
    fn window_unlink(&mut self, wid: WindowId) {
        let (ptr, size, file, in_unused, contexts) = {
            let w = self.win(wid);
            (w.ptr, w.size, w.file, w.in_unused, w.contexts)
        };

        // SAFETY: the cache created this mapping, and pointer validity is
        // documented to end when the window is recycled or freed
        unsafe { mmap::unmap(ptr, size) };

        self.file_list_remove(file, wid);
        if in_unused {
            self.unused_remove(wid);
        }
        for slot in 0..MAX_CONTEXTS {
            if contexts & (1 << slot) != 0 {
                debug_assert_eq!(self.contexts[slot], Some(wid));
                self.contexts[slot] = None;
            }
        }
    }

    fn window_free(&mut self, wid: WindowId) {
        self.window_unlink(wid);
        self.windows[wid.0 as usize] = None;
        self.free_windows.push(wid.0);
        self.n_windows -= 1;
    }

    /// Swap the window's pages for zero-filled anonymous ones, in place,
    /// so that no access through any outstanding pointer can fault again.
    fn window_invalidate(&mut self, wid: WindowId) {
        let (ptr, size, prot, invalidated) = {
            let w = self.win(wid);
            (w.ptr, w.size, self.file(w.file).prot, w.invalidated)
        };
        if invalidated {
            return;
        }
        // SAFETY: replacing a mapping this cache owns
        if let Err(errno) = unsafe { mmap::map_anonymous_fixed(ptr, size, prot) } {
            // the window still maps the poisoned file and would keep
            // faulting; there is no way to make the address range safe
            tracing::error!(%errno, "failed to remap poisoned window, aborting");
            std::process::abort();
        }
        self.win_mut(wid).invalidated = true;
    }

    // ------------------------------------------------------------------
    // context binding

    fn context_attach(&mut self, context: usize, wid: WindowId) {
        if self.contexts[context] == Some(wid) {
            return;
        }
        self.context_detach(context);

        if self.win(wid).in_unused {
            // used again
            self.unused_remove(wid);
        }
        self.win_mut(wid).contexts |= 1 << context;
        self.contexts[context] = Some(wid);
    }

    fn context_detach(&mut self, context: usize) {
        let Some(wid) = self.contexts[context].take() else {
            return;
        };
        let (attached, keep_always) = {
            let w = self.win_mut(wid);
            w.contexts &= !(1 << context);
            (w.contexts, w.keep_always)
        };
        if attached == 0 && !keep_always {
            if cfg!(feature = "debug-windows") {
                // unmap unused windows immediately to expose use-after-unmap
                self.window_free(wid);
            } else {
                self.unused_prepend(wid);
            }
        }
    }

    // ------------------------------------------------------------------
    // bus fault recovery

    /// Drain the process-wide fault queue, poisoning the owning file of
    /// every recorded address and replacing all of that file's windows
    /// with anonymous pages.
    ///
    /// A fault that cannot be attributed to any window is fatal: it means
    /// some other mapping in the process is broken, and swallowing it
    /// would turn a crash into silent corruption.
    fn process_sigbus(&mut self) {
        let mut found = false;
        loop {
            let addr = match journmap_sigbus::pop() {
                journmap_sigbus::Pop::Empty => break,
                journmap_sigbus::Pop::Overflow => {
                    tracing::error!("bus fault queue overflowed, fault addresses were lost");
                    std::process::abort();
                }
                journmap_sigbus::Pop::Fault(addr) => addr as usize,
            };

            match self.window_at(addr) {
                Some(wid) => {
                    let file = self.win(wid).file;
                    self.file_mut(file).sigbus = true;
                    found = true;
                }
                None => {
                    tracing::error!(addr, "bus fault in memory not mapped by this cache");
                    std::process::abort();
                }
            }
        }
        if !found {
            return;
        }

        for index in 0..self.files.len() {
            let mut cursor = match &self.files[index].entry {
                Some(entry) if entry.sigbus => entry.windows,
                _ => continue,
            };
            while let Some(wid) = cursor {
                cursor = self.win(wid).by_file.next;
                self.window_invalidate(wid);
            }
        }
    }

    /// The window whose mapping contains `addr`, if any.
    fn window_at(&self, addr: usize) -> Option<WindowId> {
        for slot in &self.files {
            let Some(entry) = &slot.entry else { continue };
            let mut cursor = entry.windows;
            while let Some(wid) = cursor {
                let w = self.win(wid);
                let base = w.ptr.as_ptr() as usize;
                if addr >= base && addr < base + w.size {
                    return Some(wid);
                }
                cursor = w.by_file.next;
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // intrusive list plumbing

    fn unused_prepend(&mut self, wid: WindowId) {
        debug_assert!(!self.win(wid).in_unused);
        let head = self.unused_head;
        {
            let w = self.win_mut(wid);
            w.by_unused = Links {
                prev: None,
                next: head,
            };
            w.in_unused = true;
        }
        if let Some(head) = head {
            self.win_mut(head).by_unused.prev = Some(wid);
        }
        self.unused_head = Some(wid);
        if self.unused_tail.is_none() {
            self.unused_tail = Some(wid);
        }
    }

    fn unused_remove(&mut self, wid: WindowId) {
        let Links { prev, next } = self.win(wid).by_unused;
        match prev {
            Some(prev) => self.win_mut(prev).by_unused.next = next,
            None => self.unused_head = next,
        }
        match next {
            Some(next) => self.win_mut(next).by_unused.prev = prev,
            None => self.unused_tail = prev,
        }
        let w = self.win_mut(wid);
        w.by_unused = Links::default();
        w.in_unused = false;
    }

    fn file_list_prepend(&mut self, file: FileId, wid: WindowId) {
        let head = self.file(file).windows;
        self.win_mut(wid).by_file = Links {
            prev: None,
            next: head,
        };
        if let Some(head) = head {
            self.win_mut(head).by_file.prev = Some(wid);
        }
        self.file_mut(file).windows = Some(wid);
    }

    fn file_list_remove(&mut self, file: FileId, wid: WindowId) {
        let Links { prev, next } = self.win(wid).by_file;
        match prev {
            Some(prev) => self.win_mut(prev).by_file.next = next,
            None => self.file_mut(file).windows = next,
        }
        if let Some(next) = next {
            self.win_mut(next).by_file.prev = prev;
        }
        self.win_mut(wid).by_file = Links::default();
    }

    // ------------------------------------------------------------------
    // slot access

    fn resolve(&self, handle: FdHandle) -> FileId {
        let slot = self
            .files
            .get(handle.index as usize)
            .unwrap_or_else(|| panic!("file handle {handle:?} does not belong to this cache"));
        assert!(
            slot.generation == handle.generation && slot.entry.is_some(),
            "file handle {handle:?} used after remove_fd"
        );
        FileId(handle.index)
    }

    fn file(&self, id: FileId) -> &MmapFile {
        self.files[id.0 as usize]
            .entry
            .as_ref()
            .expect("file id refers to a live entry")
    }

    fn file_mut(&mut self, id: FileId) -> &mut MmapFile {
        self.files[id.0 as usize]
            .entry
            .as_mut()
            .expect("file id refers to a live entry")
    }

    fn win(&self, id: WindowId) -> &Window {
        self.windows[id.0 as usize]
            .as_ref()
            .expect("window id refers to a live window")
    }

    fn win_mut(&mut self, id: WindowId) -> &mut Window {
        self.windows[id.0 as usize]
            .as_mut()
            .expect("window id refers to a live window")
    }
}

impl Drop for MmapCache {
    fn drop(&mut self) {
        for window in self.windows.iter().flatten() {
            // SAFETY: the cache owns these mappings, and no pointer into
            // them may outlive the cache
            unsafe { mmap::unmap(window.ptr, window.size) };
        }
    }
}

#[cfg(test)]
impl MmapCache {
    pub(crate) fn window_count(&self) -> usize {
        self.n_windows
    }

    /// Walk every structural invariant and panic on the first violation.
    pub(crate) fn check_consistency(&self) {
        let live: Vec<usize> = self
            .windows
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.as_ref().map(|_| i))
            .collect();
        assert_eq!(live.len(), self.n_windows, "window counter out of sync");

        // every live window is reachable through exactly one file list,
        // and carries a correct back-reference
        let mut reachable = 0;
        for (index, slot) in self.files.iter().enumerate() {
            let Some(entry) = &slot.entry else { continue };
            let mut prev = None;
            let mut cursor = entry.windows;
            while let Some(wid) = cursor {
                let w = self.win(wid);
                assert_eq!(w.file, FileId(index as u32), "window on wrong file list");
                assert_eq!(w.by_file.prev, prev, "file list back-link broken");
                prev = Some(wid);
                cursor = w.by_file.next;
                reachable += 1;
            }
        }
        assert_eq!(reachable, self.n_windows, "unreachable windows exist");

        // the unused list holds exactly the windows marked in_unused, all
        // of them unpinned and unreferenced, with an accurate tail
        let mut on_list = 0;
        let mut prev = None;
        let mut cursor = self.unused_head;
        while let Some(wid) = cursor {
            let w = self.win(wid);
            assert!(w.in_unused, "unused list member not marked in_unused");
            assert_eq!(w.contexts, 0, "unused window still referenced");
            assert!(!w.keep_always, "pinned window on the unused list");
            assert_eq!(w.by_unused.prev, prev, "unused list back-link broken");
            prev = Some(wid);
            cursor = w.by_unused.next;
            on_list += 1;
        }
        assert_eq!(self.unused_tail, prev, "unused tail out of sync");
        let marked = live
            .iter()
            .filter(|&&i| self.windows[i].as_ref().is_some_and(|w| w.in_unused))
            .count();
        assert_eq!(on_list, marked, "in_unused flags disagree with the list");

        // context slots and window bitmasks mirror each other
        for (slot, bound) in self.contexts.iter().enumerate() {
            if let Some(wid) = bound {
                assert!(
                    self.win(*wid).contexts & (1 << slot) != 0,
                    "bound window does not list context {slot}"
                );
            }
        }
        for &i in &live {
            let w = self.windows[i].as_ref().unwrap();
            for slot in 0..MAX_CONTEXTS {
                if w.contexts & (1 << slot) != 0 {
                    assert_eq!(
                        self.contexts[slot],
                        Some(WindowId(i as u32)),
                        "window lists context {slot} that is bound elsewhere"
                    );
                }
            }
        }
    }
}
