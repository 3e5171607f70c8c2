//! Fiber stack arena: guarded, watermarked, page-advised stacks.
//!
//! Every stack is an anonymous private mapping with one `PROT_NONE` guard
//! page at the growth end. Default-sized stacks additionally carry a
//! watermark: right after mapping, the whole region is advised
//! `MADV_DONTNEED` and a poison pattern is scattered near the hot end.
//! When a fiber is recycled, an intact pattern proves the fiber never
//! reached that depth, so no release syscall is needed; a broken pattern
//! triggers `MADV_DONTNEED` for the cold span between the stack base and
//! the watermark page, after which the pattern is rewritten.
//!
//! Custom-sized stacks skip watermarking and pooling and are unmapped as
//! soon as their fiber is recycled.

use crate::error::{CoreError, Result};
use once_cell::sync::OnceCell;
use std::cell::Cell;
use std::io;
use std::ptr;

/// Poison values scattered over the watermark window.
///
/// Random 64-bit constants; the only requirement is that a fiber is
/// vanishingly unlikely to write exactly these words at exactly these
/// offsets.
const POISON_POOL: [u64; 8] = [
    0x74f31d37285c4c37,
    0xb10269a05bf10c29,
    0x0994d845bd284e0f,
    0x9ffd4f7129c184df,
    0x357151e6711c4415,
    0x8c5e5f41aafe6f28,
    0x6917dd79e78049d5,
    0xba61957c65ca2465,
];

/// Distance between consecutive poison words, in u64 steps. A 128-byte
/// gap covers the common frame sizes on x86-64.
const POISON_STRIDE: usize = 128 / std::mem::size_of::<u64>();

/// System page size, probed once per process.
pub fn page_size() -> usize {
    static PAGE: OnceCell<usize> = OnceCell::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf is always safe to call.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

#[inline(never)]
fn deeper_frame(prev: *const u8) -> i32 {
    let marker = 0u8;
    if (&marker as *const u8) < prev {
        -1
    } else {
        1
    }
}

/// Stack growth direction: -1 when stacks grow towards lower addresses.
/// Probed once per process by comparing frame addresses.
pub fn stack_direction() -> i32 {
    static DIR: OnceCell<i32> = OnceCell::new();
    *DIR.get_or_init(|| {
        let marker = 0u8;
        deeper_frame(&marker)
    })
}

fn page_align_down(p: usize) -> usize {
    p & !(page_size() - 1)
}

fn page_align_up(p: usize) -> usize {
    page_align_down(p + page_size() - 1)
}

// Thin syscall wrappers: named after the syscall, errno mapped to
// io::Error.

fn mmap_anon(len: usize) -> Result<*mut u8> {
    // SAFETY: anonymous mapping, no fd involved.
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(CoreError::system("mmap", io::Error::last_os_error()));
    }
    Ok(p.cast())
}

fn munmap(addr: *mut u8, len: usize) {
    // SAFETY: addr/len come from a successful mmap of exactly this range.
    let rc = unsafe { libc::munmap(addr.cast(), len) };
    if rc != 0 {
        tracing::error!(syscall = "munmap", err = %io::Error::last_os_error(), "stack unmap failed");
    }
}

fn mprotect(addr: *mut u8, len: usize, prot: libc::c_int) -> Result<()> {
    // SAFETY: addr/len lie inside a live mapping owned by the arena.
    let rc = unsafe { libc::mprotect(addr.cast(), len, prot) };
    if rc != 0 {
        return Err(CoreError::system("mprotect", io::Error::last_os_error()));
    }
    Ok(())
}

fn madvise_dontneed(addr: *mut u8, len: usize) {
    // SAFETY: addr/len lie inside a live mapping owned by the arena.
    let rc = unsafe { libc::madvise(addr.cast(), len, libc::MADV_DONTNEED) };
    if rc != 0 {
        tracing::warn!(syscall = "madvise", err = %io::Error::last_os_error(), "stack advise failed");
    }
}

/// One fiber stack. Owned by the fiber for its whole pooled life.
pub struct FiberStack {
    /// Mapping base.
    base: *mut u8,
    /// Total mapped length, guard page included.
    map_len: usize,
    /// Low end of the usable area (above the guard on grow-down stacks).
    lo: *mut u8,
    /// Usable size in bytes.
    size: usize,
    /// First poison word, when the stack is tracked.
    watermark: Option<*mut u8>,
    /// Custom-sized stacks are destroyed instead of pooled.
    custom: bool,
}

impl FiberStack {
    /// Low end of the usable area, as required by the context layer.
    pub(crate) fn lo(&self) -> *mut u8 {
        self.lo
    }

    /// Usable stack size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True for custom-sized, unpooled stacks.
    pub fn is_custom(&self) -> bool {
        self.custom
    }
}

/// Counters exposed for observability and tests.
#[derive(Debug, Default)]
pub struct StackStats {
    /// `MADV_DONTNEED` issued at stack creation (eager release).
    pub eager_dontneed: Cell<u64>,
    /// `MADV_DONTNEED` issued on recycle because the watermark was
    /// overwritten.
    pub recycle_dontneed: Cell<u64>,
    /// Stacks currently mapped.
    pub mapped: Cell<u64>,
}

/// Allocates, recycles and destroys fiber stacks.
pub struct StackArena {
    default_size: usize,
    watermark_window: usize,
    stats: StackStats,
}

impl StackArena {
    /// Create an arena producing `default_size` stacks with the given
    /// watermark window.
    pub fn new(default_size: usize, watermark_window: usize) -> Self {
        Self {
            default_size,
            watermark_window,
            stats: StackStats::default(),
        }
    }

    /// Arena counters.
    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Map a new stack. `size` other than the arena default produces an
    /// untracked custom stack.
    pub fn alloc(&self, size: usize) -> Result<FiberStack> {
        let custom = size != self.default_size;
        let usable = page_align_up(size);
        let map_len = usable + page_size();
        let base = mmap_anon(map_len)?;

        let (guard, lo) = if stack_direction() < 0 {
            // Grows down: protect the lowest page, use everything above.
            (base, unsafe { base.add(page_size()) })
        } else {
            // Grows up: protect the highest page.
            (unsafe { base.add(usable) }, base)
        };
        if let Err(e) = mprotect(guard, page_size(), libc::PROT_NONE) {
            munmap(base, map_len);
            return Err(e);
        }

        let mut stack = FiberStack {
            base,
            map_len,
            lo,
            size: usable,
            watermark: None,
            custom,
        };
        if !custom {
            self.watermark_create(&mut stack);
        }
        self.stats.mapped.set(self.stats.mapped.get() + 1);
        Ok(stack)
    }

    /// Release cold pages of a recycled stack when the fiber went deeper
    /// than the watermark, then restore the pattern. No syscall when the
    /// watermark is intact.
    pub fn recycle(&self, stack: &FiberStack) {
        let Some(wm) = stack.watermark else {
            return;
        };
        if watermark_intact(wm) {
            return;
        }
        let (start, end) = if stack_direction() < 0 {
            (stack.lo as usize, page_align_down(wm as usize))
        } else {
            (
                page_align_up(wm as usize + watermark_span()),
                stack.lo as usize + stack.size,
            )
        };
        if end > start {
            madvise_dontneed(start as *mut u8, end - start);
            self.stats
                .recycle_dontneed
                .set(self.stats.recycle_dontneed.get() + 1);
        }
        watermark_write(wm);
    }

    /// Unmap a stack.
    pub fn destroy(&self, stack: &FiberStack) {
        munmap(stack.base, stack.map_len);
        self.stats.mapped.set(self.stats.mapped.get() - 1);
    }

    /// We do not expect full stack usage under regular load; release the
    /// fresh mapping eagerly and scatter the poison pattern at a random
    /// offset inside the watermark window so overflow past it is caught
    /// with high probability.
    fn watermark_create(&self, stack: &mut FiberStack) {
        madvise_dontneed(stack.lo, stack.size);
        self.stats
            .eager_dontneed
            .set(self.stats.eager_dontneed.get() + 1);

        let offset = (rand::random::<usize>() % POISON_STRIDE) * std::mem::size_of::<u64>();
        let wm = if stack_direction() < 0 {
            stack.lo as usize + stack.size - self.watermark_window + offset
        } else {
            stack.lo as usize + self.watermark_window - page_size() + offset
        };
        let wm = wm as *mut u8;
        watermark_write(wm);
        stack.watermark = Some(wm);
    }
}

/// Bytes between the first and the last poison word, inclusive.
fn watermark_span() -> usize {
    POISON_POOL.len() * POISON_STRIDE * std::mem::size_of::<u64>()
}

fn watermark_intact(wm: *mut u8) -> bool {
    let mut p = wm.cast::<u64>();
    for word in POISON_POOL {
        // SAFETY: the watermark span lies strictly inside the usable
        // stack area.
        unsafe {
            if p.read_unaligned() != word {
                return false;
            }
            p = p.add(POISON_STRIDE);
        }
    }
    true
}

fn watermark_write(wm: *mut u8) {
    let mut p = wm.cast::<u64>();
    for word in POISON_POOL {
        // SAFETY: see watermark_intact.
        unsafe {
            p.write_unaligned(word);
            p = p.add(POISON_STRIDE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{STACK_SIZE_DEFAULT, STACK_WATERMARK_WINDOW};

    fn arena() -> StackArena {
        StackArena::new(STACK_SIZE_DEFAULT, STACK_WATERMARK_WINDOW)
    }

    #[test]
    fn direction_is_probed_once() {
        let d = stack_direction();
        assert!(d == -1 || d == 1);
        assert_eq!(d, stack_direction());
    }

    #[test]
    fn default_stack_has_watermark() {
        let a = arena();
        let s = a.alloc(STACK_SIZE_DEFAULT).unwrap();
        assert!(!s.is_custom());
        assert!(s.watermark.is_some());
        assert!(watermark_intact(s.watermark.unwrap()));
        a.destroy(&s);
    }

    #[test]
    fn custom_stack_is_untracked() {
        let a = arena();
        let s = a.alloc(64 * 1024).unwrap();
        assert!(s.is_custom());
        assert!(s.watermark.is_none());
        a.destroy(&s);
    }

    #[test]
    fn intact_watermark_skips_release() {
        let a = arena();
        let s = a.alloc(STACK_SIZE_DEFAULT).unwrap();
        a.recycle(&s);
        assert_eq!(a.stats().recycle_dontneed.get(), 0);
        a.destroy(&s);
    }

    #[test]
    fn broken_watermark_triggers_release_and_repair() {
        let a = arena();
        let s = a.alloc(STACK_SIZE_DEFAULT).unwrap();
        let wm = s.watermark.unwrap();
        // Simulate a deep fiber overwriting the first poison word.
        unsafe { wm.cast::<u64>().write_unaligned(0) };
        a.recycle(&s);
        assert_eq!(a.stats().recycle_dontneed.get(), 1);
        assert!(watermark_intact(wm));
        // A second recycle with the repaired pattern is free again.
        a.recycle(&s);
        assert_eq!(a.stats().recycle_dontneed.get(), 1);
        a.destroy(&s);
    }

    #[test]
    fn guard_page_reduces_usable_size() {
        let a = arena();
        let s = a.alloc(STACK_SIZE_DEFAULT).unwrap();
        assert_eq!(s.size(), STACK_SIZE_DEFAULT);
        assert_eq!(s.map_len, STACK_SIZE_DEFAULT + page_size());
        a.destroy(&s);
    }
}
