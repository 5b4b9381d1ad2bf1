//! The compressed-blob heap of the shared region.
//!
//! A bump allocator over a fixed byte range. Blobs are immutable once
//! published: `free` only accounts the bytes as wasted, and the space is
//! reclaimed when the arena compacts live blobs during `collect()`. Offset
//! zero is reserved so that a zero word in a hash slot always means "no
//! blob"; allocation starts at [`HEAP_RESERVE`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errassert;
use crate::error::{Error, Result};

/// First usable offset; offset 0 is the "no blob" sentinel.
pub const HEAP_RESERVE: u64 = 8;

/// Per-blob header: stored length, uncompressed length, flags, padding.
pub const BLOB_HEADER_BYTES: u64 = 16;

const FLAG_COMPRESSED: u32 = 1;

/// A blob read back out of the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapBlob {
    pub bytes: Vec<u8>,
    pub uncompressed_len: u32,
    pub compressed: bool,
}

/// A view over the heap byte range. Bump and wasted counters live in the
/// shared header so every process sees the same heap state.
#[derive(Debug)]
pub struct Heap {
    base: *mut u8,
    size: u64,
    bump: *const AtomicU64,
    wasted: *const AtomicU64,
}

impl Heap {
    /// # Safety
    ///
    /// `base` must point at `size` bytes valid for the lifetime of the
    /// view; `bump` and `wasted` must point at live atomic words in the
    /// shared header.
    pub unsafe fn new(
        base: *mut u8,
        size: u64,
        bump: *const AtomicU64,
        wasted: *const AtomicU64,
    ) -> Self {
        Heap {
            base,
            size,
            bump,
            wasted,
        }
    }

    fn bump(&self) -> &AtomicU64 {
        unsafe { &*self.bump }
    }

    fn wasted(&self) -> &AtomicU64 {
        unsafe { &*self.wasted }
    }

    /// Bytes allocated since init, including bytes since freed.
    pub fn used(&self) -> u64 {
        self.bump().load(Ordering::Acquire)
    }

    /// Bytes belonging to freed blobs, reclaimable by compaction.
    pub fn wasted_bytes(&self) -> u64 {
        self.wasted().load(Ordering::Acquire)
    }

    /// Bytes reachable from live bindings.
    pub fn reachable(&self) -> u64 {
        self.used() - self.wasted_bytes()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn blob_words(&self, offset: u64) -> *mut u32 {
        unsafe { self.base.add(offset as usize) as *mut u32 }
    }

    /// Total footprint of the blob at `offset`, header and padding
    /// included.
    pub fn total_size(&self, offset: u64) -> u64 {
        let stored_len = unsafe { self.blob_words(offset).read() } as u64;
        BLOB_HEADER_BYTES + pad8(stored_len)
    }

    /// Appends a blob, returning its offset and total footprint.
    pub fn alloc(&self, bytes: &[u8], uncompressed_len: u32, compressed: bool) -> Result<(u64, u64)> {
        let total = BLOB_HEADER_BYTES + pad8(bytes.len() as u64);
        let offset = self.bump().fetch_add(total, Ordering::AcqRel);
        if offset + total > self.size {
            self.bump().fetch_sub(total, Ordering::AcqRel);
            return Err(Error::HeapFull);
        }
        let flags = if compressed { FLAG_COMPRESSED } else { 0 };
        unsafe {
            let words = self.blob_words(offset);
            words.write(bytes.len() as u32);
            words.add(1).write(uncompressed_len);
            words.add(2).write(flags);
            words.add(3).write(0);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add((offset + BLOB_HEADER_BYTES) as usize),
                bytes.len(),
            );
        }
        Ok((offset, total))
    }

    /// Copies the blob at `offset` back out.
    pub fn read(&self, offset: u64) -> Result<HeapBlob> {
        if offset < HEAP_RESERVE || offset + BLOB_HEADER_BYTES > self.size {
            return errassert!("blob offset {offset} out of range");
        }
        let (stored_len, uncompressed_len, flags) = unsafe {
            let words = self.blob_words(offset);
            (words.read(), words.add(1).read(), words.add(2).read())
        };
        if offset + BLOB_HEADER_BYTES + stored_len as u64 > self.size {
            return errassert!("blob at {offset} overruns the heap ({stored_len} bytes)");
        }
        let mut bytes = vec![0u8; stored_len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add((offset + BLOB_HEADER_BYTES) as usize),
                bytes.as_mut_ptr(),
                stored_len as usize,
            );
        }
        Ok(HeapBlob {
            bytes,
            uncompressed_len,
            compressed: flags & FLAG_COMPRESSED != 0,
        })
    }

    /// Accounts the blob at `offset` as garbage, returning the freed
    /// footprint.
    pub fn free(&self, offset: u64) -> u64 {
        let total = self.total_size(offset);
        self.wasted().fetch_add(total, Ordering::AcqRel);
        total
    }

    /// Slides `total` bytes from `src` down to `dst`. Compaction only;
    /// ranges may overlap.
    pub fn slide(&self, src: u64, dst: u64, total: u64) {
        debug_assert!(dst <= src);
        unsafe {
            std::ptr::copy(
                self.base.add(src as usize),
                self.base.add(dst as usize),
                total as usize,
            );
        }
    }

    /// Resets the counters after a compaction pass.
    pub fn reset_after_compaction(&self, new_bump: u64) {
        self.bump().store(new_bump, Ordering::Release);
        self.wasted().store(0, Ordering::Release);
    }
}

fn pad8(len: u64) -> u64 {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHeap {
        _buf: Vec<u64>,
        bump: Box<AtomicU64>,
        wasted: Box<AtomicU64>,
        heap: Heap,
    }

    fn heap(size: u64) -> TestHeap {
        let mut buf = vec![0u64; size as usize / 8];
        let bump = Box::new(AtomicU64::new(HEAP_RESERVE));
        let wasted = Box::new(AtomicU64::new(0));
        let heap = unsafe {
            Heap::new(
                buf.as_mut_ptr() as *mut u8,
                size,
                &*bump as *const AtomicU64,
                &*wasted as *const AtomicU64,
            )
        };
        TestHeap {
            _buf: buf,
            bump,
            wasted,
            heap,
        }
    }

    #[test]
    fn test_alloc_read_roundtrip() {
        let t = heap(1024);
        let (offset, total) = t.heap.alloc(b"payload", 7, false).unwrap();
        assert_eq!(offset, HEAP_RESERVE);
        assert_eq!(total, BLOB_HEADER_BYTES + 8);
        let blob = t.heap.read(offset).unwrap();
        assert_eq!(blob.bytes, b"payload");
        assert_eq!(blob.uncompressed_len, 7);
        assert!(!blob.compressed);
    }

    #[test]
    fn test_compressed_flag_survives() {
        let t = heap(1024);
        let (offset, _) = t.heap.alloc(b"zz", 100, true).unwrap();
        let blob = t.heap.read(offset).unwrap();
        assert!(blob.compressed);
        assert_eq!(blob.uncompressed_len, 100);
    }

    #[test]
    fn test_heap_fills_up() {
        let t = heap(64);
        t.heap.alloc(&[0u8; 16], 16, false).unwrap();
        assert_eq!(t.heap.alloc(&[0u8; 64], 64, false).unwrap_err(), Error::HeapFull);
        // The failed allocation must not leak bump space.
        assert_eq!(t.bump.load(Ordering::SeqCst), HEAP_RESERVE + 32);
    }

    #[test]
    fn test_free_accounts_waste() {
        let t = heap(1024);
        let (offset, total) = t.heap.alloc(b"abcdef", 6, false).unwrap();
        assert_eq!(t.heap.free(offset), total);
        assert_eq!(t.wasted.load(Ordering::SeqCst), total);
        assert_eq!(t.heap.reachable(), HEAP_RESERVE);
    }

    #[test]
    fn test_slide_moves_blob() {
        let t = heap(1024);
        let (first, first_total) = t.heap.alloc(b"dead", 4, false).unwrap();
        let (second, second_total) = t.heap.alloc(b"live-blob", 9, false).unwrap();
        t.heap.free(first);
        t.heap.slide(second, first, second_total);
        t.heap.reset_after_compaction(first + second_total);
        let blob = t.heap.read(first).unwrap();
        assert_eq!(blob.bytes, b"live-blob");
        assert_eq!(t.heap.wasted_bytes(), 0);
        assert!(first_total > 0);
    }
}
