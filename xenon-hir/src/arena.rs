//! Bump allocator backing the scratch data of a single compilation.
//!
//! Memory is handed out from a list of fixed-size chunks. Nothing is freed individually: `reset`
//! rewinds every chunk so the next compilation reuses the same memory, and dropping the arena
//! releases all chunks at once. Only `Copy` data can be placed in the arena so there are never
//! destructors that would need to run.

use std::{
    alloc::Layout,
    cell::{Cell, UnsafeCell},
    ptr::NonNull,
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Alignment of every chunk, and the maximum alignment supported for allocations.
const CHUNK_ALIGN: usize = 16;

struct Chunk {
    ptr: NonNull<u8>,
    capacity: usize,
    offset: Cell<usize>,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        let layout = match Layout::from_size_align(capacity, CHUNK_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid arena chunk size: {capacity}"),
        };
        // SAFETY: `capacity` is never zero (see `Arena::with_chunk_size`). The chunk is zeroed so
        // that every byte within `capacity` is always initialized, even alignment padding.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, capacity, offset: Cell::new(0) }
    }

    #[inline]
    fn try_bump(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = self.offset.get().checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.offset.set(end);
        // SAFETY: `start < end <= capacity` so the pointer stays within the chunk allocation.
        Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(start)) })
    }

    fn used(&self) -> &[u8] {
        // SAFETY: the chunk was zero initialized, so all bytes up to `offset` are initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.offset.get()) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: the layout matches the one used in `Chunk::new`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, CHUNK_ALIGN);
            std::alloc::dealloc(self.ptr.as_ptr(), layout)
        }
    }
}

pub struct Arena {
    chunk_size: usize,
    chunks: UnsafeCell<Vec<Chunk>>,
    active: Cell<usize>,
}

// SAFETY: the arena exclusively owns its chunks, and since it is not `Sync` it can only be used
// from one thread at a time. References handed out are bound to a borrow of the arena so they
// cannot outlive a move to another thread.
unsafe impl Send for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(CHUNK_ALIGN),
            chunks: UnsafeCell::new(vec![]),
            active: Cell::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The number of chunks currently owned by the arena (including empty ones).
    pub fn chunk_count(&self) -> usize {
        self.chunks().len()
    }

    /// The total number of bytes handed out since the last reset, including alignment padding.
    pub fn bytes_allocated(&self) -> usize {
        self.chunks().iter().map(|chunk| chunk.offset.get()).sum()
    }

    fn chunks(&self) -> &[Chunk] {
        // SAFETY: the chunk list is only mutated inside `allocate_aligned` (which does not hold a
        // reference across calls) or through `&mut self`.
        unsafe { &*self.chunks.get() }
    }

    /// Allocate `size` bytes with 16 byte alignment.
    #[inline]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.allocate_aligned(size, CHUNK_ALIGN)
    }

    pub fn allocate_aligned(&self, size: usize, align: usize) -> NonNull<u8> {
        assert!(align.is_power_of_two() && align <= CHUNK_ALIGN, "unsupported alignment: {align}");
        let size = size.max(1);

        // SAFETY: no other reference to the chunk list is live while we are in this function.
        let chunks = unsafe { &mut *self.chunks.get() };

        let mut index = self.active.get();
        while index < chunks.len() {
            if let Some(ptr) = chunks[index].try_bump(size, align) {
                self.active.set(index);
                return ptr;
            }
            index += 1;
        }

        let chunk = Chunk::new(self.chunk_size.max(size));
        let ptr = match chunk.try_bump(size, align) {
            Some(ptr) => ptr,
            None => unreachable!("fresh chunk too small for {size} bytes"),
        };
        chunks.push(chunk);
        self.active.set(chunks.len() - 1);
        ptr
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T: Copy>(&self, value: T) -> &mut T {
        let ptr = self.allocate_aligned(std::mem::size_of::<T>(), align_of_checked::<T>());
        // SAFETY: the memory is freshly allocated, suitably aligned and large enough for `T`.
        unsafe {
            let ptr = ptr.as_ptr() as *mut T;
            ptr.write(value);
            &mut *ptr
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_fill<T: Copy>(&self, len: usize, value: T) -> &mut [T] {
        let ptr = self.allocate_aligned(std::mem::size_of::<T>() * len, align_of_checked::<T>());
        // SAFETY: see `alloc`, every element is written before the slice is created.
        unsafe {
            let ptr = ptr.as_ptr() as *mut T;
            for i in 0..len {
                ptr.add(i).write(value);
            }
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let ptr = self.allocate_aligned(std::mem::size_of_val(src), align_of_checked::<T>());
        // SAFETY: see `alloc`, the destination does not overlap `src`.
        unsafe {
            let ptr = ptr.as_ptr() as *mut T;
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
            std::slice::from_raw_parts_mut(ptr, src.len())
        }
    }

    pub fn alloc_str(&self, value: &str) -> &str {
        let bytes = self.alloc_slice_copy(value.as_bytes());
        // SAFETY: copied from a valid `str`.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Rewinds every chunk so that memory can be reused for the next compilation.
    pub fn reset(&mut self) {
        for chunk in self.chunks.get_mut() {
            chunk.offset.set(0);
        }
        self.active.set(0);
    }

    /// Copies all live data out of the arena, concatenated in chunk order.
    ///
    /// Takes `&mut self` so that no reference returned by the `alloc*` methods can be alive
    /// while the chunks are read.
    pub fn clone_contents(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_allocated());
        for chunk in self.chunks.get_mut().iter() {
            out.extend_from_slice(chunk.used());
        }
        out
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.chunk_count())
            .field("allocated", &self.bytes_allocated())
            .finish()
    }
}

fn align_of_checked<T>() -> usize {
    let align = std::mem::align_of::<T>();
    assert!(align <= CHUNK_ALIGN, "type alignment {align} not supported by the arena");
    align
}

#[cfg(test)]
mod test {
    use super::*;

    fn ranges_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
        a.0 < b.1 && b.0 < a.1
    }

    #[test]
    fn allocations_never_overlap() {
        fn check(sizes: Vec<u8>) -> bool {
            let arena = Arena::with_chunk_size(64);
            let mut ranges = vec![];
            for size in sizes {
                let size = size as usize;
                let ptr = arena.allocate(size).as_ptr() as usize;
                ranges.push((ptr, ptr + size.max(1)));
            }
            for (i, a) in ranges.iter().enumerate() {
                if ranges[i + 1..].iter().any(|b| ranges_overlap(*a, *b)) {
                    return false;
                }
            }
            true
        }

        assert!(check(vec![60, 60, 60, 200, 1, 1]));
        quickcheck::quickcheck(check as fn(Vec<u8>) -> bool)
    }

    #[test]
    fn reset_reuses_chunks() {
        let mut arena = Arena::with_chunk_size(128);
        let sizes = [40, 40, 40, 100, 8, 300, 16];

        let first: Vec<_> = sizes.iter().map(|size| arena.allocate(*size).as_ptr()).collect();
        let chunks = arena.chunk_count();
        assert!(chunks > 1);

        arena.reset();
        assert_eq!(arena.bytes_allocated(), 0);

        let second: Vec<_> = sizes.iter().map(|size| arena.allocate(*size).as_ptr()).collect();
        assert_eq!(first, second);
        assert_eq!(arena.chunk_count(), chunks);
    }

    #[test]
    fn oversized_allocation() {
        let arena = Arena::with_chunk_size(64);
        let small = arena.allocate(8).as_ptr() as usize;
        let big = arena.allocate(1000).as_ptr() as usize;
        assert!(!ranges_overlap((small, small + 8), (big, big + 1000)));
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn typed_allocations() {
        let arena = Arena::with_chunk_size(64);
        let a = arena.alloc(0x1234_u32);
        let table = arena.alloc_slice_fill(20, None::<u32>);
        let name = arena.alloc_str("loc_82000000");

        table[3] = Some(7);
        *a += 1;

        assert_eq!(*a, 0x1235);
        assert_eq!(table.iter().filter(|x| x.is_some()).count(), 1);
        assert_eq!(name, "loc_82000000");
    }

    #[test]
    fn clone_contents() {
        let mut arena = Arena::with_chunk_size(16);
        let head = arena.alloc_slice_copy(&[1_u8, 2, 3, 4]);
        head[3] = 9;
        arena.alloc_slice_copy(&[5_u8; 16]);

        let contents = arena.clone_contents();
        assert_eq!(&contents[..4], &[1, 2, 3, 9]);
        assert_eq!(&contents[contents.len() - 16..], &[5; 16]);
    }
}
