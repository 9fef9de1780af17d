const BITS_PER_ENTRY: usize = 8;

/// Page-granularity allocation bitmap. Bit `i` is set iff page `i` is in use.
///
/// Page 0 is reserved at construction so that address 0 never refers to an
/// allocation. Both searches are linear scans over the bitmap.
pub struct BitmapPageAllocator {
    total_pages: usize,
    free_pages: usize,
    bitmap: Box<[u8]>,
}

impl BitmapPageAllocator {
    pub fn new(total_pages: usize) -> Self {
        let bitmap_size = total_pages.div_ceil(BITS_PER_ENTRY);

        let mut allocator = Self {
            total_pages,
            free_pages: total_pages,
            bitmap: vec![0; bitmap_size].into_boxed_slice(),
        };

        allocator.set_bit(0);
        allocator
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Pages in use, not counting the reserved page 0.
    pub fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages - 1
    }

    /// set a particular bit (1), taking in page_index (usize)
    pub fn set_bit(&mut self, page_index: usize) {
        assert!(page_index < self.total_pages);

        let byte_index = page_index / BITS_PER_ENTRY;
        let mask = 1 << (page_index % BITS_PER_ENTRY);
        if self.bitmap[byte_index] & mask == 0 {
            self.bitmap[byte_index] |= mask;
            self.free_pages -= 1;
        }
    }

    /// clear a particular bit (0), taking in page_index (usize)
    pub fn clear_bit(&mut self, page_index: usize) {
        assert!(page_index < self.total_pages);

        let byte_index = page_index / BITS_PER_ENTRY;
        let mask = 1 << (page_index % BITS_PER_ENTRY);
        if self.bitmap[byte_index] & mask != 0 {
            self.bitmap[byte_index] &= !mask;
            self.free_pages += 1;
        }
    }

    /// check if bit is set at page_index. returns true if bit == 1, false otherwise
    pub fn is_bit_set(&self, page_index: usize) -> bool {
        assert!(page_index < self.total_pages);

        let byte_index = page_index / BITS_PER_ENTRY;
        let mask = 1 << (page_index % BITS_PER_ENTRY);
        (self.bitmap[byte_index] & mask) != 0
    }

    /// First free page, any position will do.
    pub fn find_free_page(&self) -> Option<usize> {
        if self.free_pages == 0 {
            return None;
        }
        (1..self.total_pages).find(|&index| !self.is_bit_set(index))
    }

    /// Start of the first window of `count` consecutive free pages.
    pub fn find_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.free_pages {
            return None;
        }
        let last_start = self.total_pages - count;

        let mut start = 1;
        while start <= last_start {
            match (start..start + count).find(|&index| self.is_bit_set(index)) {
                // no window can contain a used page, restart past it
                Some(used) => start = used + 1,
                None => return Some(start),
            }
        }
        None
    }
}
