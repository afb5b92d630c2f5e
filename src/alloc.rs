//! Object number allocation.
//!
//! `Allocator` hands out QP/CQ/EQ/MPT/multicast numbers from a fixed bitmap.
//! Numbers wider than the bitmap are produced by OR-ing a rolling `top`
//! offset into the bit index, so a freed QPN is not immediately reissued
//! with the same full value.
//!
//! `Buddy` hands out power-of-two runs of MTT segments.
use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};

const WORD_BITS: u32 = u64::BITS;

struct Bitmap {
    words: Vec<u64>,
    nbits: u32,
}

impl Bitmap {
    fn new(nbits: u32) -> Self {
        let nwords = ((nbits + WORD_BITS - 1) / WORD_BITS) as usize;
        Bitmap {
            words: vec![0; nwords],
            nbits,
        }
    }

    #[inline]
    fn test(&self, bit: u32) -> bool {
        self.words[(bit / WORD_BITS) as usize] & (1 << (bit % WORD_BITS)) != 0
    }

    #[inline]
    fn set(&mut self, bit: u32) {
        self.words[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
    }

    #[inline]
    fn clear(&mut self, bit: u32) {
        self.words[(bit / WORD_BITS) as usize] &= !(1 << (bit % WORD_BITS));
    }

    /// First zero bit at or after `start`, or `nbits` if there is none.
    fn find_next_zero(&self, start: u32) -> u32 {
        let mut bit = start;
        while bit < self.nbits {
            let word = self.words[(bit / WORD_BITS) as usize] | ((1u64 << (bit % WORD_BITS)) - 1);
            if word != u64::MAX {
                let found = (bit / WORD_BITS) * WORD_BITS + (!word).trailing_zeros();
                return found.min(self.nbits);
            }
            bit = (bit / WORD_BITS + 1) * WORD_BITS;
        }
        self.nbits
    }

    fn find_next_set(&self, start: u32) -> u32 {
        let mut bit = start;
        while bit < self.nbits {
            let word = self.words[(bit / WORD_BITS) as usize] & !((1u64 << (bit % WORD_BITS)) - 1);
            if word != 0 {
                let found = (bit / WORD_BITS) * WORD_BITS + word.trailing_zeros();
                return found.min(self.nbits);
            }
            bit = (bit / WORD_BITS + 1) * WORD_BITS;
        }
        self.nbits
    }
}

struct AllocState {
    last: u32,
    top: u32,
    table: Bitmap,
}

/// Bitmap allocator with wraparound generations.
pub struct Allocator {
    max: u32,
    mask: u32,
    reserved: u32,
    inner: Mutex<AllocState>,
}

impl Allocator {
    /// `capacity` bits are tracked; `mask` bounds the numbers handed out
    /// (it must cover `capacity - 1`); the first `reserved` numbers are
    /// permanently in use.
    pub fn new(capacity: u32, mask: u32, reserved: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }
        if mask & (capacity - 1) != capacity - 1 || reserved > capacity {
            return Err(Error::InvalidConfig("allocator mask or reservation out of range"));
        }
        let mut table = Bitmap::new(capacity);
        for i in 0..reserved {
            table.set(i);
        }
        Ok(Allocator {
            max: capacity,
            mask,
            reserved,
            inner: Mutex::new(AllocState {
                last: 0,
                top: 0,
                table,
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.max
    }

    pub fn alloc(&self) -> Result<u32> {
        let mut st = self.inner.lock();
        let mut obj = st.table.find_next_zero(st.last);
        if obj >= self.max {
            st.top = st.top.wrapping_add(self.max) & self.mask;
            obj = st.table.find_next_zero(0);
        }
        if obj < self.max {
            st.table.set(obj);
            Ok(obj | st.top)
        } else {
            Err(Error::ResourceExhausted("object numbers"))
        }
    }

    pub fn free(&self, obj: u32) {
        let obj = obj & (self.max - 1);
        if obj < self.reserved {
            warn!("attempt to free reserved object number {:#x}", obj);
            return;
        }
        let mut st = self.inner.lock();
        if !st.table.test(obj) {
            warn!("double free of object number {:#x}", obj);
            return;
        }
        st.table.clear(obj);
        st.last = st.last.min(obj);
        st.top = st.top.wrapping_add(self.max) & self.mask;
    }

    /// Number of bits currently set, reserved ones included.
    pub fn in_use(&self) -> u32 {
        self.inner.lock().table.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Buddy allocator over `1 << max_order` segments.
pub struct Buddy {
    max_order: u32,
    // one bitmap per order; a set bit is a free block of that order
    bits: Mutex<Vec<Bitmap>>,
}

impl Buddy {
    pub fn new(max_order: u32) -> Self {
        let mut bits: Vec<Bitmap> = (0..=max_order)
            .map(|order| Bitmap::new(1 << (max_order - order)))
            .collect();
        bits[max_order as usize].set(0);
        Buddy {
            max_order,
            bits: Mutex::new(bits),
        }
    }

    /// Returns the first segment of a free run of `1 << order` segments.
    pub fn alloc(&self, order: u32) -> Result<u32> {
        if order > self.max_order {
            return Err(Error::ResourceExhausted("MTT segments"));
        }
        let mut bits = self.bits.lock();
        let mut o = order;
        let mut seg = None;
        while o <= self.max_order {
            let map = &bits[o as usize];
            let found = map.find_next_set(0);
            if found < map.nbits {
                seg = Some(found);
                break;
            }
            o += 1;
        }
        let mut seg = seg.ok_or(Error::ResourceExhausted("MTT segments"))?;
        bits[o as usize].clear(seg);
        while o > order {
            o -= 1;
            seg <<= 1;
            bits[o as usize].set(seg ^ 1);
        }
        Ok(seg << order)
    }

    pub fn free(&self, seg: u32, order: u32) {
        let mut seg = seg >> order;
        let mut order = order;
        let mut bits = self.bits.lock();
        while order < self.max_order && bits[order as usize].test(seg ^ 1) {
            bits[order as usize].clear(seg ^ 1);
            seg >>= 1;
            order += 1;
        }
        bits[order as usize].set(seg);
    }
}
