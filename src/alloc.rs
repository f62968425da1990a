/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::counter::Counter;
use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

pub const BLOCK_BASE_SIZE: usize = 128;
pub const MAX_SIZE_CLASS: usize = 14;
pub const SIZE_CLASS_COUNT: usize = MAX_SIZE_CLASS + 1;

// free slabs retained per class when the config doesn't say otherwise
pub const DEFAULT_RETAIN_COUNT: usize = 128;

pub fn class_to_size(class: usize) -> usize {
    assert!(class <= MAX_SIZE_CLASS);

    BLOCK_BASE_SIZE << class
}

/// Returns the smallest size class whose blocks hold at least `size` bytes,
/// or None if `size` exceeds the largest class.
pub fn class_for_size(size: usize) -> Option<usize> {
    for class in 0..SIZE_CLASS_COUNT {
        if class_to_size(class) >= size {
            return Some(class);
        }
    }

    None
}

pub fn class_for_label(label: &str) -> Option<usize> {
    let class = match label {
        "128" => 0,
        "256" => 1,
        "512" => 2,
        "1k" | "1024" => 3,
        "2k" | "2048" => 4,
        "4k" | "4096" => 5,
        "8k" | "8192" => 6,
        "16k" => 7,
        "32k" => 8,
        "64k" => 9,
        "128k" => 10,
        "256k" => 11,
        "512k" => 12,
        "1M" | "1024k" => 13,
        "2M" | "2048k" => 14,
        _ => return None,
    };

    Some(class)
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseChunkSizesError {
    #[error("unknown size label: {0}")]
    UnknownSizeLabel(String),

    #[error("size class index {0} out of range")]
    ClassOutOfRange(usize),

    #[error("invalid chunk count: {0}")]
    InvalidCount(String),
}

/// Parses a retention configuration string of the form `"4k:100, 8k:50"`.
///
/// Each token is either `SIZE:COUNT`, assigning a retention count to the
/// named size class, or a bare `COUNT`, which applies to the class following
/// the previously assigned one. A count of zero in the result means the
/// default applies.
pub fn parse_chunk_sizes(s: &str) -> Result<[usize; SIZE_CLASS_COUNT], ParseChunkSizesError> {
    let mut counts = [0; SIZE_CLASS_COUNT];
    let mut class = 0;

    for token in s.split(|c| c == ',' || c == ' ') {
        let token = token.trim();

        if token.is_empty() {
            continue;
        }

        let count_str = match token.split_once(':') {
            Some((label, count_str)) => {
                class = match class_for_label(label) {
                    Some(class) => class,
                    None => {
                        return Err(ParseChunkSizesError::UnknownSizeLabel(label.to_string()))
                    }
                };

                count_str
            }
            None => token,
        };

        if class >= SIZE_CLASS_COUNT {
            return Err(ParseChunkSizesError::ClassOutOfRange(class));
        }

        let count: usize = count_str
            .parse()
            .map_err(|_| ParseChunkSizesError::InvalidCount(count_str.to_string()))?;

        counts[class] = count;
        class += 1;
    }

    Ok(counts)
}

/// Fire-and-forget accounting of block storage currently in use. Shareable
/// with an external metrics sink; absence never affects correctness.
#[derive(Default)]
pub struct MemoryMetrics {
    pub blocks_in_use: Counter,
    pub bytes_in_use: Counter,
}

/// Refcounted backing storage for one block.
///
/// The bytes are shared by every chain node cloned from the block that first
/// owned them. Interior mutability is used under the chain subsystem's
/// single-writer invariant: only the one logical writer of a chain ever
/// stores into the unfilled tail of a block, and readers only form shared
/// slices over the filled region, which is append-frozen.
pub struct BlockData {
    buf: UnsafeCell<Box<[u8]>>,
    class: Option<usize>,
    alloc: Rc<BlockAllocator>,
}

impl BlockData {
    pub fn capacity(&self) -> usize {
        // SAFETY: the box itself (pointer and length) is only replaced in
        // drop; shared access to its length is always valid
        unsafe { (&(*self.buf.get())).len() }
    }

    /// Returns the filled bytes in `[start, end)`.
    ///
    /// The caller (a chain node) guarantees `end` does not exceed its write
    /// cursor, so the range can never overlap a concurrent `write_at`.
    pub(crate) fn slice(&self, start: usize, end: usize) -> &[u8] {
        // SAFETY: per the single-writer invariant, bytes below a node's
        // write cursor are never stored to again, so a shared slice over
        // them cannot alias a mutation
        unsafe { &(&(*self.buf.get()))[start..end] }
    }

    /// Returns the unfilled region `[start, end)` mutably.
    ///
    /// Callers hold this only through exclusive access to the one node that
    /// can write this storage's tail, which keeps the region unaliased.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn write_slice(&self, start: usize, end: usize) -> &mut [u8] {
        // SAFETY: the range starts at the writing node's write cursor, so it
        // is disjoint from every shared slice handed out over filled bytes,
        // and node exclusivity prevents a second mutable view
        unsafe { &mut (&mut (*self.buf.get()))[start..end] }
    }

    /// Copies `src` into the storage at `offset`.
    ///
    /// Only the chain's writer may call this, and only for offsets at or
    /// beyond its write cursor.
    pub(crate) fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity());

        // SAFETY: raw-pointer copy into the unfilled tail. The region is
        // disjoint from every shared slice handed out, which are all
        // bounded by the write cursor
        unsafe {
            let base = (*self.buf.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), src.len());
        }
    }
}

impl Drop for BlockData {
    fn drop(&mut self) {
        let buf = mem::replace(self.buf.get_mut(), Vec::new().into_boxed_slice());

        self.alloc.release(self.class, buf);
    }
}

struct FreeList {
    retain: usize,
    free: Vec<Box<[u8]>>,
}

/// Size-classed block storage allocator.
///
/// An explicit context object rather than process-global state: each buffer
/// (or test) is constructed against one allocator, and blocks keep their
/// allocator alive so released storage lands back on its free lists.
pub struct BlockAllocator {
    classes: RefCell<Vec<FreeList>>,
    metrics: Option<Arc<MemoryMetrics>>,
}

impl BlockAllocator {
    pub fn new() -> Rc<Self> {
        Self::with_chunk_sizes([0; SIZE_CLASS_COUNT])
    }

    pub fn with_chunk_sizes(counts: [usize; SIZE_CLASS_COUNT]) -> Rc<Self> {
        let mut classes = Vec::with_capacity(SIZE_CLASS_COUNT);

        for &count in counts.iter() {
            let retain = if count > 0 {
                count
            } else {
                DEFAULT_RETAIN_COUNT
            };

            classes.push(FreeList {
                retain,
                free: Vec::new(),
            });
        }

        Rc::new(Self {
            classes: RefCell::new(classes),
            metrics: None,
        })
    }

    pub fn with_config(s: &str) -> Result<Rc<Self>, ParseChunkSizesError> {
        Ok(Self::with_chunk_sizes(parse_chunk_sizes(s)?))
    }

    pub fn set_metrics(self: &mut Rc<Self>, metrics: Arc<MemoryMetrics>) {
        // only callable before any blocks exist
        let this = Rc::get_mut(self).expect("allocator already shared");
        this.metrics = Some(metrics);
    }

    /// Obtains storage of the given size class, reusing a free slab when one
    /// is available.
    pub fn alloc(self: &Rc<Self>, class: usize) -> Rc<BlockData> {
        assert!(class <= MAX_SIZE_CLASS);

        let size = class_to_size(class);

        let buf = match self.classes.borrow_mut()[class].free.pop() {
            Some(buf) => buf,
            None => vec![0; size].into_boxed_slice(),
        };

        self.account_alloc(size);

        Rc::new(BlockData {
            buf: UnsafeCell::new(buf),
            class: Some(class),
            alloc: Rc::clone(self),
        })
    }

    /// Obtains storage for sizes exceeding the largest class. Never pooled.
    pub fn alloc_oversized(self: &Rc<Self>, size: usize) -> Rc<BlockData> {
        assert!(size > class_to_size(MAX_SIZE_CLASS));

        self.account_alloc(size);

        Rc::new(BlockData {
            buf: UnsafeCell::new(vec![0; size].into_boxed_slice()),
            class: None,
            alloc: Rc::clone(self),
        })
    }

    /// Obtains storage of at least `size` bytes, from the classes when
    /// possible and the general allocator otherwise.
    pub fn alloc_for_size(self: &Rc<Self>, size: usize) -> Rc<BlockData> {
        match class_for_size(size) {
            Some(class) => self.alloc(class),
            None => self.alloc_oversized(size),
        }
    }

    fn release(&self, class: Option<usize>, buf: Box<[u8]>) {
        self.account_release(buf.len());

        if let Some(class) = class {
            let mut classes = self.classes.borrow_mut();
            let fl = &mut classes[class];

            if fl.free.len() < fl.retain {
                fl.free.push(buf);
            }
        }
    }

    fn account_alloc(&self, size: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.blocks_in_use.try_inc(1);
            metrics.bytes_in_use.try_inc(size);
        }
    }

    fn account_release(&self, size: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.blocks_in_use.try_dec(1);
            metrics.bytes_in_use.try_dec(size);
        }
    }

    #[cfg(test)]
    fn free_count(&self, class: usize) -> usize {
        self.classes.borrow()[class].free.len()
    }
}
