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

use crate::alloc::BlockAllocator;
use crate::block::{chain_clone, BlockChain, BlockRef, ByteBlock};
use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;

// bounded fan-out: origin read, cache write, client write, and spares
pub const MAX_CURSORS: usize = 5;

#[derive(Default)]
struct CursorState {
    in_use: bool,
    block: Option<BlockRef>,
    start_offset: usize,
    size_limit: Option<usize>,
}

struct Inner {
    writer: Option<BlockRef>,
    size_class: usize,
    water_mark: usize,
    alloc: Rc<BlockAllocator>,
    cursors: [CursorState; MAX_CURSORS],
}

impl Inner {
    fn block_size(&self) -> usize {
        crate::alloc::class_to_size(self.size_class)
    }

    // point cursors that predate the first block at the new chain head
    fn init_cursors(&mut self) {
        let writer = match &self.writer {
            Some(writer) => Rc::clone(writer),
            None => return,
        };

        for c in self.cursors.iter_mut() {
            if c.in_use && c.block.is_none() {
                c.block = Some(Rc::clone(&writer));
            }
        }
    }

    // Links `block` (possibly a pre-linked run) after the current writer and
    // advances the writer to the last node of the run carrying content, or
    // onto empty follow-on space. Content already linked after the writer is
    // never dropped; the writer may only bypass it.
    fn append_block_internal(&mut self, block: BlockRef) {
        match &self.writer {
            None => {
                self.writer = Some(block);
                self.init_cursors();
            }
            Some(writer) => {
                let writer = Rc::clone(writer);

                {
                    let mut w = writer.borrow_mut();

                    if let Some(next) = w.next() {
                        assert_eq!(next.borrow().read_avail(), 0);
                    }

                    w.set_next(Some(Rc::clone(&block)));
                }

                let mut cur = block;
                loop {
                    let (avail, next) = {
                        let c = cur.borrow();
                        (c.read_avail(), c.next().cloned())
                    };

                    if avail == 0 {
                        break;
                    }

                    self.writer = Some(Rc::clone(&cur));

                    match next {
                        Some(next) => cur = next,
                        None => break,
                    }
                }
            }
        }

        // a full writer followed by content is not a write target
        loop {
            let writer = Rc::clone(self.writer.as_ref().unwrap());
            let (write_avail, next) = {
                let w = writer.borrow();
                (w.write_avail(), w.next().cloned())
            };

            if write_avail > 0 {
                break;
            }

            match next {
                Some(next) if next.borrow().read_avail() > 0 => self.writer = Some(next),
                _ => break,
            }
        }
    }

    fn append_new_block(&mut self) {
        let block = ByteBlock::alloc(&self.alloc, self.size_class);

        self.append_block_internal(Rc::new(RefCell::new(block)));
    }

    fn add_block(&mut self) {
        let needs_block = match &self.writer {
            None => true,
            Some(writer) => writer.borrow().next().is_none(),
        };

        if needs_block {
            self.append_new_block();
        }
    }

    fn current_write_avail(&self) -> usize {
        let mut t = 0;
        let mut cur = self.writer.clone();

        while let Some(block) = cur {
            let block = block.borrow();
            t += block.write_avail();
            cur = block.next().cloned();
        }

        t
    }

    fn max_read_avail(&self) -> usize {
        let mut max = 0;
        let mut found = false;

        for (slot, c) in self.cursors.iter().enumerate() {
            if c.in_use {
                max = cmp::max(max, self.cursor_read_avail(slot));
                found = true;
            }
        }

        if !found {
            if let Some(writer) = &self.writer {
                return writer.borrow().read_avail();
            }
        }

        max
    }

    fn is_max_read_avail_more_than(&self, size: usize) -> bool {
        let mut found = false;

        for (slot, c) in self.cursors.iter().enumerate() {
            if c.in_use {
                if self.cursor_is_read_avail_more_than(slot, size) {
                    return true;
                }

                found = true;
            }
        }

        if !found {
            if let Some(writer) = &self.writer {
                return writer.borrow().read_avail() > size;
            }
        }

        false
    }

    fn high_water(&self) -> bool {
        // the mark is inclusive: content at the mark is enough to hold off
        // further allocation. a mark of zero degrades to "any content"
        self.is_max_read_avail_more_than(self.water_mark.saturating_sub(1))
    }

    fn low_water(&self) -> bool {
        self.current_write_avail() <= self.water_mark
    }

    fn check_add_block(&mut self) {
        if !self.high_water() && self.low_water() {
            self.add_block();
        }
    }

    fn cursor_read_avail(&self, slot: usize) -> usize {
        let c = &self.cursors[slot];

        let mut t = 0;
        let mut cur = c.block.clone();

        while let Some(block) = cur {
            let block = block.borrow();
            t += block.read_avail();
            cur = block.next().cloned();
        }

        assert!(t >= c.start_offset);
        t -= c.start_offset;

        if let Some(limit) = c.size_limit {
            t = cmp::min(t, limit);
        }

        t
    }

    fn cursor_is_read_avail_more_than(&self, slot: usize, size: usize) -> bool {
        let c = &self.cursors[slot];

        if let Some(limit) = c.size_limit {
            if limit <= size {
                return false;
            }
        }

        let mut t: i64 = -(c.start_offset as i64);
        let mut cur = c.block.clone();

        while let Some(block) = cur {
            let block = block.borrow();
            t += block.read_avail() as i64;

            if t > size as i64 {
                return true;
            }

            cur = block.next().cloned();
        }

        false
    }

    fn cursor_consume(&mut self, slot: usize, n: usize) {
        assert!(self.cursor_read_avail(slot) >= n);

        let c = &mut self.cursors[slot];

        c.start_offset += n;

        if let Some(limit) = c.size_limit {
            c.size_limit = Some(limit - n);
        }

        let mut block = match &c.block {
            Some(block) => Rc::clone(block),
            None => return,
        };

        loop {
            let (avail, next) = {
                let b = block.borrow();
                (b.read_avail(), b.next().cloned())
            };

            if avail > c.start_offset {
                break;
            }

            match next {
                Some(next) if next.borrow().read_avail() > 0 => {
                    c.start_offset -= avail;
                    c.block = Some(Rc::clone(&next));
                    block = next;
                }
                _ => break,
            }
        }
    }

    // number of readable bytes in the cursor's current block, after
    // normalizing past fully-consumed blocks
    fn cursor_block_read_avail(&mut self, slot: usize) -> usize {
        self.cursor_skip_empty_blocks(slot);

        let c = &self.cursors[slot];

        match &c.block {
            Some(block) => {
                let avail = block.borrow().read_avail();
                let avail = avail.saturating_sub(c.start_offset);

                match c.size_limit {
                    Some(limit) => cmp::min(avail, limit),
                    None => avail,
                }
            }
            None => 0,
        }
    }

    fn cursor_skip_empty_blocks(&mut self, slot: usize) {
        let c = &mut self.cursors[slot];

        let mut block = match &c.block {
            Some(block) => Rc::clone(block),
            None => return,
        };

        loop {
            let (avail, next) = {
                let b = block.borrow();
                (b.read_avail(), b.next().cloned())
            };

            if c.start_offset < avail {
                break;
            }

            match next {
                Some(next) if next.borrow().read_avail() > 0 => {
                    c.start_offset -= avail;
                    c.block = Some(Rc::clone(&next));
                    block = next;
                }
                _ => break,
            }
        }
    }

    fn cursor_read(&mut self, slot: usize, dst: &mut [u8]) -> usize {
        let mut pos = 0;

        loop {
            let avail = self.cursor_block_read_avail(slot);

            if avail == 0 || pos == dst.len() {
                break;
            }

            let n = cmp::min(avail, dst.len() - pos);

            {
                let c = &self.cursors[slot];
                let block = c.block.as_ref().unwrap().borrow();
                let bytes = block.bytes();

                dst[pos..(pos + n)].copy_from_slice(&bytes[c.start_offset..(c.start_offset + n)]);
            }

            self.cursor_consume(slot, n);
            pos += n;
        }

        pos
    }

    // copy out without consuming, starting `offset` bytes past the cursor
    fn cursor_copy_out(&self, slot: usize, dst: &mut [u8], offset: usize) -> usize {
        let c = &self.cursors[slot];

        let mut offset = offset + c.start_offset;
        let mut pos = 0;
        let mut cur = c.block.clone();

        while let Some(block) = cur {
            if pos == dst.len() {
                break;
            }

            let block = block.borrow();
            let avail = block.read_avail();

            if avail <= offset {
                offset -= avail;
                cur = block.next().cloned();
                continue;
            }

            let n = cmp::min(avail - offset, dst.len() - pos);
            let bytes = block.bytes();

            dst[pos..(pos + n)].copy_from_slice(&bytes[offset..(offset + n)]);

            pos += n;
            offset = 0;
            cur = block.next().cloned();
        }

        pos
    }

    // logical offset of the first occurrence of `byte` at or past the
    // cursor position plus `offset`
    fn cursor_memchr(&self, slot: usize, byte: u8, offset: usize) -> Option<usize> {
        let c = &self.cursors[slot];

        let mut offset = offset + c.start_offset;
        let mut base = 0;
        let mut cur = c.block.clone();

        while let Some(block) = cur {
            let block = block.borrow();
            let avail = block.read_avail();

            if avail <= offset {
                base += avail;
                offset -= avail;
                cur = block.next().cloned();
                continue;
            }

            let bytes = &block.bytes()[offset..];

            if let Some(pos) = bytes.iter().position(|&b| b == byte) {
                return Some(base + offset + pos - c.start_offset);
            }

            base += avail;
            offset = 0;
            cur = block.next().cloned();
        }

        None
    }

    fn cursor_block_count(&self, slot: usize) -> usize {
        let mut count = 0;
        let mut cur = self.cursors[slot].block.clone();

        while let Some(block) = cur {
            count += 1;
            cur = block.borrow().next().cloned();
        }

        count
    }
}

/// A writable block-chained buffer readable by several independent cursors.
///
/// All content is shared: cursors see the same chain nodes the writer
/// appends to, each tracking only its own consumption offset. Blocks are
/// freed when the last reference (writer or any cursor) moves past them.
///
/// A buffer and its cursors belong to one execution context; none of this
/// is Send.
pub struct MultiReaderBuffer {
    inner: Rc<RefCell<Inner>>,
}

impl MultiReaderBuffer {
    /// Creates a buffer with one block of the given size class allocated.
    pub fn new(alloc: &Rc<BlockAllocator>, size_class: usize) -> Self {
        let b = Self::new_empty(alloc, size_class);
        b.inner.borrow_mut().append_new_block();

        b
    }

    /// Creates a buffer with no blocks; the first write allocates.
    pub fn new_empty(alloc: &Rc<BlockAllocator>, size_class: usize) -> Self {
        assert!(size_class <= crate::alloc::MAX_SIZE_CLASS);

        Self {
            inner: Rc::new(RefCell::new(Inner {
                writer: None,
                size_class,
                water_mark: 0,
                alloc: Rc::clone(alloc),
                cursors: Default::default(),
            })),
        }
    }

    pub fn set_water_mark(&self, n: usize) {
        self.inner.borrow_mut().water_mark = n;
    }

    pub fn water_mark(&self) -> usize {
        self.inner.borrow().water_mark
    }

    pub fn block_size(&self) -> usize {
        self.inner.borrow().block_size()
    }

    /// Copies raw bytes in, allocating blocks as needed. This is the one
    /// copying write path; chain-to-chain transfer goes through
    /// `write_from`/`write_chain` instead.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        let mut pos = 0;

        while pos < buf.len() {
            if inner.writer.is_none() {
                inner.add_block();
            }

            let writer = Rc::clone(inner.writer.as_ref().unwrap());

            pos += writer.borrow_mut().write(&buf[pos..]);

            if pos < buf.len() {
                let next = writer.borrow().next().cloned();

                match next {
                    Some(next) => inner.writer = Some(next),
                    None => inner.add_block(),
                }
            }
        }

        buf.len()
    }

    /// Structurally clones `[offset, offset + len)` of `src`'s pending
    /// content onto this buffer's chain. No payload bytes are copied, and
    /// `src` is not consumed. Returns the number of bytes linked in.
    pub fn write_from(&self, src: &Cursor, len: usize, offset: usize) -> usize {
        let (block, start_offset) = {
            let inner = src.inner.borrow();
            let c = &inner.cursors[src.slot];

            (c.block.clone(), c.start_offset)
        };

        let head = match block {
            Some(head) => head,
            None => return 0,
        };

        self.write_cloned(&head, len, offset + start_offset)
    }

    /// Like `write_from`, for a standalone chain.
    pub fn write_chain(&self, chain: &BlockChain, len: usize, offset: usize) -> usize {
        let head = match chain.head() {
            Some(head) => Rc::clone(head),
            None => return 0,
        };

        self.write_cloned(&head, cmp::min(len, chain.len()), offset)
    }

    fn write_cloned(&self, head: &BlockRef, len: usize, offset: usize) -> usize {
        let run = match chain_clone(head, offset, len) {
            Some(run) => run,
            None => return 0,
        };

        let mut written = 0;
        {
            let mut cur = Some(Rc::clone(&run));
            while let Some(block) = cur {
                let block = block.borrow();
                written += block.read_avail();
                cur = block.next().cloned();
            }
        }

        self.inner.borrow_mut().append_block_internal(run);

        written
    }

    /// Links an existing block carrying content as the new write target.
    pub fn append_block(&self, block: BlockRef) {
        assert!(block.borrow().read_avail() > 0);

        self.inner.borrow_mut().append_block_internal(block);
    }

    /// Allocates a block of the buffer's size class and makes it the write
    /// target.
    pub fn append_new_block(&self) {
        self.inner.borrow_mut().append_new_block();
    }

    pub fn add_block(&self) {
        self.inner.borrow_mut().add_block();
    }

    /// Allocates ahead of a slow consumer only within the configured water
    /// mark: adds a block when pending content is below the mark and
    /// writable space has dropped to the mark or below.
    pub fn check_add_block(&self) {
        self.inner.borrow_mut().check_add_block();
    }

    /// Runs `f` over the current block's writable region; `f` returns how
    /// many bytes it placed, which are marked filled.
    pub fn write_with<F>(&self, f: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let mut inner = self.inner.borrow_mut();

        if inner.writer.is_none() {
            inner.add_block();
        }

        let writer = Rc::clone(inner.writer.as_ref().unwrap());
        let mut writer = writer.borrow_mut();

        let n = {
            let dst = writer.write_buf();
            let n = f(dst);
            assert!(n <= dst.len());

            n
        };

        writer.fill(n);

        n
    }

    /// Marks `n` bytes, already placed by a producer, as filled, advancing
    /// across pre-allocated blocks as needed.
    pub fn fill(&self, n: usize) {
        let mut inner = self.inner.borrow_mut();
        let mut len = n;

        loop {
            let writer = Rc::clone(inner.writer.as_ref().expect("fill with no block"));
            let avail = writer.borrow().write_avail();

            if avail >= len {
                writer.borrow_mut().fill(len);
                break;
            }

            writer.borrow_mut().fill(avail);
            len -= avail;

            let next = writer.borrow().next().cloned();
            inner.writer = Some(next.expect("fill past allocated space"));
        }
    }

    /// Writable bytes in the current block alone.
    pub fn block_write_avail(&self) -> usize {
        let inner = self.inner.borrow();

        match &inner.writer {
            Some(writer) => writer.borrow().write_avail(),
            None => 0,
        }
    }

    /// Total writable space, adding a block first if the water mark allows.
    pub fn write_avail(&self) -> usize {
        let mut inner = self.inner.borrow_mut();

        inner.check_add_block();
        inner.current_write_avail()
    }

    /// Total writable space across the chain, without allocating.
    pub fn current_write_avail(&self) -> usize {
        self.inner.borrow().current_write_avail()
    }

    /// The largest pending-read amount over all cursors, or the write
    /// block's content when no cursor is allocated.
    pub fn max_read_avail(&self) -> usize {
        self.inner.borrow().max_read_avail()
    }

    pub fn is_max_read_avail_more_than(&self, size: usize) -> bool {
        self.inner.borrow().is_max_read_avail_more_than(size)
    }

    pub fn high_water(&self) -> bool {
        self.inner.borrow().high_water()
    }

    pub fn low_water(&self) -> bool {
        self.inner.borrow().low_water()
    }

    /// Reserves a cursor slot reading from the current front of the chain.
    /// Returns None when all slots are taken.
    pub fn alloc_cursor(&self) -> Option<Cursor> {
        let mut inner = self.inner.borrow_mut();

        let slot = inner.cursors.iter().position(|c| !c.in_use)?;

        let block = inner.writer.clone();

        inner.cursors[slot] = CursorState {
            in_use: true,
            block,
            start_offset: 0,
            size_limit: None,
        };

        Some(Cursor {
            inner: Rc::clone(&self.inner),
            slot,
        })
    }

    /// Reserves a cursor slot positioned identically to `other`.
    pub fn clone_cursor(&self, other: &Cursor) -> Option<Cursor> {
        assert!(Rc::ptr_eq(&self.inner, &other.inner));

        let mut inner = self.inner.borrow_mut();

        let slot = inner.cursors.iter().position(|c| !c.in_use)?;

        let (block, start_offset, size_limit) = {
            let c = &inner.cursors[other.slot];
            (c.block.clone(), c.start_offset, c.size_limit)
        };

        inner.cursors[slot] = CursorState {
            in_use: true,
            block,
            start_offset,
            size_limit,
        };

        Some(Cursor {
            inner: Rc::clone(&self.inner),
            slot,
        })
    }

    #[cfg(test)]
    fn writer_chain_blocks(&self) -> usize {
        let inner = self.inner.borrow();

        let mut count = 0;
        let mut cur = inner.writer.clone();

        while let Some(block) = cur {
            count += 1;
            cur = block.borrow().next().cloned();
        }

        count
    }
}

/// An independent read position over a `MultiReaderBuffer`'s content.
///
/// Dropping a cursor releases its slot. The cursor keeps the shared chain
/// state alive, so it may outlive the buffer handle itself.
pub struct Cursor {
    inner: Rc<RefCell<Inner>>,
    slot: usize,
}

impl Cursor {
    /// Total bytes pending for this cursor, bounded by the size limit when
    /// one is set.
    pub fn read_avail(&self) -> usize {
        self.inner.borrow().cursor_read_avail(self.slot)
    }

    pub fn is_read_avail_more_than(&self, size: usize) -> bool {
        self.inner
            .borrow()
            .cursor_is_read_avail_more_than(self.slot, size)
    }

    /// Readable bytes in the current block alone.
    pub fn block_read_avail(&self) -> usize {
        self.inner.borrow_mut().cursor_block_read_avail(self.slot)
    }

    pub fn block_count(&self) -> usize {
        self.inner.borrow().cursor_block_count(self.slot)
    }

    /// Advances past `n` bytes. Consuming more than `read_avail()` is a
    /// programming error.
    pub fn consume(&self, n: usize) {
        self.inner.borrow_mut().cursor_consume(self.slot, n);
    }

    /// Copies pending bytes into `dst`, consuming them.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.inner.borrow_mut().cursor_read(self.slot, dst)
    }

    /// Copies pending bytes into `dst` without consuming, starting `offset`
    /// bytes past the cursor position.
    pub fn copy_out(&self, dst: &mut [u8], offset: usize) -> usize {
        self.inner.borrow().cursor_copy_out(self.slot, dst, offset)
    }

    /// Finds `byte` at or past the cursor position plus `offset`, returning
    /// its logical offset from the cursor.
    pub fn memchr(&self, byte: u8, offset: usize) -> Option<usize> {
        self.inner.borrow().cursor_memchr(self.slot, byte, offset)
    }

    /// Caps how many bytes this cursor perceives as available, for
    /// multiplexing one buffer across logical sub-streams.
    pub fn set_size_limit(&self, limit: usize) {
        self.inner.borrow_mut().cursors[self.slot].size_limit = Some(limit);
    }

    pub fn clear_size_limit(&self) {
        self.inner.borrow_mut().cursors[self.slot].size_limit = None;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();

        inner.cursors[self.slot] = CursorState::default();
    }
}
