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

use crate::alloc::{BlockAllocator, BlockData};
use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;

/// Shared ownership of a chain node. The `next` link of a node is the only
/// ownership edge between nodes; a chain is a DAG by construction, never
/// cyclic, so plain reference counting suffices.
pub type BlockRef = Rc<RefCell<ByteBlock>>;

/// One node of a block chain: refcounted backing storage plus this node's
/// own read/write cursors.
///
/// Invariant: `start <= end <= buf_end`. Readable bytes are
/// `[start, end)`; writable space is `[end, buf_end)`. Cloned nodes share
/// the storage bytes but never the cursors.
pub struct ByteBlock {
    data: Rc<BlockData>,
    start: usize,
    end: usize,
    buf_end: usize,
    next: Option<BlockRef>,
}

impl ByteBlock {
    /// Allocates an empty block of the given size class.
    pub fn alloc(alloc: &Rc<BlockAllocator>, class: usize) -> Self {
        let data = alloc.alloc(class);
        let buf_end = data.capacity();

        Self {
            data,
            start: 0,
            end: 0,
            buf_end,
            next: None,
        }
    }

    /// Wraps existing storage, exposing `[offset, offset + len)` as already
    /// readable.
    pub fn from_data(data: Rc<BlockData>, len: usize, offset: usize) -> Self {
        let buf_end = data.capacity();
        assert!(offset + len <= buf_end);

        Self {
            data,
            start: offset,
            end: offset + len,
            buf_end,
            next: None,
        }
    }

    pub fn data(&self) -> &Rc<BlockData> {
        &self.data
    }

    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn write_avail(&self) -> usize {
        self.buf_end - self.end
    }

    /// The readable bytes of this node.
    pub fn bytes(&self) -> &[u8] {
        self.data.slice(self.start, self.end)
    }

    /// Advances the read cursor past bytes already examined.
    pub fn consume(&mut self, n: usize) {
        assert!(self.start + n <= self.end);

        self.start += n;
    }

    /// Advances the write cursor over bytes the producer has already placed
    /// in the writable region.
    pub fn fill(&mut self, n: usize) {
        assert!(self.end + n <= self.buf_end);

        self.end += n;
    }

    /// Copies from `src` into the writable region and fills, returning the
    /// number of bytes taken.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = cmp::min(src.len(), self.write_avail());

        self.data.write_at(self.end, &src[..n]);
        self.end += n;

        n
    }

    /// The writable region, for producers that place bytes directly and
    /// then `fill`. The region `[end, buf_end)` is reachable through this
    /// node alone (clones carry no writable space), so exclusive access to
    /// the node gives exclusive access to the region.
    pub fn write_buf(&mut self) -> &mut [u8] {
        self.data.write_slice(self.end, self.buf_end)
    }

    /// Produces a detached node sharing this node's storage, with identical
    /// read cursors. The clone gets no writable space: only one node may
    /// ever write a given storage's tail.
    pub fn clone_block(&self) -> Self {
        Self {
            data: Rc::clone(&self.data),
            start: self.start,
            end: self.end,
            buf_end: self.end,
            next: None,
        }
    }

    /// Keeps only the first `len` readable bytes and freezes the block
    /// read-only. Used when trimming clones to a sub-range.
    pub fn trim_to(&mut self, len: usize) {
        assert!(len <= self.read_avail());

        self.end = self.start + len;
        self.buf_end = self.end;
    }

    pub fn next(&self) -> Option<&BlockRef> {
        self.next.as_ref()
    }

    pub fn set_next(&mut self, next: Option<BlockRef>) {
        self.next = next;
    }

    pub fn take_next(&mut self) -> Option<BlockRef> {
        self.next.take()
    }
}

impl Drop for ByteBlock {
    fn drop(&mut self) {
        // tear the chain down iteratively. each solely-owned successor is
        // unwrapped and freed; the walk stops at the first node something
        // else still references
        let mut next = self.next.take();

        while let Some(node) = next {
            match Rc::try_unwrap(node) {
                Ok(cell) => {
                    let mut block = cell.into_inner();
                    next = block.next.take();
                }
                Err(_) => break,
            }
        }
    }
}

/// Produces a detached chain covering `[offset, offset + len)` of the chain
/// starting at `src`, by structural cloning. No payload bytes are copied.
pub fn chain_clone(src: &BlockRef, offset: usize, len: usize) -> Option<BlockRef> {
    let mut head: Option<BlockRef> = None;
    let mut tail: Option<BlockRef> = None;

    let mut cur = Some(Rc::clone(src));
    let mut offset = offset;
    let mut len = len;

    while let Some(node) = cur {
        if len == 0 {
            break;
        }

        let node = node.borrow();
        let avail = node.read_avail();

        if avail <= offset {
            offset -= avail;
            cur = node.next.clone();
            continue;
        }

        let bytes = cmp::min(len, avail - offset);

        let mut clone = node.clone_block();
        clone.consume(offset);
        clone.trim_to(bytes);
        offset = 0;
        len -= bytes;

        let clone = Rc::new(RefCell::new(clone));

        match tail.take() {
            Some(t) => {
                t.borrow_mut().next = Some(Rc::clone(&clone));
                tail = Some(clone);
            }
            None => {
                head = Some(Rc::clone(&clone));
                tail = Some(clone);
            }
        }

        cur = node.next.clone();
    }

    head
}

/// A logical byte stream built from linked blocks, with append at the tail
/// and consume from the front. Unlike `MultiReaderBuffer`, a chain owns its
/// nodes' read cursors outright; it has no independent readers.
#[derive(Default)]
pub struct BlockChain {
    head: Option<BlockRef>,
    tail: Option<BlockRef>,
    len: usize,
}

impl BlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<&BlockRef> {
        self.head.as_ref()
    }

    /// Links a block (or a pre-linked run of blocks) at the tail. The run's
    /// currently readable bytes are counted into the stream length.
    pub fn append(&mut self, block: BlockRef) {
        match self.tail.take() {
            Some(t) => {
                t.borrow_mut().next = Some(Rc::clone(&block));
            }
            None => {
                self.head = Some(Rc::clone(&block));
            }
        }

        // the appended block may carry successors
        let mut tail = block;
        loop {
            let (avail, next) = {
                let b = tail.borrow();
                (b.read_avail(), b.next.clone())
            };

            self.len += avail;

            match next {
                Some(n) => tail = n,
                None => break,
            }
        }

        self.tail = Some(tail);
    }

    /// Structurally clones `[offset, offset + len)` of the chain starting at
    /// `src` onto the tail. Returns the number of bytes linked in; payload
    /// bytes are never copied.
    pub fn write_blocks(&mut self, src: &BlockRef, len: usize, offset: usize) -> usize {
        let mut written = 0;

        let mut cur = Some(Rc::clone(src));
        let mut offset = offset;
        let mut remaining = len;

        while let Some(node) = cur {
            if remaining == 0 {
                break;
            }

            let node = node.borrow();
            let avail = node.read_avail();

            if avail <= offset {
                offset -= avail;
                cur = node.next.clone();
                continue;
            }

            let bytes = cmp::min(remaining, avail - offset);

            let mut clone = node.clone_block();
            clone.consume(offset);
            clone.trim_to(bytes);
            offset = 0;

            self.append(Rc::new(RefCell::new(clone)));

            written += bytes;
            remaining -= bytes;
            cur = node.next.clone();
        }

        written
    }

    /// Wraps raw storage directly into the chain, exposing
    /// `[offset, offset + len)` as readable.
    pub fn write_data(&mut self, data: Rc<BlockData>, len: usize, offset: usize) -> usize {
        let block = ByteBlock::from_data(data, len, offset);
        let added = block.read_avail();

        self.append(Rc::new(RefCell::new(block)));

        added
    }

    /// Discards up to `size` bytes from the front, unlinking nodes that are
    /// fully consumed. Returns the number of bytes discarded.
    pub fn consume(&mut self, size: usize) -> usize {
        let mut size = cmp::min(size, self.len);
        let mut consumed = 0;

        while size > 0 {
            let head = match &self.head {
                Some(head) => Rc::clone(head),
                None => break,
            };

            let mut head = head.borrow_mut();
            let bytes = head.read_avail();

            if bytes == 0 {
                // a zero-length node ahead of content; unlink it
                let next = head.next.clone();
                drop(head);
                self.head = next;
                continue;
            }

            if size >= bytes {
                let next = head.next.clone();
                drop(head);
                self.head = next;
                consumed += bytes;
                size -= bytes;
            } else {
                head.consume(size);
                consumed += size;
                size = 0;
            }
        }

        self.len -= consumed;

        if self.head.is_none() || self.len == 0 {
            self.head = None;
            self.tail = None;
            self.len = 0;
        }

        consumed
    }

    /// Copies readable bytes out to `dst`, consuming them. Returns the
    /// number of bytes copied. This is the one escape hatch where payload
    /// bytes leave the chain-backed world.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut pos = 0;

        while pos < dst.len() {
            let head = match &self.head {
                Some(head) => Rc::clone(head),
                None => break,
            };

            let n = {
                let head = head.borrow();
                let bytes = head.bytes();

                if bytes.is_empty() {
                    // a zero-length node ahead of content; unlink it
                    let next = head.next.clone();
                    drop(head);
                    self.head = next;

                    if self.head.is_none() {
                        self.tail = None;
                        break;
                    }

                    continue;
                }

                let n = cmp::min(bytes.len(), dst.len() - pos);
                dst[pos..(pos + n)].copy_from_slice(&bytes[..n]);

                n
            };

            self.consume(n);
            pos += n;
        }

        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with(alloc: &Rc<BlockAllocator>, parts: &[&[u8]]) -> BlockChain {
        let mut chain = BlockChain::new();

        for part in parts {
            let mut block = ByteBlock::alloc(alloc, 0);
            assert_eq!(block.write(part), part.len());
            chain.append(Rc::new(RefCell::new(block)));
        }

        chain
    }

    #[test]
    fn block_cursors() {
        let alloc = BlockAllocator::new();
        let mut b = ByteBlock::alloc(&alloc, 0);

        assert_eq!(b.read_avail(), 0);
        assert_eq!(b.write_avail(), 128);

        assert_eq!(b.write(b"hello"), 5);
        assert_eq!(b.read_avail(), 5);
        assert_eq!(b.write_avail(), 123);
        assert_eq!(b.bytes(), b"hello");

        b.consume(2);
        assert_eq!(b.bytes(), b"llo");
    }

    #[test]
    #[should_panic]
    fn block_consume_past_end() {
        let alloc = BlockAllocator::new();
        let mut b = ByteBlock::alloc(&alloc, 0);

        b.write(b"ab");
        b.consume(3);
    }

    #[test]
    fn clone_independence() {
        let alloc = BlockAllocator::new();
        let mut orig = ByteBlock::alloc(&alloc, 0);
        orig.write(b"abcdef");

        let mut clone = orig.clone_block();

        orig.consume(4);
        assert_eq!(orig.bytes(), b"ef");
        assert_eq!(clone.bytes(), b"abcdef");

        clone.consume(2);
        assert_eq!(clone.bytes(), b"cdef");
        assert_eq!(orig.bytes(), b"ef");

        // clones share storage, not cursors
        assert_eq!(clone.write_avail(), 0);
    }

    #[test]
    fn clone_sees_later_fills_of_shared_storage() {
        let alloc = BlockAllocator::new();
        let mut orig = ByteBlock::alloc(&alloc, 0);
        orig.write(b"abc");

        let clone = orig.clone_block();

        // the original keeps writing into the shared storage beyond the
        // clone's frozen end cursor
        orig.write(b"def");

        assert_eq!(orig.bytes(), b"abcdef");
        assert_eq!(clone.bytes(), b"abc");
    }

    #[test]
    fn chain_append_consume_round_trip() {
        let alloc = BlockAllocator::new();
        let mut chain = chain_with(&alloc, &[b"hello ", b"chained ", b"world"]);

        assert_eq!(chain.len(), 19);

        let mut out = [0; 32];
        let n = chain.read(&mut out);
        assert_eq!(&out[..n], b"hello chained world");
        assert_eq!(chain.len(), 0);
        assert!(chain.is_empty());
    }

    #[test]
    fn chain_partial_consume() {
        let alloc = BlockAllocator::new();
        let mut chain = chain_with(&alloc, &[b"abcd", b"efgh"]);

        assert_eq!(chain.consume(6), 6);
        assert_eq!(chain.len(), 2);

        let mut out = [0; 8];
        let n = chain.read(&mut out);
        assert_eq!(&out[..n], b"gh");

        // consuming an empty chain is a no-op
        assert_eq!(chain.consume(1), 0);
    }

    #[test]
    fn chain_clone_subrange() {
        let alloc = BlockAllocator::new();
        let chain = chain_with(&alloc, &[b"abcd", b"efgh", b"ijkl"]);

        let head = chain.head().unwrap();

        // a sub-range crossing two block boundaries
        let cloned = chain_clone(head, 2, 8).unwrap();

        let mut sub = BlockChain::new();
        sub.append(cloned);
        assert_eq!(sub.len(), 8);

        let mut out = [0; 16];
        let n = sub.read(&mut out);
        assert_eq!(&out[..n], b"cdefghij");

        // the source is untouched
        let mut src = chain;
        let mut out = [0; 16];
        let n = src.read(&mut out);
        assert_eq!(&out[..n], b"abcdefghijkl");
    }

    #[test]
    fn chain_clone_offset_past_end() {
        let alloc = BlockAllocator::new();
        let chain = chain_with(&alloc, &[b"abcd"]);

        assert!(chain_clone(chain.head().unwrap(), 4, 4).is_none());
    }

    #[test]
    fn write_blocks_is_zero_copy_and_non_destructive() {
        let alloc = BlockAllocator::new();
        let mut src = chain_with(&alloc, &[b"abcd", b"efgh"]);

        let mut dst = BlockChain::new();
        let n = dst.write_blocks(src.head().unwrap(), 5, 1);
        assert_eq!(n, 5);
        assert_eq!(dst.len(), 5);

        let mut out = [0; 8];
        let n = dst.read(&mut out);
        assert_eq!(&out[..n], b"bcdef");

        let mut out = [0; 8];
        let n = src.read(&mut out);
        assert_eq!(&out[..n], b"abcdefgh");
    }

    #[test]
    fn chain_drains_past_empty_blocks() {
        let alloc = BlockAllocator::new();
        let mut chain = chain_with(&alloc, &[b"abcd"]);

        // an unwritten block linked ahead of more content
        chain.append(Rc::new(RefCell::new(ByteBlock::alloc(&alloc, 0))));

        let mut block = ByteBlock::alloc(&alloc, 0);
        block.write(b"efgh");
        chain.append(Rc::new(RefCell::new(block)));

        assert_eq!(chain.len(), 8);
        assert_eq!(chain.consume(6), 6);
        assert_eq!(chain.len(), 2);

        let mut out = [0; 8];
        let n = chain.read(&mut out);
        assert_eq!(&out[..n], b"gh");
        assert!(chain.is_empty());

        // a chain reduced to only empty nodes reads as drained
        let mut chain = BlockChain::new();
        chain.append(Rc::new(RefCell::new(ByteBlock::alloc(&alloc, 0))));
        assert_eq!(chain.read(&mut out), 0);
        assert!(chain.is_empty());
    }

    #[test]
    fn write_data_wraps_storage() {
        let alloc = BlockAllocator::new();
        let data = alloc.alloc(0);
        data.write_at(0, b"xyz123");

        let mut chain = BlockChain::new();
        assert_eq!(chain.write_data(data, 3, 3), 3);

        let mut out = [0; 8];
        let n = chain.read(&mut out);
        assert_eq!(&out[..n], b"123");
    }

    #[test]
    fn long_chain_drop_is_iterative() {
        let alloc = BlockAllocator::new();
        let mut chain = BlockChain::new();

        for _ in 0..50_000 {
            let mut block = ByteBlock::alloc(&alloc, 0);
            block.write(b"x");
            chain.append(Rc::new(RefCell::new(block)));
        }

        // would blow the stack if teardown recursed
        drop(chain);
    }
}
