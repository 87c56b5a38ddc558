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

use slab::Slab;
use std::cmp;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const SEGMENT_SIZE_DEFAULT: usize = 8192;

// room for "\r\n" + up to 4 hex digits + "\r\n" ahead of each segment's data
pub const CHUNK_RESERVE: usize = 8;

pub const SEGMENT_SIZE_MIN: usize = 64;
pub const SEGMENT_SIZE_MAX: usize = 0xffff + CHUNK_RESERVE;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pooled: usize,
    pub in_use: usize,
    pub fresh_allocs: usize,
    pub overflow_allocs: usize,
}

// A fixed-size region of bytes handed out by a BufferPool. The first
// CHUNK_RESERVE bytes are kept free so a chunk header can be written in
// place once the segment's length is known
pub struct Segment {
    key: Option<usize>,
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Segment {
    fn new(key: Option<usize>, data: Box<[u8]>) -> Self {
        Self {
            key,
            data,
            start: CHUNK_RESERVE,
            end: CHUNK_RESERVE,
        }
    }

    pub fn key(&self) -> Option<usize> {
        self.key
    }

    // payload capacity, not counting the reserve
    pub fn capacity(&self) -> usize {
        self.data.len() - CHUNK_RESERVE
    }

    pub fn len(&self) -> usize {
        self.end - CHUNK_RESERVE
    }

    pub fn is_empty(&self) -> bool {
        self.end == CHUNK_RESERVE
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.end
    }

    pub fn data(&self) -> &[u8] {
        &self.data[CHUNK_RESERVE..self.end]
    }

    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    pub fn commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.data.len());

        self.end += amount;
    }

    // copies as much of src as fits, returning the amount copied
    pub fn append(&mut self, src: &[u8]) -> usize {
        let dest = self.spare_mut();
        let size = cmp::min(dest.len(), src.len());

        dest[..size].copy_from_slice(&src[..size]);
        self.commit(size);

        size
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = CHUNK_RESERVE + len;
        }
    }

    // writes "\r\n<hex-len>\r\n" right-aligned into the reserve and returns
    // the framed bytes. the reserve holds the header of a payload of at
    // most 0xffff bytes
    pub fn frame_chunk(&mut self) -> &[u8] {
        let len = self.len();
        assert!(len <= 0xffff);

        let mut hex = [0u8; 4];
        let mut digits = 0;
        let mut n = len;

        loop {
            hex[digits] = b"0123456789abcdef"[n & 0xf];
            digits += 1;
            n >>= 4;

            if n == 0 {
                break;
            }
        }

        let header_len = digits + 4;
        self.start = CHUNK_RESERVE - header_len;

        let header = &mut self.data[self.start..CHUNK_RESERVE];
        header[0] = b'\r';
        header[1] = b'\n';

        for i in 0..digits {
            header[2 + i] = hex[digits - 1 - i];
        }

        header[digits + 2] = b'\r';
        header[digits + 3] = b'\n';

        &self.data[self.start..self.end]
    }

    fn reset(&mut self) {
        self.start = CHUNK_RESERVE;
        self.end = CHUNK_RESERVE;
    }
}

// Pool of fixed-size segments. Pooled segments are indexed by a slab key;
// returning a segment puts its storage back under the same key, so a warm
// pool serves requests without allocating
pub struct BufferPool {
    segment_size: usize,
    capacity: usize,
    entries: Mutex<(Slab<()>, Vec<Option<Box<[u8]>>>)>,
    fresh_allocs: AtomicUsize,
    overflow_allocs: AtomicUsize,
}

impl BufferPool {
    pub fn new(segment_size: usize, capacity: usize) -> Self {
        assert!((SEGMENT_SIZE_MIN..=SEGMENT_SIZE_MAX).contains(&segment_size));

        Self {
            segment_size,
            capacity,
            entries: Mutex::new((Slab::with_capacity(capacity), Vec::with_capacity(capacity))),
            fresh_allocs: AtomicUsize::new(0),
            overflow_allocs: AtomicUsize::new(0),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    // payload bytes per segment
    pub fn segment_capacity(&self) -> usize {
        self.segment_size - CHUNK_RESERVE
    }

    // smallest whole number of segment payloads covering size, at least one
    pub fn round_up(&self, size: usize) -> usize {
        let cap = self.segment_capacity();

        cmp::max(size.div_ceil(cap), 1) * cap
    }

    pub fn allocate(&self) -> Segment {
        let mut entries = self.entries.lock().unwrap();
        let (slab, storage) = &mut *entries;

        if slab.len() == self.capacity {
            // past the pool bound. hand out an unpooled segment
            self.overflow_allocs.fetch_add(1, Ordering::Relaxed);

            return Segment::new(None, vec![0; self.segment_size].into_boxed_slice());
        }

        let key = slab.insert(());

        if key == storage.len() {
            storage.push(None);
        }

        let data = match storage[key].take() {
            Some(data) => data,
            None => {
                self.fresh_allocs.fetch_add(1, Ordering::Relaxed);

                vec![0; self.segment_size].into_boxed_slice()
            }
        };

        Segment::new(Some(key), data)
    }

    pub fn free(&self, mut segment: Segment) {
        let key = match segment.key.take() {
            Some(key) => key,
            None => return,
        };

        let mut entries = self.entries.lock().unwrap();
        let (slab, storage) = &mut *entries;

        slab.remove(key);
        storage[key] = Some(segment.data);
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().unwrap();
        let (slab, storage) = &*entries;

        PoolStats {
            pooled: storage.iter().filter(|s| s.is_some()).count(),
            in_use: slab.len(),
            fresh_allocs: self.fresh_allocs.load(Ordering::Relaxed),
            overflow_allocs: self.overflow_allocs.load(Ordering::Relaxed),
        }
    }
}

// Ordered run of segments holding unflushed bytes
#[derive(Default)]
pub struct BufferChain {
    segments: VecDeque<Segment>,
    len: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    // appends src, allocating segments from the pool as needed
    pub fn write(&mut self, pool: &BufferPool, mut src: &[u8]) {
        while !src.is_empty() {
            let tail = match self.segments.back_mut() {
                Some(seg) if seg.remaining() > 0 => seg,
                _ => {
                    self.segments.push_back(pool.allocate());
                    continue;
                }
            };

            let size = tail.append(src);

            self.len += size;
            src = &src[size..];
        }
    }

    pub fn pop_front(&mut self) -> Option<Segment> {
        let seg = self.segments.pop_front()?;
        self.len -= seg.len();

        Some(seg)
    }

    // returns all segments to the pool
    pub fn clear(&mut self, pool: &BufferPool) {
        while let Some(mut seg) = self.segments.pop_front() {
            seg.reset();
            pool.free(seg);
        }

        self.len = 0;
    }
}

// Connection read buffer. Tracks the total number of bytes ever consumed so
// stall detection can tell whether a reader made progress
pub struct ReadBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    position: u64,
}

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            start: 0,
            end: 0,
            position: 0,
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.position = 0;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.end);

        self.start += amount;
        self.position += amount as u64;

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn write_avail(&self) -> usize {
        self.buf.len() - self.end
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() && self.start > 0 {
            self.compact();
        }

        let len = self.buf.len();

        &mut self.buf[self.end..len]
    }

    pub fn write_commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.buf.len());

        self.end += amount;
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end == self.buf.len()
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    // reads once from r into free space. returns Ok(0) on EOF
    pub fn fill_from<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<usize, io::Error> {
        let dest = self.write_buf();

        if dest.is_empty() {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }

        let size = loop {
            match r.read(dest) {
                Ok(size) => break size,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        self.write_commit(size);

        Ok(size)
    }

    // copies buffered bytes into dest
    pub fn take_into(&mut self, dest: &mut [u8]) -> usize {
        let src = self.read_buf();
        let size = cmp::min(src.len(), dest.len());

        dest[..size].copy_from_slice(&src[..size]);
        self.read_commit(size);

        size
    }
}
