//! Where compressed bytes are read from.

use std::io::Read;

/// Random access to the bytes of a compressed blob.
pub trait ByteSource {
    /// Returns the byte at `index`, or `None` if the source ends before it.
    fn byte_at(&self, index: usize) -> Option<u8>;
}

impl ByteSource for [u8] {
    fn byte_at(&self, index: usize) -> Option<u8> {
        self.get(index).copied()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &S {
    fn byte_at(&self, index: usize) -> Option<u8> {
        (**self).byte_at(index)
    }
}

/// A blob the game gave us as a bare pointer. The game never says how long its blobs are, so
/// every read is trusted.
#[derive(Clone, Copy)]
pub struct RawSource {
    ptr: *const u8,
}

impl RawSource {
    /// # Safety
    /// Every byte the decoder asks for must be readable, which holds for any well-formed blob.
    pub unsafe fn new(ptr: *const u8) -> RawSource {
        RawSource { ptr }
    }
}

impl ByteSource for RawSource {
    fn byte_at(&self, index: usize) -> Option<u8> {
        Some(unsafe { self.ptr.add(index).read() })
    }
}

/// The part of `S` that starts at `start`.
pub struct Offset<S> {
    inner: S,
    start: usize,
}

impl<S: ByteSource> Offset<S> {
    pub fn new(inner: S, start: usize) -> Offset<S> {
        Offset { inner, start }
    }
}

impl<S: ByteSource> ByteSource for Offset<S> {
    fn byte_at(&self, index: usize) -> Option<u8> {
        self.inner.byte_at(self.start.checked_add(index)?)
    }
}

/// Reads a source sequentially, so that fixed-layout data can be parsed with `byteorder`.
pub struct SourceReader<S> {
    source: S,
    position: usize,
}

impl<S: ByteSource> SourceReader<S> {
    pub fn new(source: S) -> SourceReader<S> {
        SourceReader {
            source,
            position: 0,
        }
    }

    /// How many bytes have been read so far.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<S: ByteSource> Read for SourceReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut count = 0;

        for slot in buf.iter_mut() {
            match self.source.byte_at(self.position) {
                Some(byte) => *slot = byte,
                None => break,
            }

            self.position += 1;
            count += 1;
        }

        Ok(count)
    }
}
