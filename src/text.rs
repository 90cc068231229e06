//! Decompression of the game's compressed text blobs.
//!
//! A blob is laid out as follows (all little-endian):
//!
//! | Offset            | Size           | Contents                                      |
//! |-------------------|----------------|-----------------------------------------------|
//! | 0                 | 2              | number of code table entries, `n`             |
//! | 2                 | 4              | size of the decompressed data                 |
//! | 6                 | 6 × `n`        | code table (see `CodeTableEntry`)             |
//! | 6 + 6 × `n`       | rest           | bitstream, most significant bit first         |
//!
//! The game hands us blobs as bare pointers with no length, so their contents are trusted. A
//! blob that doesn't describe a proper prefix code decodes to garbage.

use std::io::Read;

use byteorder::{ReadBytesExt, LE};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use crate::memory::{AllocError, HostAllocator, HostBuffer, HostHeap, SystemHeap};

pub mod cursor;
pub mod source;
pub mod tree;

use cursor::DecodeSession;
use source::{ByteSource, Offset, RawSource, SourceReader};
use tree::{CodeTableEntry, Trie};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("compressed data ends at offset {offset}")]
    Truncated { offset: usize },

    #[error("code table entry {index} has depth {depth}, which is more than 32 bits")]
    DepthTooLarge { index: usize, depth: u8 },

    #[error("no memory for output: {0}")]
    Alloc(#[from] AllocError),
}

/// The fixed-size start of a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeHeader {
    pub num_entries: u16,
    pub uncompressed_size: u32,
}

impl DecodeHeader {
    /// Size of the header in the blob.
    pub const SIZE: usize = 6;

    pub fn read(reader: &mut impl Read) -> std::io::Result<DecodeHeader> {
        let num_entries = reader.read_u16::<LE>()?;
        let uncompressed_size = reader.read_u32::<LE>()?;

        Ok(DecodeHeader {
            num_entries,
            uncompressed_size,
        })
    }

    pub fn entry_table_size(&self) -> usize {
        CodeTableEntry::SIZE * self.num_entries as usize
    }

    /// Offset of the bitstream from the start of the blob.
    pub fn data_start(&self) -> usize {
        DecodeHeader::SIZE + self.entry_table_size()
    }
}

/// Held for the whole of every decompression, matching the game's own locking.
static DECODE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Decompresses the blob in `source` into a buffer allocated from `heap`. The decode tree is
/// built on the same heap and freed before returning.
pub fn decompress_in<A, S>(heap: A, source: S) -> Result<HostBuffer<A>, DecodeError>
where
    A: HostAllocator + Clone,
    S: ByteSource,
{
    let _guard = DECODE_LOCK.lock();

    let mut reader = SourceReader::new(&source);
    let truncated = |reader: &SourceReader<_>| DecodeError::Truncated {
        offset: reader.position(),
    };

    let header = DecodeHeader::read(&mut reader).map_err(|_| truncated(&reader))?;

    log::debug!(
        "decompressing {} bytes with a {}-entry code table",
        header.uncompressed_size,
        header.num_entries
    );

    let mut trie = Trie::new(heap.clone())?;

    for index in 0..header.num_entries as usize {
        let entry = CodeTableEntry::read(&mut reader).map_err(|_| truncated(&reader))?;
        trie.insert(index, &entry)?;
    }
    let mut output = HostBuffer::zeroed(heap, header.uncompressed_size as usize)?;

    let stream = Offset::new(&source, header.data_start());
    let mut session = DecodeSession::new(&trie);

    for slot in output.iter_mut() {
        *slot = session.next_symbol(&stream)?;
    }

    Ok(output)
}

/// Decompresses `blob` into a buffer on the C heap.
pub fn decompress(blob: &[u8]) -> Result<HostBuffer<SystemHeap>, DecodeError> {
    decompress_in(SystemHeap, blob)
}

/// Decompresses the blob at `buf` into a buffer from `heap`, writing the decompressed size to
/// `out_total_size`. Returns null on failure.
///
/// # Safety
/// `buf` must point to a well-formed blob, and `out_total_size` must be null or writable.
unsafe fn decompress_raw<A: HostAllocator + Clone>(
    heap: A,
    buf: *const u8,
    out_total_size: *mut u32,
) -> *mut u8 {
    let source = RawSource::new(buf);

    // The game reads the size even when decompression fails, so it's written first.
    if !out_total_size.is_null() {
        if let Ok(header) = DecodeHeader::read(&mut SourceReader::new(source)) {
            out_total_size.write(header.uncompressed_size);
        }
    }

    match decompress_in(heap, source) {
        Ok(output) => output.into_raw(),

        Err(err) => {
            log::error!("Failed to decompress text at {:p}: {err}", buf);
            std::ptr::null_mut()
        }
    }
}

/// Replaces the game's text decompression function. The returned buffer belongs to the game,
/// which frees it with its own heap.
///
/// # Safety
/// Only the game calls this, with a pointer to one of its text blobs.
pub unsafe extern "C" fn decompress_text(buf: *const u8, out_total_size: *mut u32) -> *mut u8 {
    // Game code that still takes the game's mutex has to stay serialised with us.
    #[cfg(windows)]
    let _host_guard =
        crate::interop::globals::HostMutexGuard::acquire(&crate::interop::globals::DECODE_MUTEX);

    decompress_raw(HostHeap, buf, out_total_size)
}
