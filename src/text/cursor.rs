//! Walks the decode tree over the bitstream, at most one byte per step.

use crate::memory::HostAllocator;

use super::{
    source::ByteSource,
    tree::{NodeId, Trie, TrieNode},
    DecodeError,
};

/// The outcome of a single `DecodeSession::step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A leaf was reached. The session is back at the root.
    Symbol(u8),

    /// The whole byte was used up partway down the tree. The next step carries on from the same
    /// node with the next byte.
    Pending,
}

/// The read position in both the tree and the bitstream. Lives for one decompression.
#[derive(Clone, Copy, Debug)]
pub struct DecodeSession<'t> {
    nodes: &'t [TrieNode],
    node: NodeId,

    /// The next bit to read within the current byte, counted from the most significant bit.
    bit_offset: u8,

    /// The current byte of the bitstream.
    byte_index: usize,
}

impl<'t> DecodeSession<'t> {
    /// Starts at the root, at the first bit of the stream.
    pub fn new<A: HostAllocator>(trie: &'t Trie<A>) -> DecodeSession<'t> {
        DecodeSession {
            nodes: trie.nodes(),
            node: NodeId::ROOT,
            bit_offset: 0,
            byte_index: 0,
        }
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    pub fn byte_index(&self) -> usize {
        self.byte_index
    }

    /// Whether the session is partway down the tree.
    pub fn is_descending(&self) -> bool {
        self.node != NodeId::ROOT
    }

    fn current(&self) -> &'t TrieNode {
        &self.nodes[self.node.index()]
    }

    fn next_byte(&mut self) {
        self.byte_index += 1;
        self.bit_offset = 0;
    }

    fn emit(&mut self) -> Step {
        let byte = self.current().output_byte;
        self.node = NodeId::ROOT;
        Step::Symbol(byte)
    }

    /// Follows bits from the current byte until either a node lacks the child a bit asks for
    /// (that node's symbol is emitted, and the bit is left unread) or the byte runs out.
    pub fn step<S: ByteSource + ?Sized>(&mut self, stream: &S) -> Result<Step, DecodeError> {
        // A leaf has no child for any bit, so it resolves without looking at the stream. This is
        // what lets a one-symbol code decode without consuming anything.
        if self.current().is_leaf() {
            return Ok(self.emit());
        }

        let byte = stream
            .byte_at(self.byte_index)
            .ok_or(DecodeError::Truncated {
                offset: self.byte_index,
            })?;

        let mut missing_child = false;

        while self.bit_offset < 8 {
            let bit = byte & (0x80 >> self.bit_offset) != 0;

            match self.current().child(bit) {
                Some(child) => {
                    self.node = child;
                    self.bit_offset += 1;
                }

                None => {
                    missing_child = true;
                    break;
                }
            }
        }

        if missing_child {
            // A leaf found before the end of the byte leaves the rest of the byte for the next
            // symbol.
            if self.bit_offset == 8 {
                self.next_byte();
            }

            return Ok(self.emit());
        }

        self.next_byte();

        if self.current().is_leaf() {
            // The code ended exactly on the byte boundary.
            Ok(self.emit())
        } else {
            Ok(Step::Pending)
        }
    }

    /// Steps until a symbol comes out.
    pub fn next_symbol<S: ByteSource + ?Sized>(&mut self, stream: &S) -> Result<u8, DecodeError> {
        loop {
            if let Step::Symbol(byte) = self.step(stream)? {
                return Ok(byte);
            }
        }
    }
}
