//! Builds the decode tree from a blob's code table.

use std::io::Read;

use byteorder::{ReadBytesExt, LE};

use super::DecodeError;
use crate::memory::{AllocError, HostAllocator, HostVec};

/// The longest code a table entry can describe.
pub const MAX_DEPTH: u8 = 32;

/// One symbol of the code table, as stored in the blob (6 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeTableEntry {
    /// The code, right-aligned: only the low `depth` bits are used, most significant first.
    pub code_bits: u32,

    /// The byte that the code decodes to.
    pub output_byte: u8,

    /// The length of the code in bits.
    pub depth: u8,
}

impl CodeTableEntry {
    /// Size of an entry in the blob.
    pub const SIZE: usize = 6;

    pub fn read(reader: &mut impl Read) -> std::io::Result<CodeTableEntry> {
        let code_bits = reader.read_u32::<LE>()?;
        let output_byte = reader.read_u8()?;
        let depth = reader.read_u8()?;

        Ok(CodeTableEntry {
            code_bits,
            output_byte,
            depth,
        })
    }

    /// Returns the direction taken at step `step` of this entry's path: `true` for left.
    fn goes_left(&self, step: u8) -> bool {
        self.code_bits & (1u32 << (self.depth - step - 1)) != 0
    }
}

/// Where a node sits in its tree's node array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    fn new(index: usize) -> Result<NodeId, AllocError> {
        u32::try_from(index)
            .map(NodeId)
            .map_err(|_| AllocError::Overflow)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct TrieNode {
    /// Only meaningful for leaves, but every node has one. Internal nodes keep zero unless a
    /// malformed table writes to them.
    pub output_byte: u8,

    /// Taken on a set bit.
    pub left: Option<NodeId>,

    /// Taken on a clear bit.
    pub right: Option<NodeId>,
}

impl TrieNode {
    /// Returns the child for a set (`true`) or clear (`false`) bit.
    pub fn child(&self, bit: bool) -> Option<NodeId> {
        if bit {
            self.left
        } else {
            self.right
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    fn slot(&mut self, bit: bool) -> &mut Option<NodeId> {
        if bit {
            &mut self.left
        } else {
            &mut self.right
        }
    }
}

/// A prefix-code decode tree. Its nodes live in one array on the heap it was built with, and
/// dropping the tree frees that array.
pub struct Trie<A: HostAllocator> {
    nodes: HostVec<TrieNode, A>,
}

impl<A: HostAllocator> Trie<A> {
    /// Creates a tree holding only the root.
    pub fn new(heap: A) -> Result<Trie<A>, DecodeError> {
        let mut nodes = HostVec::new(heap);
        nodes.push(TrieNode::default())?;

        Ok(Trie { nodes })
    }

    /// Builds a tree from entries in table order.
    ///
    /// The table isn't checked for being a valid prefix code. Entries are applied one after the
    /// other, so a bad table gives a wrong but deterministic tree. The only thing rejected is a
    /// depth with more bits than `code_bits` holds.
    pub fn build(
        heap: A,
        entries: impl IntoIterator<Item = CodeTableEntry>,
    ) -> Result<Trie<A>, DecodeError> {
        let mut trie = Trie::new(heap)?;

        for (index, entry) in entries.into_iter().enumerate() {
            trie.insert(index, &entry)?;
        }

        Ok(trie)
    }

    /// Adds the path for `entry`, which is entry number `index` of the table.
    pub fn insert(&mut self, index: usize, entry: &CodeTableEntry) -> Result<(), DecodeError> {
        if entry.depth > MAX_DEPTH {
            return Err(DecodeError::DepthTooLarge {
                index,
                depth: entry.depth,
            });
        }

        // A depth of zero leaves us at the root: a one-symbol code.
        let mut node = NodeId::ROOT;

        for step in 0..entry.depth {
            node = self.child_or_insert(node, entry.goes_left(step))?;
        }

        self.nodes[node.index()].output_byte = entry.output_byte;

        Ok(())
    }

    fn child_or_insert(&mut self, parent: NodeId, bit: bool) -> Result<NodeId, DecodeError> {
        if let Some(child) = self.nodes[parent.index()].child(bit) {
            return Ok(child);
        }

        let child = NodeId::new(self.nodes.push(TrieNode::default())?)?;
        *self.nodes[parent.index()].slot(bit) = Some(child);

        Ok(child)
    }

    pub fn root(&self) -> &TrieNode {
        self.node(NodeId::ROOT)
    }

    pub fn node(&self, id: NodeId) -> &TrieNode {
        &self.nodes[id.index()]
    }

    /// Every node, indexed by `NodeId`.
    pub fn nodes(&self) -> &[TrieNode] {
        &self.nodes
    }

    /// Counts the nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<A: HostAllocator> std::fmt::Debug for Trie<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie").field("nodes", &self.nodes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{tests::CountingHeap, SystemHeap};

    fn entry(code_bits: u32, depth: u8, output_byte: u8) -> CodeTableEntry {
        CodeTableEntry {
            code_bits,
            output_byte,
            depth,
        }
    }

    /// Follows `bits` from the root.
    fn walk<'t, A: HostAllocator>(trie: &'t Trie<A>, bits: &[bool]) -> Option<&'t TrieNode> {
        let mut node = trie.root();

        for &bit in bits {
            node = trie.node(node.child(bit)?);
        }

        Some(node)
    }

    #[test]
    fn entry_layout_is_code_then_byte_then_depth() {
        let bytes = [0x05, 0x00, 0x00, 0x00, b'x', 3];
        let parsed = CodeTableEntry::read(&mut &bytes[..]).unwrap();

        assert_eq!(parsed, entry(0b101, 3, b'x'));
    }

    #[test]
    fn set_bits_go_left_most_significant_first() {
        // 0b10: left, then right.
        let trie = Trie::build(SystemHeap, [entry(0b10, 2, b'a')]).unwrap();

        let leaf = walk(&trie, &[true, false]).unwrap();

        assert_eq!(leaf.output_byte, b'a');
        assert!(leaf.is_leaf());
        assert!(trie.root().right.is_none());
        assert_eq!(trie.node_count(), 3);
    }

    #[test]
    fn shared_prefixes_share_nodes() {
        let trie = Trie::build(
            SystemHeap,
            [
                entry(0b0, 1, b'a'),
                entry(0b10, 2, b'b'),
                entry(0b11, 2, b'c'),
            ],
        )
        .unwrap();

        assert_eq!(trie.node_count(), 5);

        assert_eq!(walk(&trie, &[true, false]).unwrap().output_byte, b'b');
        assert_eq!(walk(&trie, &[true, true]).unwrap().output_byte, b'c');
        assert_eq!(walk(&trie, &[false]).unwrap().output_byte, b'a');
    }

    #[test]
    fn zero_depth_assigns_root() {
        let trie = Trie::build(SystemHeap, [entry(0xffff_ffff, 0, b'z')]).unwrap();

        assert_eq!(trie.root().output_byte, b'z');
        assert!(trie.root().is_leaf());
    }

    #[test]
    fn full_width_code_is_accepted() {
        let trie = Trie::build(SystemHeap, [entry(0x8000_0001, 32, b'q')]).unwrap();
        assert_eq!(trie.node_count(), 33);
    }

    #[test]
    fn depth_beyond_code_width_is_rejected() {
        let result = Trie::build(SystemHeap, [entry(0, 1, b'a'), entry(0, 33, b'b')]);

        assert!(matches!(
            result,
            Err(DecodeError::DepthTooLarge {
                index: 1,
                depth: 33
            })
        ));
    }

    #[test]
    fn later_entries_overwrite_earlier_ones() {
        let trie = Trie::build(SystemHeap, [entry(0b1, 1, b'a'), entry(0b1, 1, b'b')]).unwrap();
        assert_eq!(walk(&trie, &[true]).unwrap().output_byte, b'b');
    }

    #[test]
    fn nodes_live_on_the_given_heap_and_are_freed() {
        let heap = CountingHeap::default();

        // Eight 32-bit codes sharing their first 29 bits. 44 nodes makes the array grow twice.
        let table: Vec<_> = (0..8u32).map(|i| entry(i, 32, i as u8)).collect();
        let trie = Trie::build(&heap, table).unwrap();

        assert_eq!(trie.node_count(), 1 + 29 + 14);
        assert!(heap.allocs.load(std::sync::atomic::Ordering::SeqCst) > 1);
        assert_eq!(heap.outstanding(), 1);

        drop(trie);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn failed_build_frees_its_nodes() {
        let heap = CountingHeap::default();
        let table = [entry(0xABCD, 16, b'a'), entry(0, 33, b'b')];

        assert!(Trie::build(&heap, table).is_err());
        assert!(heap.allocs.load(std::sync::atomic::Ordering::SeqCst) > 0);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn no_memory_for_root_is_an_error() {
        let heap = CountingHeap {
            fail: true,
            ..Default::default()
        };

        assert!(matches!(
            Trie::new(&heap),
            Err(DecodeError::Alloc(AllocError::Exhausted { .. }))
        ));
    }
}
