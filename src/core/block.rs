//! Paged KV cache blocks.
//!
//! Cache memory is carved into fixed-size blocks of token slots. Each
//! sequence owns a [`BlockTable`] that maps its logical positions onto
//! physical blocks, the way a page table maps virtual pages to frames.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Token slots per block unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Hash one block of tokens, chained onto the hash of the block before it.
///
/// Two blocks only hash equal when their own tokens and every token before
/// them agree, which is what makes the hash usable as a prefix key.
///
/// ```
/// use nano_vllm_sched::core::block::hash_token_block;
///
/// let first = hash_token_block(&[1, 2, 3, 4], None);
/// let second = hash_token_block(&[5, 6, 7, 8], Some(first));
///
/// assert_ne!(second, hash_token_block(&[5, 6, 7, 8], None));
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent_hash.hash(&mut hasher);
    token_ids.hash(&mut hasher);
    hasher.finish()
}

/// Blocks required to hold `num_tokens` slots.
///
/// ```
/// use nano_vllm_sched::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(33, 16), 3);
/// ```
pub fn compute_num_blocks(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

/// A physical KV cache block.
///
/// A block with a reference count of zero sits on the free list. It may
/// still carry the hash and contents of the prefix it last held, in which
/// case it can be revived by a sequence with the same prefix until the
/// block is handed out for fresh tokens.
#[derive(Debug, Clone)]
pub struct Block {
    id: usize,
    refs: usize,
    /// Chained hash of the tokens stored in this block, once computed.
    hash: Option<u64>,
    /// Tokens behind `hash`, compared on lookup to rule out collisions.
    tokens: Vec<u32>,
}

impl Block {
    /// A free, empty block.
    pub fn new(block_id: usize) -> Self {
        Self {
            id: block_id,
            refs: 0,
            hash: None,
            tokens: Vec::new(),
        }
    }

    pub fn block_id(&self) -> usize {
        self.id
    }

    /// Number of block tables holding this block.
    pub fn ref_count(&self) -> usize {
        self.refs
    }

    pub fn is_free(&self) -> bool {
        self.refs == 0
    }

    /// Prefix key of the computed contents, if any.
    pub fn prefix_hash(&self) -> Option<u64> {
        self.hash
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.tokens
    }

    /// Record the computed contents of this block.
    pub fn set_prefix(&mut self, hash: u64, token_ids: &[u32]) {
        self.hash = Some(hash);
        self.tokens.clear();
        self.tokens.extend_from_slice(token_ids);
    }

    /// Hand the block out for fresh tokens: one owner, no cached prefix.
    pub fn reset(&mut self) {
        self.refs = 1;
        self.hash = None;
        self.tokens.clear();
    }

    pub fn increment_ref(&mut self) {
        self.refs += 1;
    }

    /// Drop one owner and return how many remain.
    pub fn decrement_ref(&mut self) -> usize {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }
}

/// Logical-to-physical block mapping of one sequence.
///
/// Position `p` is stored in slot `p % block_size` of physical block
/// `block_ids[p / block_size]`.
///
/// ```
/// use nano_vllm_sched::core::block::BlockTable;
///
/// let mut table = BlockTable::new(4);
/// table.append_block(9);
/// table.append_block(3);
///
/// assert_eq!(table.get_physical_block_ids(), &[9, 3]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    block_ids: Vec<usize>,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Empty table using [`DEFAULT_BLOCK_SIZE`].
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Physical block IDs in logical order.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Forget every block. Releasing them is the allocator's job.
    pub fn clear(&mut self) {
        self.block_ids.clear();
    }
}
