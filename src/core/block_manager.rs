//! Block manager for the paged KV cache.
//!
//! The scheduler never touches block identities directly; it talks to the
//! cache through the [`BlockAllocator`] capability trait. [`BlockManager`] is
//! the in-process implementation.
//!
//! ## Features
//!
//! - **Free list allocation**: blocks are handed out from the front and
//!   returned to the back, so recently released blocks are reused last
//! - **Reference counting**: one physical block can back the same prefix
//!   in several sequences
//! - **Prefix caching**: full, computed blocks are indexed by a chained
//!   hash; released blocks keep their contents and can be revived until
//!   they are handed out for fresh tokens
//!
//! ## Example
//!
//! ```
//! use nano_vllm_sched::core::block_manager::{BlockAllocator, BlockManager};
//! use nano_vllm_sched::core::sequence::Sequence;
//!
//! let mut manager = BlockManager::new(64, 16);
//! let mut seq = Sequence::new(1, (0..40).collect());
//!
//! let layout = manager.get_token_layout(&seq);
//! assert_eq!(layout.fresh_tokens, 40);
//!
//! seq.set_num_new_tokens(layout.fresh_tokens);
//! manager.allocate(&mut seq).unwrap();
//! assert_eq!(seq.block_table().num_blocks(), 3);
//!
//! manager.deallocate(&mut seq);
//! assert_eq!(manager.num_free_blocks(), 64);
//! ```

use std::collections::{HashMap, VecDeque};

use crate::core::block::{compute_num_blocks, hash_token_block, Block, BlockTable};
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// How a waiting sequence's tokens map onto the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenLayout {
    /// Prefix tokens held in blocks other running sequences are using.
    pub shared_in_use_tokens: usize,
    /// Prefix tokens held in released blocks that still carry their contents.
    pub reusable_free_tokens: usize,
    /// Tokens that must be computed.
    pub fresh_tokens: usize,
}

impl TokenLayout {
    /// Tokens whose KV can be reused without computation.
    pub fn num_cached_tokens(&self) -> usize {
        self.shared_in_use_tokens + self.reusable_free_tokens
    }
}

/// Capacity and allocation interface the scheduler relies on.
///
/// Capability checks (`can_allocate`, `can_append`) are queried before the
/// matching mutation; the mutations may assume a positive answer.
pub trait BlockAllocator {
    /// Whether `num_blocks` free blocks are available.
    fn can_allocate(&self, num_blocks: usize) -> bool;

    /// Assign a block table covering the reusable prefix plus the
    /// sequence's `num_new_tokens`, and set its cached-token count from the
    /// prefix lookup.
    fn allocate(&mut self, seq: &mut Sequence) -> Result<()>;

    /// Split a waiting sequence's tokens into shared, revivable and fresh.
    fn get_token_layout(&self, seq: &Sequence) -> TokenLayout;

    /// Whether the block table can grow to cover `num_new_tokens` more
    /// tokens past the cached ones.
    fn can_append(&self, seq: &Sequence, num_new_tokens: usize) -> bool;

    /// Grow the block table to cover the sequence's `num_new_tokens`.
    fn may_append(&mut self, seq: &mut Sequence) -> Result<()>;

    /// Release every block of the sequence and clear its table.
    ///
    /// Must be called at most once per allocation.
    fn deallocate(&mut self, seq: &mut Sequence);
}

/// Manages allocation and deallocation of KV cache blocks.
#[derive(Debug)]
pub struct BlockManager {
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs, allocated from the front.
    free_list: VecDeque<usize>,
    /// Prefix hash -> block_id for computed, full blocks.
    prefix_cache: HashMap<u64, usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    ///
    /// ```
    /// use nano_vllm_sched::core::block_manager::BlockManager;
    ///
    /// let manager = BlockManager::new(1024, 16);
    /// assert_eq!(manager.num_free_blocks(), 1024);
    /// ```
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_list: (0..num_blocks).collect(),
            prefix_cache: HashMap::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of blocks referenced by at least one sequence.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Get the number of indexed prefix blocks.
    pub fn num_cached_prefixes(&self) -> usize {
        self.prefix_cache.len()
    }

    /// Get a reference to a block.
    pub fn get_block(&self, block_id: usize) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    /// Longest run of cached blocks matching the sequence's prefix.
    ///
    /// Only full blocks inside the first `len - 1` tokens are considered, so
    /// at least one token is always left to compute.
    fn match_prefix(&self, seq: &Sequence) -> Vec<usize> {
        let num_candidates = seq.total_len().saturating_sub(1) / self.block_size;
        let mut matched = Vec::new();
        let mut parent = None;

        for index in 0..num_candidates {
            let tokens = seq.block_tokens(index, self.block_size);
            let hash = hash_token_block(tokens, parent);
            match self.prefix_cache.get(&hash) {
                Some(&block_id) if self.blocks[block_id].token_ids() == tokens => {
                    matched.push(block_id)
                }
                _ => break,
            }
            parent = Some(hash);
        }

        matched
    }

    /// Take a specific released block back, keeping its cached contents.
    fn revive_block(&mut self, block_id: usize) {
        if let Some(pos) = self.free_list.iter().position(|&id| id == block_id) {
            self.free_list.remove(pos);
        }
        self.blocks[block_id].increment_ref();
    }

    /// Take the next free block for tokens that still need computing.
    fn take_fresh_block(&mut self) -> Result<usize> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        let block = &mut self.blocks[block_id];

        if let Some(hash) = block.prefix_hash() {
            if self.prefix_cache.get(&hash) == Some(&block_id) {
                self.prefix_cache.remove(&hash);
            }
        }
        block.reset();

        Ok(block_id)
    }

    /// Index every full block inside the sequence's computed prefix.
    fn commit_computed_blocks(&mut self, seq: &Sequence) {
        let table = seq.block_table().get_physical_block_ids();
        let num_full = (seq.num_cached_tokens() / self.block_size).min(table.len());
        let mut parent = None;

        for (index, &block_id) in table.iter().enumerate().take(num_full) {
            let hash = match self.blocks[block_id].prefix_hash() {
                Some(hash) => hash,
                None => {
                    let tokens = seq.block_tokens(index, self.block_size);
                    let hash = hash_token_block(tokens, parent);
                    // An identical block computed elsewhere keeps the index entry
                    if !self.prefix_cache.contains_key(&hash) {
                        self.blocks[block_id].set_prefix(hash, tokens);
                        self.prefix_cache.insert(hash, block_id);
                    }
                    hash
                }
            };
            parent = Some(hash);
        }
    }

    /// Blocks still missing for the table to cover `num_tokens` positions.
    fn blocks_needed(&self, seq: &Sequence, num_tokens: usize) -> usize {
        compute_num_blocks(num_tokens, self.block_size)
            .saturating_sub(seq.block_table().num_blocks())
    }
}

impl BlockAllocator for BlockManager {
    fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    fn allocate(&mut self, seq: &mut Sequence) -> Result<()> {
        debug_assert!(seq.block_table().is_empty());

        let matched = self.match_prefix(seq);
        let num_cached = matched.len() * self.block_size;
        let num_fresh = compute_num_blocks(num_cached + seq.num_new_tokens(), self.block_size)
            .saturating_sub(matched.len());
        let num_revived = matched
            .iter()
            .filter(|&&id| self.blocks[id].is_free())
            .count();
        if self.free_list.len() < num_revived + num_fresh {
            return Err(Error::OutOfBlocks);
        }

        let mut table = BlockTable::new(self.block_size);
        for block_id in matched {
            if self.blocks[block_id].is_free() {
                self.revive_block(block_id);
            } else {
                self.blocks[block_id].increment_ref();
            }
            table.append_block(block_id);
        }
        for _ in 0..num_fresh {
            table.append_block(self.take_fresh_block()?);
        }

        *seq.block_table_mut() = table;
        seq.set_num_cached_tokens(num_cached);
        Ok(())
    }

    fn get_token_layout(&self, seq: &Sequence) -> TokenLayout {
        let mut layout = TokenLayout::default();
        for block_id in self.match_prefix(seq) {
            if self.blocks[block_id].is_free() {
                layout.reusable_free_tokens += self.block_size;
            } else {
                layout.shared_in_use_tokens += self.block_size;
            }
        }
        layout.fresh_tokens = seq.total_len() - layout.num_cached_tokens();
        layout
    }

    fn can_append(&self, seq: &Sequence, num_new_tokens: usize) -> bool {
        let needed = self.blocks_needed(seq, seq.num_cached_tokens() + num_new_tokens);
        self.free_list.len() >= needed
    }

    fn may_append(&mut self, seq: &mut Sequence) -> Result<()> {
        self.commit_computed_blocks(seq);

        let needed = self.blocks_needed(seq, seq.num_cached_tokens() + seq.num_new_tokens());
        if self.free_list.len() < needed {
            return Err(Error::OutOfBlocks);
        }
        for _ in 0..needed {
            let block_id = self.take_fresh_block()?;
            seq.block_table_mut().append_block(block_id);
        }
        Ok(())
    }

    fn deallocate(&mut self, seq: &mut Sequence) {
        self.commit_computed_blocks(seq);

        for &block_id in seq.block_table().get_physical_block_ids().iter().rev() {
            if self.blocks[block_id].decrement_ref() == 0 {
                self.free_list.push_back(block_id);
            }
        }
        seq.block_table_mut().clear();
        seq.set_num_cached_tokens(0);
    }
}
