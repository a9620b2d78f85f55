//! Integration tests for Block and BlockTable.

use nano_vllm_sched::core::block::{compute_num_blocks, hash_token_block, Block, BlockTable};

#[test]
fn test_block_starts_free() {
    let block = Block::new(42);
    assert_eq!(block.block_id(), 42);
    assert_eq!(block.ref_count(), 0);
    assert!(block.is_free());
    assert!(block.prefix_hash().is_none());
    assert!(block.token_ids().is_empty());
}

#[test]
fn test_block_ref_counting() {
    let mut block = Block::new(0);
    block.reset();
    assert_eq!(block.ref_count(), 1);

    block.increment_ref();
    block.increment_ref();
    assert_eq!(block.ref_count(), 3);

    assert_eq!(block.decrement_ref(), 2);
    assert_eq!(block.decrement_ref(), 1);
    assert_eq!(block.decrement_ref(), 0);
    assert!(block.is_free());

    // Should not go below 0
    assert_eq!(block.decrement_ref(), 0);
}

#[test]
fn test_block_prefix_survives_release_until_reset() {
    let mut block = Block::new(3);
    block.reset();
    block.set_prefix(12345, &[1, 2, 3, 4]);

    block.decrement_ref();
    assert!(block.is_free());
    assert_eq!(block.prefix_hash(), Some(12345));
    assert_eq!(block.token_ids(), &[1, 2, 3, 4]);

    block.reset();
    assert_eq!(block.ref_count(), 1);
    assert!(block.prefix_hash().is_none());
    assert!(block.token_ids().is_empty());
}

#[test]
fn test_hash_token_block_chains() {
    let a = [1u32, 2, 3, 4];
    let b = [5u32, 6, 7, 8];

    assert_eq!(hash_token_block(&a, None), hash_token_block(&a, None));
    assert_ne!(hash_token_block(&a, None), hash_token_block(&b, None));

    let parent = hash_token_block(&a, None);
    let other_parent = hash_token_block(&b, None);
    assert_ne!(
        hash_token_block(&b, Some(parent)),
        hash_token_block(&b, Some(other_parent))
    );
}

#[test]
fn test_compute_num_blocks() {
    assert_eq!(compute_num_blocks(0, 16), 0);
    assert_eq!(compute_num_blocks(1, 16), 1);
    assert_eq!(compute_num_blocks(16, 16), 1);
    assert_eq!(compute_num_blocks(17, 16), 2);
    assert_eq!(compute_num_blocks(1000, 16), 63);
}

#[test]
fn test_block_table_keeps_logical_order() {
    let mut table = BlockTable::new(4);
    assert!(table.is_empty());
    assert_eq!(table.block_size(), 4);

    table.append_block(7);
    table.append_block(2);

    assert_eq!(table.num_blocks(), 2);
    assert_eq!(table.get_physical_block_ids(), &[7, 2]);
}

#[test]
fn test_block_table_clear() {
    let mut table = BlockTable::with_default_size();
    table.append_block(1);
    table.clear();

    assert!(table.is_empty());
    assert_eq!(table.block_size(), 16);
}
