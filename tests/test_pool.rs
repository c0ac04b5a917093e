// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unit tests for the arena pool: bump allocation, block chaining, the
// large-allocation list, reset, and the allocator facade.

use libsrv::alloc::MemAllocator;
use libsrv::pool::{
    pool_alloc, pool_calloc, pool_create, pool_destroy, pool_free_large, pool_reset,
    PoolAllocator, POOL_DEFAULT_SIZE,
};

#[test]
fn create_and_destroy() {
    let pool = pool_create(POOL_DEFAULT_SIZE).expect("create");
    unsafe { pool_destroy(pool) };
}

#[test]
fn create_rejects_tiny_size() {
    assert!(pool_create(8).is_err());
}

#[test]
fn small_allocs_are_aligned_and_distinct() {
    let pool = pool_create(POOL_DEFAULT_SIZE).expect("create");
    unsafe {
        let a = pool_alloc(pool, 24);
        let b = pool_alloc(pool, 100);
        let c = pool_alloc(pool, 1);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
        assert_eq!(c as usize % 16, 0);
        assert_ne!(a, b);
        assert_ne!(b, c);

        // Writable across the whole span.
        std::ptr::write_bytes(a, 0xaa, 24);
        std::ptr::write_bytes(b, 0xbb, 100);

        pool_destroy(pool);
    }
}

#[test]
fn exhausting_a_block_chains_a_new_one() {
    let pool = pool_create(512).expect("create");
    unsafe {
        // Way more than one 512-byte block can hold.
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            let p = pool_alloc(pool, 100);
            assert!(!p.is_null());
            std::ptr::write_bytes(p, 0x5a, 100);
            ptrs.push(p);
        }
        ptrs.dedup();
        assert_eq!(ptrs.len(), 64);
        pool_destroy(pool);
    }
}

#[test]
fn calloc_zeroes() {
    let pool = pool_create(POOL_DEFAULT_SIZE).expect("create");
    unsafe {
        let p = pool_calloc(pool, 64);
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 64).iter().all(|&b| b == 0));
        pool_destroy(pool);
    }
}

#[test]
fn large_allocations_take_their_own_path() {
    let pool = pool_create(1024).expect("create");
    unsafe {
        // Bigger than the pool's small-allocation cap.
        let big = pool_alloc(pool, 16 << 10);
        assert!(!big.is_null());
        std::ptr::write_bytes(big, 0xcc, 16 << 10);

        // Early free of one large allocation.
        assert!(pool_free_large(pool, big));
        assert!(!pool_free_large(pool, big));

        // The emptied slot is reused by the next large allocation.
        let big2 = pool_alloc(pool, 8 << 10);
        assert!(!big2.is_null());
        pool_destroy(pool);
    }
}

#[test]
fn reset_rewinds_blocks_and_drops_large() {
    let pool = pool_create(512).expect("create");
    unsafe {
        let first = pool_alloc(pool, 8);
        for _ in 0..16 {
            assert!(!pool_alloc(pool, 100).is_null());
        }
        let big = pool_alloc(pool, 16 << 10);
        assert!(!big.is_null());

        pool_reset(pool);

        // The first small allocation lands where the very first one did.
        assert_eq!(pool_alloc(pool, 8), first);
        pool_destroy(pool);
    }
}

#[test]
fn allocator_facade_has_no_free() {
    let pool = pool_create(POOL_DEFAULT_SIZE).expect("create");
    let pa = unsafe { PoolAllocator::new(pool) };
    assert_eq!(pa.name(), "pool");
    assert!(!pa.supports_free());
    assert!(!pa.supports_split_alloc());

    let p = pa.alloc(128).expect("alloc");
    assert!(!p.is_null());
    assert!(pa.free(p).is_err());
    assert!(pa.split_alloc(64).is_err());
    assert!(pa.stat().is_none());

    unsafe { pool_destroy(pool) };
}
