// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocation-path benchmarks: raw segmented-fit alloc/free cycles
// against the slab cache over the same region, plus the arena bump path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use libsrv::pool::{pool_alloc, pool_create, pool_destroy, pool_reset};
use libsrv::shmem::{Shmem, ShmemLevel};
use libsrv::slabs::{SlabAllocType, SlabUptype, Slabs};

fn bench_shmem_alloc_free(c: &mut Criterion) {
    let shm = Shmem::create(16 << 20, 64, 64 << 10, ShmemLevel::Exp, 2).expect("create shmem");

    c.bench_function("shmem_alloc_free_256", |b| {
        b.iter(|| {
            let p = shm.alloc(black_box(256)).expect("alloc");
            shm.free(p).expect("free");
        })
    });

    c.bench_function("shmem_alloc_free_4k", |b| {
        b.iter(|| {
            let p = shm.alloc(black_box(4096)).expect("alloc");
            shm.free(p).expect("free");
        })
    });

    shm.release().expect("release");
}

fn bench_slab_alloc_free(c: &mut Criterion) {
    let shm = Shmem::create(16 << 20, 64, 64 << 10, ShmemLevel::Exp, 2).expect("create shmem");
    let slabs = Slabs::create(&shm, SlabUptype::Power, 2, 64, 8192).expect("create slabs");

    // Warm the freelist so the steady state is measured.
    let (p, _) = slabs.alloc(SlabAllocType::Req, 256).expect("alloc");
    slabs.free(p).expect("free");

    c.bench_function("slab_alloc_free_256", |b| {
        b.iter(|| {
            let (p, _) = slabs.alloc(SlabAllocType::Req, black_box(256)).expect("alloc");
            slabs.free(p).expect("free");
        })
    });

    slabs.release().expect("release slabs");
    shm.release().expect("release");
}

fn bench_pool_alloc(c: &mut Criterion) {
    c.bench_function("pool_alloc_64x64", |b| {
        let pool = pool_create(8192).expect("pool");
        b.iter(|| unsafe {
            for _ in 0..64 {
                black_box(pool_alloc(pool, black_box(64)));
            }
            pool_reset(pool);
        });
        unsafe { pool_destroy(pool) };
    });
}

criterion_group!(
    benches,
    bench_shmem_alloc_free,
    bench_slab_alloc_free,
    bench_pool_alloc
);
criterion_main!(benches);
