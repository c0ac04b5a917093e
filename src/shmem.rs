// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Segmented-fit allocator over one anonymous MAP_SHARED region.
//
// Region layout:
//
//   [ ShmemHeader ]
//   [ FreeNode; free_len ]        ← size-class buckets
//   [ Storage | payload ] …       ← the allocatable remainder
//
// Every storage header carries two intrusive links: an order link (all
// storages, sorted by address, physically contiguous neighbours adjacent)
// and a free link (threaded through its size-class bucket while the
// storage is free).  Buckets that are non-empty are additionally linked on
// the `available` ring in ascending index order.
//
// The region is created before workers fork, so the mapping lands at the
// same virtual address in every process and the raw links stay valid
// everywhere.  Serialising mutators (a process lock around alloc/free) is
// the caller's policy, as with the rest of the shared-memory primitives.

use std::io;
use std::ptr;

use thiserror::Error;

use crate::alloc::{AllocError, AllocStat, MemAllocator};
use crate::queue::{
    queue_data, queue_empty, queue_head, queue_init, queue_insert_after, queue_insert_before,
    queue_insert_head, queue_insert_tail, queue_next, queue_prev, queue_remove, queue_tail, Queue,
};

pub const SHMEM_DEFAULT_MAX_SIZE: usize = 10 << 20;
pub const SHMEM_DEFAULT_MIN_SIZE: usize = 1024;
pub const SHMEM_DEFAULT_SPLIT_THRESHOLD: usize = 64;
pub const SHMEM_EXP_FACTOR: usize = 2;
pub const SHMEM_LINEAR_FACTOR: usize = 1024;

/// Bytes of bookkeeping in front of every allocation.
pub const SHMEM_STORAGE_SIZE: usize = std::mem::size_of::<Storage>();

const ALIGN_SIZE: usize = 8;

fn align_up(size: usize, align: usize) -> usize {
    if size % align != 0 {
        size + align - size % align
    } else {
        size
    }
}

/// Smallest k with `2^k >= n` (n >= 1).
fn log2_up(n: usize) -> usize {
    let down = n.ilog2() as usize;
    if n.is_power_of_two() {
        down
    } else {
        down + 1
    }
}

/// Largest k with `2^k <= n` (n >= 1).
fn log2_down(n: usize) -> usize {
    n.ilog2() as usize
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Bucket growth law: linear steps of `factor`, or powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmemLevel {
    Linear,
    Exp,
}

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("shmem_create: size is 0")]
    CreateSize,
    #[error("shmem_create: min size is 0 or not below max size")]
    CreateMinSize,
    #[error("shmem_create: free bucket count is 0")]
    CreateFreeLen,
    #[error("shmem_create: total size is 0")]
    CreateTotalSize,
    #[error("shmem_create: total size is not enough for the system area")]
    CreateTotalSizeNotEnough,
    #[error("shmem_create: mmap failed")]
    CreateMmap(#[source] io::Error),
    #[error("shmem_create: first storage smaller than max size")]
    CreateStorageSize,
    #[error("shmem_release: munmap failed")]
    ReleaseMunmap(#[source] io::Error),
    #[error("shmem_alloc: parameter error")]
    AllocParam,
    #[error("shmem_alloc: memory is exhausted")]
    AllocExhausted,
    #[error("shmem_alloc: max available free list is empty")]
    AllocMaxAvailableEmpty,
    #[error("shmem_alloc: no available free list")]
    AllocNoAvailableFreeList,
    #[error("shmem_alloc: no fixed free space")]
    AllocNoFixedFreeSpace,
    #[error("shmem_alloc: found no storage covering the request")]
    AllocFoundNoFixed,
    #[error("shmem_alloc: remove free failed")]
    AllocRemoveFree,
    #[error("shmem_get_max: memory is exhausted")]
    GetMaxExhausted,
    #[error("shmem_get_max: available bucket is empty")]
    GetMaxCritical,
    #[error("shmem_split_alloc: max storage size below requested min size")]
    SplitAllocNoFixedReqMinsize,
    #[error("shmem_split_alloc: remove free failed")]
    SplitAllocRemoveFree,
    #[error("shmem_free: address is null")]
    FreeParam,
    #[error("shmem_free: freeing a non-allocated address")]
    FreeNonAlloced,
    #[error("shmem_free: removing the next storage failed")]
    FreeRemoveNext,
    #[error("shmem_free: removing the previous storage failed")]
    FreeRemovePrev,
}

/// Statistics snapshot.  `used_size` excludes headers and the system area;
/// `reqs_size` sums the byte counts callers actually asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmemStat {
    pub used_size: usize,
    pub reqs_size: usize,
    pub st_count: usize,
    pub st_size: usize,
    pub total_size: usize,
    pub system_size: usize,
    pub failed: usize,
    pub split: usize,
    pub split_failed: usize,
}

/// One storage header.  Lives immediately before its payload inside the
/// region.  `free_list_head` records the bucket the storage was filed
/// under; `remove_free` cross-checks it against the recomputed bucket and
/// refuses to unlink on mismatch, which catches external corruption of the
/// shared region.
#[repr(C)]
pub struct Storage {
    order_entry: Queue,
    free_entry: Queue,
    alloc: u32,
    size: usize,
    act_size: usize,
    free_list_head: *mut Queue,
}

/// One size-class bucket: free-list head plus its link on `available`.
#[repr(C)]
struct FreeNode {
    available_entry: Queue,
    free_list_head: Queue,
    index: usize,
}

/// Region descriptor, stored at the very start of the mapping.
#[repr(C)]
struct ShmemHeader {
    order: Queue,
    free: *mut FreeNode,
    free_len: usize,
    available: Queue,
    max_available_index: usize,
    min_size: usize,
    max_size: usize,
    factor: usize,
    split_threshold: usize,
    level: ShmemLevel,
    stat: ShmemStat,
}

/// Handle to a segmented-fit shared-memory allocator.
///
/// The handle itself is a thin pointer to the in-region descriptor; clones
/// of it (one per worker after fork) all view the same allocator.
pub struct Shmem {
    h: *mut ShmemHeader,
}

// The region is process-shared by design; callers serialise mutations.
unsafe impl Send for Shmem {}
unsafe impl Sync for Shmem {}

impl Shmem {
    /// Create the region and file its entire remainder as one free storage.
    ///
    /// `size` is rounded up to the page size.  `min_size`/`max_size` bound
    /// the bucket series; with `ShmemLevel::Exp` the factor is fixed at 2,
    /// with `ShmemLevel::Linear` the factor is aligned and used as the
    /// bucket step.
    pub fn create(
        size: usize,
        min_size: usize,
        max_size: usize,
        level: ShmemLevel,
        factor: usize,
    ) -> Result<Self, ShmemError> {
        if size == 0 {
            return Err(ShmemError::CreateSize);
        }

        let min_size = align_up(min_size, ALIGN_SIZE);
        let max_size = align_up(max_size, ALIGN_SIZE);
        if min_size == 0 || min_size >= max_size {
            return Err(ShmemError::CreateMinSize);
        }

        let (factor, free_len) = match level {
            ShmemLevel::Linear => {
                let factor = align_up(factor, ALIGN_SIZE);
                let mut n = (max_size - min_size) / factor;
                if (max_size - min_size) % factor != 0 {
                    n += 1;
                }
                (factor, n)
            }
            ShmemLevel::Exp => {
                let mut power = max_size / min_size;
                if max_size % min_size != 0 {
                    power += 1;
                }
                (SHMEM_EXP_FACTOR, log2_up(power))
            }
        };
        if free_len == 0 {
            return Err(ShmemError::CreateFreeLen);
        }
        let free_len = free_len + 1;

        let total_size = align_up(size, page_size());
        if total_size == 0 {
            return Err(ShmemError::CreateTotalSize);
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ShmemError::CreateMmap(io::Error::last_os_error()));
        }

        let h = base as *mut ShmemHeader;
        unsafe {
            let free_size = std::mem::size_of::<FreeNode>() * free_len;
            let mut system_size = std::mem::size_of::<ShmemHeader>();
            if free_size + system_size + SHMEM_STORAGE_SIZE >= total_size {
                libc::munmap(base, total_size);
                return Err(ShmemError::CreateTotalSizeNotEnough);
            }

            (*h).min_size = min_size;
            (*h).max_size = max_size;
            (*h).factor = factor;
            (*h).free_len = free_len;
            (*h).level = level;
            // Split threshold defaults to the smallest class; tune later
            // with `set_split_threshold`.
            (*h).split_threshold = min_size;

            (*h).free = (base as *mut u8).add(system_size) as *mut FreeNode;
            for i in 0..free_len {
                let f = (*h).free.add(i);
                (*f).index = i;
                queue_init(&mut (*f).free_list_head);
            }

            system_size = align_up(system_size + free_size, ALIGN_SIZE);
            (*h).stat = ShmemStat {
                total_size,
                system_size,
                st_count: 1,
                ..Default::default()
            };

            let st = (base as *mut u8).add(system_size) as *mut Storage;
            (*st).size = total_size - system_size - SHMEM_STORAGE_SIZE;
            (*st).act_size = 0;
            (*st).alloc = 0;
            if (*st).size < max_size {
                libc::munmap(base, total_size);
                return Err(ShmemError::CreateStorageSize);
            }

            queue_init(&mut (*h).order);
            queue_insert_head(&mut (*h).order, &mut (*st).order_entry);

            let mut i = Self::insert_index_raw(h, (*st).size);
            if i >= free_len {
                i = free_len - 1;
            }
            let f = (*h).free.add(i);
            (*st).free_list_head = &mut (*f).free_list_head;
            queue_insert_head(&mut (*f).free_list_head, &mut (*st).free_entry);

            queue_init(&mut (*h).available);
            queue_insert_head(&mut (*h).available, &mut (*f).available_entry);
            (*h).max_available_index = i;
        }

        Ok(Self { h })
    }

    /// Unmap the region.  All pointers handed out become invalid; the
    /// caller must have quiesced every worker first.
    pub fn release(self) -> Result<(), ShmemError> {
        unsafe {
            let total = (*self.h).stat.total_size;
            if libc::munmap(self.h as *mut libc::c_void, total) != 0 {
                return Err(ShmemError::ReleaseMunmap(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    /// Smallest bucket whose class covers `size` (round up).
    unsafe fn alloc_index_raw(h: *mut ShmemHeader, size: usize) -> usize {
        if size <= (*h).min_size {
            return 0;
        }
        match (*h).level {
            ShmemLevel::Linear => {
                let mut id = (size - (*h).min_size) / (*h).factor;
                if (size - (*h).min_size) % (*h).factor != 0 {
                    id += 1;
                }
                id
            }
            ShmemLevel::Exp => {
                let mut power = size / (*h).min_size;
                if size % (*h).min_size != 0 {
                    power += 1;
                }
                log2_up(power)
            }
        }
    }

    /// Bucket a free storage of `size` is filed under (round down).
    unsafe fn insert_index_raw(h: *mut ShmemHeader, size: usize) -> usize {
        if size <= (*h).min_size {
            return 0;
        }
        match (*h).level {
            ShmemLevel::Linear => (size - (*h).min_size) / (*h).factor,
            ShmemLevel::Exp => log2_down(size / (*h).min_size),
        }
    }

    /// Unlink `st` from its free bucket, maintaining `available` and
    /// `max_available_index`.  Fails when the recorded bucket head does not
    /// match the recomputed one (region corruption); the storage is left in
    /// place in that case.
    unsafe fn remove_free(h: *mut ShmemHeader, st: *mut Storage) -> Result<(), ()> {
        let mut index = Self::insert_index_raw(h, (*st).size);
        if index > (*h).max_available_index {
            index = (*h).max_available_index;
        }
        let f = (*h).free.add(index);
        if (*st).free_list_head != &mut (*f).free_list_head as *mut Queue {
            return Err(());
        }
        queue_remove(&mut (*st).free_entry);

        if queue_empty(&(*f).free_list_head) {
            if index == (*h).max_available_index {
                let pq = queue_prev(&(*f).available_entry);
                if pq == &mut (*h).available as *mut Queue {
                    (*h).max_available_index = (*h).free_len;
                } else {
                    let prev = queue_data!(pq, FreeNode, available_entry);
                    (*h).max_available_index = (*prev).index;
                }
            }
            queue_remove(&mut (*f).available_entry);
        }

        (*st).free_list_head = ptr::null_mut();
        Ok(())
    }

    /// File a free storage into its bucket, keeping `available` sorted by
    /// index and `max_available_index` current.
    unsafe fn insert_free(h: *mut ShmemHeader, st: *mut Storage) {
        if st.is_null() || (*st).alloc != 0 {
            return;
        }

        let mut index = Self::insert_index_raw(h, (*st).size);
        if index > (*h).free_len - 1 {
            index = (*h).free_len - 1;
        }
        let f = (*h).free.add(index);
        (*st).free_list_head = &mut (*f).free_list_head;

        if queue_empty(&(*f).free_list_head) {
            let mut appended = true;
            let mut q = queue_head(&(*h).available);
            while q != &mut (*h).available as *mut Queue {
                let node = queue_data!(q, FreeNode, available_entry);
                if index < (*node).index {
                    queue_insert_before(&mut (*node).available_entry, &mut (*f).available_entry);
                    appended = false;
                    break;
                }
                q = queue_next(q);
            }
            if appended {
                queue_insert_tail(&mut (*h).available, &mut (*f).available_entry);
                (*h).max_available_index = (*f).index;
            }
        }
        queue_insert_head(&mut (*f).free_list_head, &mut (*st).free_entry);
    }

    /// Allocate `size` bytes: pick the first bucket covering the request
    /// (or the first non-empty larger one), first-fit inside that bucket,
    /// split the storage when the slack is worth a header.
    pub fn alloc(&self, size: usize) -> Result<*mut u8, ShmemError> {
        let h = self.h;
        if size == 0 {
            return Err(ShmemError::AllocParam);
        }
        // Storage headers must stay aligned, so the payload size is
        // rounded up; `act_size`/`reqs_size` keep the caller's figure.
        let asize = align_up(size, ALIGN_SIZE);
        unsafe {
            if (*h).max_available_index == (*h).free_len {
                (*h).stat.failed += 1;
                return Err(ShmemError::AllocExhausted);
            }

            let index = Self::alloc_index_raw(h, asize);
            let mut f: *mut FreeNode;
            'chosen: {
                if index < (*h).max_available_index {
                    f = (*h).free.add(index);
                    if !queue_empty(&(*f).free_list_head) {
                        break 'chosen;
                    }
                    let mut q = queue_head(&(*h).available);
                    while q != &mut (*h).available as *mut Queue {
                        f = queue_data!(q, FreeNode, available_entry);
                        if !queue_empty(&(*f).free_list_head) && (*f).index > index {
                            break 'chosen;
                        }
                        q = queue_next(&(*f).available_entry);
                    }
                    (*h).stat.failed += 1;
                    // No higher bucket holds anything; the same bucket is
                    // deliberately not rescanned for an oversized chunk.
                    return Err(if queue_empty(&(*h).available) {
                        ShmemError::AllocNoAvailableFreeList
                    } else {
                        ShmemError::AllocNoFixedFreeSpace
                    });
                } else {
                    f = (*h).free.add((*h).max_available_index);
                    if queue_empty(&(*f).free_list_head) {
                        (*h).stat.failed += 1;
                        return Err(ShmemError::AllocMaxAvailableEmpty);
                    }
                }
            }

            // First fit inside the class: constant-time removal beats an
            // exhaustive best-fit scan here.
            let mut st: *mut Storage = ptr::null_mut();
            let mut st_q = queue_head(&(*f).free_list_head);
            loop {
                let cand = queue_data!(st_q, Storage, free_entry);
                if (*cand).size >= asize {
                    st = cand;
                    break;
                }
                st_q = queue_next(st_q);
                if st_q == &mut (*f).free_list_head as *mut Queue {
                    break;
                }
            }
            if st.is_null() {
                (*h).stat.failed += 1;
                return Err(ShmemError::AllocFoundNoFixed);
            }
            if Self::remove_free(h, st).is_err() {
                (*h).stat.failed += 1;
                return Err(ShmemError::AllocRemoveFree);
            }

            if (*st).size - asize < SHMEM_STORAGE_SIZE + (*h).split_threshold {
                // Keep the slack inside the storage.
                (*st).alloc = 1;
                (*st).act_size = size;
                (*h).stat.used_size += (*st).size;
                (*h).stat.reqs_size += size;
                return Ok((st as *mut u8).add(SHMEM_STORAGE_SIZE));
            }

            // Split: the tail becomes a new storage right after this one.
            let st_new = (st as *mut u8).add(SHMEM_STORAGE_SIZE + asize) as *mut Storage;
            (*st_new).size = (*st).size - asize - SHMEM_STORAGE_SIZE;
            (*st_new).act_size = 0;
            (*st_new).alloc = 0;
            (*st_new).free_list_head = ptr::null_mut();

            (*st).alloc = 1;
            (*st).size = asize;
            (*st).act_size = size;

            queue_insert_after(&mut (*st).order_entry, &mut (*st_new).order_entry);
            Self::insert_free(h, st_new);

            (*h).stat.used_size += asize;
            (*h).stat.reqs_size += size;
            (*h).stat.st_count += 1;

            Ok((st as *mut u8).add(SHMEM_STORAGE_SIZE))
        }
    }

    /// `alloc` + zero fill.
    pub fn calloc(&self, size: usize) -> Result<*mut u8, ShmemError> {
        let ptr = self.alloc(size)?;
        unsafe { ptr::write_bytes(ptr, 0, size) };
        Ok(ptr)
    }

    /// Largest free storage on the largest non-empty bucket.
    unsafe fn get_max_st(h: *mut ShmemHeader) -> Result<*mut Storage, ShmemError> {
        if (*h).max_available_index == (*h).free_len || queue_empty(&(*h).available) {
            return Err(ShmemError::GetMaxExhausted);
        }

        let q = queue_tail(&(*h).available);
        let f = queue_data!(q, FreeNode, available_entry);
        if queue_empty(&(*f).free_list_head) {
            return Err(ShmemError::GetMaxCritical);
        }
        let mut st_q = queue_head(&(*f).free_list_head);
        let mut st_max = queue_data!(st_q, Storage, free_entry);
        st_q = queue_next(st_q);
        while st_q != &mut (*f).free_list_head as *mut Queue {
            let st = queue_data!(st_q, Storage, free_entry);
            if (*st).size > (*st_max).size {
                st_max = st;
            }
            st_q = queue_next(st_q);
        }
        Ok(st_max)
    }

    /// Hand out the largest free storage whole, for callers that can use
    /// any size of at least `minsize`.  Returns the pointer and the actual
    /// payload size.
    pub fn split_alloc(&self, minsize: usize) -> Result<(*mut u8, usize), ShmemError> {
        let h = self.h;
        unsafe {
            (*h).stat.split += 1;
            let st = match Self::get_max_st(h) {
                Ok(st) => st,
                Err(e) => {
                    (*h).stat.split_failed += 1;
                    return Err(e);
                }
            };
            if (*st).size < minsize {
                (*h).stat.split_failed += 1;
                return Err(ShmemError::SplitAllocNoFixedReqMinsize);
            }
            if Self::remove_free(h, st).is_err() {
                (*h).stat.split_failed += 1;
                return Err(ShmemError::SplitAllocRemoveFree);
            }
            (*st).alloc = 1;
            let act_size = (*st).size;
            (*st).act_size = act_size;
            (*h).stat.used_size += act_size;
            (*h).stat.reqs_size += act_size;
            Ok(((st as *mut u8).add(SHMEM_STORAGE_SIZE), act_size))
        }
    }

    /// Return a block, coalescing with physically contiguous free
    /// neighbours (next first, then previous) before refiling.
    pub fn free(&self, addr: *mut u8) -> Result<(), ShmemError> {
        let h = self.h;
        if addr.is_null() {
            return Err(ShmemError::FreeParam);
        }
        unsafe {
            let mut st = addr.sub(SHMEM_STORAGE_SIZE) as *mut Storage;
            if (*st).alloc == 0 {
                return Err(ShmemError::FreeNonAlloced);
            }

            (*h).stat.used_size -= (*st).size;
            (*h).stat.reqs_size -= (*st).act_size;
            (*st).alloc = 0;

            // Merge with the next storage on the order list.
            let q = queue_next(&(*st).order_entry);
            if q != &mut (*h).order as *mut Queue {
                let next = queue_data!(q, Storage, order_entry);
                let contiguous =
                    next as *mut u8 == (st as *mut u8).add(SHMEM_STORAGE_SIZE + (*st).size);
                if (*next).alloc == 0 && contiguous {
                    if Self::remove_free(h, next).is_err() {
                        return Err(ShmemError::FreeRemoveNext);
                    }
                    (*st).size += (*next).size + SHMEM_STORAGE_SIZE;
                    queue_remove(&mut (*next).order_entry);
                    (*h).stat.st_count -= 1;
                }
            }

            // Merge with the previous storage.
            let q = queue_prev(&(*st).order_entry);
            if q != &mut (*h).order as *mut Queue {
                let prev = queue_data!(q, Storage, order_entry);
                let contiguous =
                    st as *mut u8 == (prev as *mut u8).add(SHMEM_STORAGE_SIZE + (*prev).size);
                if (*prev).alloc == 0 && contiguous {
                    if Self::remove_free(h, prev).is_err() {
                        return Err(ShmemError::FreeRemovePrev);
                    }
                    (*prev).size += (*st).size + SHMEM_STORAGE_SIZE;
                    queue_remove(&mut (*st).order_entry);
                    st = prev;
                    (*h).stat.st_count -= 1;
                }
            }

            Self::insert_free(h, st);
        }
        Ok(())
    }

    /// Copy `data` into the region with a trailing NUL, for callers that
    /// intern names in shared memory.
    pub fn strdup(&self, data: &[u8]) -> Result<*mut u8, ShmemError> {
        let dst = self.calloc(data.len() + 1)?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            *dst.add(data.len()) = 0;
        }
        Ok(dst)
    }

    /// Slack below which an allocation keeps its whole storage instead of
    /// splitting off the tail.
    pub fn set_split_threshold(&self, size: usize) {
        unsafe { (*self.h).split_threshold = size };
    }

    pub fn used_size(&self) -> usize {
        unsafe { (*self.h).stat.used_size }
    }

    pub fn total_size(&self) -> usize {
        unsafe { (*self.h).stat.total_size }
    }

    pub fn system_size(&self) -> usize {
        unsafe { (*self.h).stat.system_size }
    }

    /// Statistics snapshot; `st_size` is derived from the live header count.
    pub fn stat(&self) -> ShmemStat {
        unsafe {
            let mut stat = (*self.h).stat;
            stat.st_size = stat.st_count * SHMEM_STORAGE_SIZE;
            stat
        }
    }
}

impl MemAllocator for Shmem {
    fn name(&self) -> &'static str {
        "shmem"
    }

    fn alloc(&self, size: usize) -> Result<*mut u8, AllocError> {
        Shmem::alloc(self, size).map_err(AllocError::from)
    }

    fn calloc(&self, size: usize) -> Result<*mut u8, AllocError> {
        Shmem::calloc(self, size).map_err(AllocError::from)
    }

    fn split_alloc(&self, minsize: usize) -> Result<(*mut u8, usize), AllocError> {
        Shmem::split_alloc(self, minsize).map_err(AllocError::from)
    }

    fn free(&self, ptr: *mut u8) -> Result<(), AllocError> {
        Shmem::free(self, ptr).map_err(AllocError::from)
    }

    fn supports_split_alloc(&self) -> bool {
        true
    }

    fn supports_free(&self) -> bool {
        true
    }

    fn stat(&self) -> Option<AllocStat> {
        let s = self.stat();
        Some(AllocStat {
            total_size: s.total_size,
            system_size: s.system_size,
            used_size: s.used_size,
            reqs_size: s.reqs_size,
            st_count: s.st_count,
            st_size: s.st_size,
            failed: s.failed,
            split: s.split,
            split_failed: s.split_failed,
        })
    }
}
