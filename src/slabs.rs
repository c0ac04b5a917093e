// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Size-classed chunk cache layered on top of any `MemAllocator`.  Returned
// chunks park on a per-class freelist instead of going back to the
// allocator; when the allocator runs dry the cache reclaims across
// classes — one chunk from the first richer class, else lower classes in
// bulk until enough bytes came back.
//
// The manager header and the class array live in allocator memory, so a
// cache built over the shared-memory allocator is itself shared between
// workers (the caller serialises, as with the allocator underneath).

use thiserror::Error;

use crate::alloc::{AllocError, MemAllocator};

pub const SLAB_DEFAULT_MAX_SIZE: usize = 10 << 20;
pub const SLAB_DEFAULT_MIN_SIZE: usize = 1024;
pub const SLAB_RECOVER_FACTOR: usize = 2;

/// Class id stamped on chunks obtained through `split_alloc`; they bypass
/// the class freelists entirely.
pub const SLAB_SPLIT_ID: isize = -5;

/// Bytes of bookkeeping in front of every chunk payload.
pub const SLAB_CHUNK_SIZE: usize = std::mem::size_of::<ChunkLink>();

const ALIGN_SIZE: usize = 8;

fn align_up(size: usize, align: usize) -> usize {
    if size % align != 0 {
        size + align - size % align
    } else {
        size
    }
}

fn log2_up(n: usize) -> usize {
    let down = n.ilog2() as usize;
    if n.is_power_of_two() {
        down
    } else {
        down + 1
    }
}

/// Class-size growth law and its fixed factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabUptype {
    /// Sizes double per class; factor must be 2.
    Power,
    /// Sizes grow by a fixed step; factor must be 1024.
    Linear,
}

pub const SLAB_POWER_FACTOR: usize = 2;
pub const SLAB_LINEAR_FACTOR: usize = 1024;

/// Whether `alloc` reports the requested size or the chunk's actual
/// payload size back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabAllocType {
    Req,
    Act,
}

#[derive(Debug, Error)]
pub enum SlabError {
    #[error("slabs_create: parameter error")]
    CreateParam,
    #[error("slabs_create: power factor error")]
    CreatePowerFactor,
    #[error("slabs_create: linear factor error")]
    CreateLinearFactor,
    #[error("slabs_alloc: invalid class id")]
    AllocInvalidId,
    #[error("slabs_alloc: no space left after reclamation")]
    AllocNoSpace,
    #[error("slabs_split_alloc: parameter error")]
    SplitAllocParam,
    #[error("slabs_split_alloc: not supported by the underlying allocator")]
    SplitAllocNotSupported,
    #[error("slabs_split_alloc: chunk size too large")]
    SplitAllocChunkSizeTooLarge,
    #[error("slabs_free: chunk id error")]
    FreeChunkId,
    #[error("slabs: allocator error")]
    Allocator(#[source] AllocError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlabStat {
    pub used_size: usize,
    pub reqs_size: usize,
    pub free_size: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub system_size: usize,
    pub failed: usize,
    pub recover: usize,
    pub recover_failed: usize,
    pub split_failed: usize,
}

/// Header in front of every live chunk.  `next` is only meaningful while
/// the chunk sits on a class freelist.
#[repr(C)]
pub struct ChunkLink {
    size: usize,
    req_size: usize,
    id: isize,
    next: *mut ChunkLink,
}

#[repr(C)]
struct SlabClass {
    size: usize,
    free_list: *mut ChunkLink,
}

/// In-allocator manager state: growth law, class array, statistics.
#[repr(C)]
struct SlabHeader {
    uptype: SlabUptype,
    free_len: usize,
    factor: usize,
    min_size: usize,
    stat: SlabStat,
    classes: *mut SlabClass,
}

/// The slab cache handle; generic over the underlying allocator so each
/// variant stays a concrete type.
pub struct Slabs<'a, A: MemAllocator> {
    h: *mut SlabHeader,
    allocator: &'a A,
}

unsafe impl<A: MemAllocator + Sync> Send for Slabs<'_, A> {}
unsafe impl<A: MemAllocator + Sync> Sync for Slabs<'_, A> {}

enum Recover {
    /// At least one chunk went back to the allocator; retry the alloc.
    Progress,
    /// Lower classes had something but not enough came back; retry anyway.
    Partial,
    /// Every freelist is empty.
    NoSpace,
}

impl<'a, A: MemAllocator> Slabs<'a, A> {
    /// Build the class series over `[item_min, item_max]` and place the
    /// manager in allocator memory.
    pub fn create(
        allocator: &'a A,
        uptype: SlabUptype,
        factor: usize,
        item_min: usize,
        item_max: usize,
    ) -> Result<Self, SlabError> {
        if item_min == 0 || item_max == 0 || item_max / item_min < 2 {
            return Err(SlabError::CreateParam);
        }

        let free_len = match uptype {
            SlabUptype::Power => {
                if factor != SLAB_POWER_FACTOR {
                    return Err(SlabError::CreatePowerFactor);
                }
                let mut power = item_max / item_min;
                if item_max % item_min != 0 {
                    power += 1;
                }
                log2_up(power)
            }
            SlabUptype::Linear => {
                if factor != SLAB_LINEAR_FACTOR {
                    return Err(SlabError::CreateLinearFactor);
                }
                let mut n = (item_max - item_min) / factor;
                if (item_max - item_min) % factor != 0 {
                    n += 1;
                }
                n
            }
        };
        let free_len = free_len + 1;

        let h = allocator
            .calloc(std::mem::size_of::<SlabHeader>())
            .map_err(SlabError::Allocator)? as *mut SlabHeader;
        let classes = allocator
            .calloc(std::mem::size_of::<SlabClass>() * free_len)
            .map_err(SlabError::Allocator)? as *mut SlabClass;

        unsafe {
            let mut size = item_min;
            for i in 0..free_len {
                (*classes.add(i)).size = align_up(size + SLAB_CHUNK_SIZE, ALIGN_SIZE);
                (*classes.add(i)).free_list = std::ptr::null_mut();
                match uptype {
                    SlabUptype::Power => size *= factor,
                    SlabUptype::Linear => size += factor,
                }
            }

            (*h).uptype = uptype;
            (*h).free_len = free_len;
            (*h).factor = factor;
            (*h).min_size = item_min;
            (*h).classes = classes;
            (*h).stat = SlabStat {
                system_size: std::mem::size_of::<SlabHeader>()
                    + std::mem::size_of::<SlabClass>() * free_len,
                ..Default::default()
            };
        }

        Ok(Self { h, allocator })
    }

    /// Drain every freelist back to the allocator and release the manager.
    pub fn release(self) -> Result<(), SlabError> {
        unsafe {
            let h = self.h;
            for i in 0..(*h).free_len {
                let class = (*h).classes.add(i);
                while !(*class).free_list.is_null() {
                    let chunk = (*class).free_list;
                    (*class).free_list = (*chunk).next;
                    self.allocator
                        .free(chunk as *mut u8)
                        .map_err(SlabError::Allocator)?;
                }
            }
            self.allocator
                .free((*h).classes as *mut u8)
                .map_err(SlabError::Allocator)?;
            self.allocator
                .free(h as *mut u8)
                .map_err(SlabError::Allocator)?;
        }
        Ok(())
    }

    /// Class covering `size` payload bytes.  `up` rounds to the covering
    /// class (alloc); otherwise rounds down (insert).
    unsafe fn clsid(h: *mut SlabHeader, size: usize, up: bool) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let classes = (*h).classes;
        let max_id = (*h).free_len - 1;
        let all_size = align_up(size + SLAB_CHUNK_SIZE, ALIGN_SIZE);
        if all_size > (*classes.add(max_id)).size {
            return None;
        }
        if all_size <= (*classes).size {
            return Some(0);
        }
        if all_size == (*classes.add(max_id)).size {
            return Some(max_id);
        }

        if (*h).uptype == SlabUptype::Linear {
            let mut id = (size - (*h).min_size) / (*h).factor;
            if up && (size - (*h).min_size) % (*h).factor != 0 {
                id += 1;
            }
            return Some(id);
        }

        // Power classes: binary search for the covering class.
        let mut low = 1usize;
        let mut high = max_id - 1;
        while low <= high {
            let mid = (low + high) >> 1;
            let mid_size = (*classes.add(mid)).size;
            if all_size <= mid_size {
                let below = (*classes.add(mid - 1)).size;
                if all_size > below {
                    return Some(mid);
                } else if all_size == below {
                    return Some(mid - 1);
                }
                high = mid - 1;
            } else {
                if all_size <= (*classes.add(mid + 1)).size {
                    return Some(mid + 1);
                }
                low = mid + 1;
            }
        }
        None
    }

    /// Give memory back to the allocator so a class-`id` chunk can be
    /// carved: one chunk from the first richer class, else lower classes
    /// until `SLAB_RECOVER_FACTOR × chunk_size` bytes came back.
    unsafe fn recover(&self, chunk_size: usize, id: usize) -> Recover {
        let h = self.h;
        let classes = (*h).classes;
        (*h).stat.recover += 1;

        for i in id + 1..(*h).free_len {
            let class = classes.add(i);
            if !(*class).free_list.is_null() {
                let chunk = (*class).free_list;
                (*class).free_list = (*chunk).next;
                let _ = self.allocator.free(chunk as *mut u8);
                (*h).stat.free_size -= (*class).size - SLAB_CHUNK_SIZE;
                (*h).stat.chunk_count -= 1;
                return Recover::Progress;
            }
        }

        let mut freed = 0usize;
        let mut space_flag = false;
        for i in (0..id).rev() {
            let class = classes.add(i);
            if !(*class).free_list.is_null() {
                space_flag = true;
            }
            while !(*class).free_list.is_null() {
                let chunk = (*class).free_list;
                (*class).free_list = (*chunk).next;
                let _ = self.allocator.free(chunk as *mut u8);
                (*h).stat.free_size -= (*class).size - SLAB_CHUNK_SIZE;
                (*h).stat.chunk_count -= 1;
                freed += (*class).size;
                if freed >= chunk_size * SLAB_RECOVER_FACTOR {
                    return Recover::Progress;
                }
            }
        }

        (*h).stat.recover_failed += 1;
        if space_flag {
            Recover::Partial
        } else {
            Recover::NoSpace
        }
    }

    /// Allocate a chunk covering `req_size` bytes.  Returns the payload
    /// pointer and the size reported per `alloc_type`.
    pub fn alloc(
        &self,
        alloc_type: SlabAllocType,
        req_size: usize,
    ) -> Result<(*mut u8, usize), SlabError> {
        let h = self.h;
        unsafe {
            let id = match Self::clsid(h, req_size, true) {
                Some(id) => id,
                None => return Err(SlabError::AllocInvalidId),
            };
            let class = (*h).classes.add(id);
            let chunk_size = (*class).size;

            let mut chunk = (*class).free_list;
            if chunk.is_null() {
                loop {
                    match self.allocator.alloc(chunk_size) {
                        Ok(p) => {
                            chunk = p as *mut ChunkLink;
                            break;
                        }
                        Err(_) => match self.recover(chunk_size, id) {
                            Recover::NoSpace => {
                                (*h).stat.failed += 1;
                                return Err(SlabError::AllocNoSpace);
                            }
                            Recover::Progress | Recover::Partial => continue,
                        },
                    }
                }
                (*h).stat.chunk_count += 1;
                (*chunk).size = chunk_size - SLAB_CHUNK_SIZE;
            } else {
                (*class).free_list = (*chunk).next;
                (*h).stat.free_size -= (*chunk).size;
            }

            (*chunk).id = id as isize;
            let slab_size = match alloc_type {
                SlabAllocType::Req => req_size,
                SlabAllocType::Act => (*chunk).size,
            };
            (*chunk).req_size = slab_size;
            (*h).stat.reqs_size += slab_size;
            (*h).stat.used_size += (*chunk).size;

            Ok((chunk.add(1) as *mut u8, slab_size))
        }
    }

    /// Forward to the allocator's `split_alloc` and tag the chunk so
    /// `free` routes it straight back instead of onto a class freelist.
    pub fn split_alloc(
        &self,
        req_size: usize,
        req_minsize: usize,
    ) -> Result<(*mut u8, usize), SlabError> {
        let h = self.h;
        if req_size == 0 {
            return Err(SlabError::SplitAllocParam);
        }
        if !self.allocator.supports_split_alloc() {
            return Err(SlabError::SplitAllocNotSupported);
        }
        unsafe {
            let chunk_size = align_up(req_size + SLAB_CHUNK_SIZE, ALIGN_SIZE);
            if chunk_size > (*(*h).classes.add((*h).free_len - 1)).size {
                return Err(SlabError::SplitAllocChunkSizeTooLarge);
            }
            let minsize = align_up(req_minsize + SLAB_CHUNK_SIZE, ALIGN_SIZE);

            let (ptr, act_size) = match self.allocator.split_alloc(minsize) {
                Ok(r) => r,
                Err(e) => {
                    (*h).stat.split_failed += 1;
                    return Err(SlabError::Allocator(e));
                }
            };

            let chunk = ptr as *mut ChunkLink;
            (*chunk).id = SLAB_SPLIT_ID;
            (*chunk).size = act_size - SLAB_CHUNK_SIZE;
            (*h).stat.chunk_count += 1;
            if req_size >= (*chunk).size {
                (*chunk).req_size = (*chunk).size;
            } else {
                (*chunk).req_size = req_size;
            }
            (*h).stat.reqs_size += (*chunk).req_size;
            (*h).stat.used_size += (*chunk).size;

            Ok((chunk.add(1) as *mut u8, (*chunk).size))
        }
    }

    /// Return a chunk: split chunks go back to the allocator, the rest
    /// park on their class freelist.
    pub fn free(&self, ptr: *mut u8) -> Result<(), SlabError> {
        let h = self.h;
        if ptr.is_null() {
            return Err(SlabError::FreeChunkId);
        }
        unsafe {
            let chunk = (ptr as *mut ChunkLink).sub(1);

            if (*chunk).id == SLAB_SPLIT_ID {
                (*h).stat.chunk_count -= 1;
                (*h).stat.used_size -= (*chunk).size;
                (*h).stat.reqs_size -= (*chunk).req_size;
                return self
                    .allocator
                    .free(chunk as *mut u8)
                    .map_err(SlabError::Allocator);
            }

            if (*chunk).id < 0 || (*chunk).id as usize >= (*h).free_len {
                return Err(SlabError::FreeChunkId);
            }
            let class = (*h).classes.add((*chunk).id as usize);
            (*chunk).next = (*class).free_list;
            (*class).free_list = chunk;

            // Accounting must not underflow; a chunk bigger than the
            // outstanding total means the header was clobbered.
            if (*h).stat.used_size < (*chunk).size {
                return Err(SlabError::FreeChunkId);
            }

            (*h).stat.free_size += (*chunk).size;
            (*h).stat.used_size -= (*chunk).size;
            (*h).stat.reqs_size -= (*chunk).req_size;
        }
        Ok(())
    }

    /// Statistics snapshot; `chunk_size` is derived from the live chunk
    /// count.
    pub fn stat(&self) -> SlabStat {
        unsafe {
            let mut stat = (*self.h).stat;
            stat.chunk_size = stat.chunk_count * SLAB_CHUNK_SIZE;
            stat
        }
    }

    /// Total header bytes across live chunks.
    pub fn chunk_overhead(&self) -> usize {
        unsafe { (*self.h).stat.chunk_count * SLAB_CHUNK_SIZE }
    }
}
