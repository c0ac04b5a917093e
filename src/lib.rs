// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Foundation library for single-host network servers: a two-tier memory
// subsystem (shared-memory segmented-fit allocator + slab cache, arena
// pools for connection lifetimes) and an edge-triggered event reactor
// with timers, a connection pool and chained vectored I/O.

pub mod queue;
pub mod rbtree;

pub mod alloc;
pub mod shmem;
pub mod pool;
pub mod commpool;
pub mod slabs;

pub mod atomic_lock;
pub mod process_lock;
pub mod hashtable;

pub mod event;
pub mod epoll;
pub mod timer;

pub mod buffer;
pub mod chain;
pub mod sysio;
pub mod conn;
pub mod listen;
pub mod conn_pool;

pub mod notice;
pub mod pipe;
pub mod channel;

pub use alloc::{AllocError, AllocStat, MemAllocator};
pub use atomic_lock::AtomicLock;
pub use commpool::CommPool;
pub use conn::{Conn, ConnPeer, ConnectStatus};
pub use conn_pool::ConnPool;
pub use epoll::EventBase;
pub use event::Event;
pub use hashtable::Hashtable;
pub use pool::PoolAllocator;
pub use process_lock::{LockError, ProcessLock, ProcessRwlock};
pub use shmem::{Shmem, ShmemError, ShmemLevel, ShmemStat};
pub use slabs::{SlabAllocType, SlabError, SlabStat, SlabUptype, Slabs};
pub use timer::EventTimer;
