// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Intrusive hash table tests: join/lookup/remove with caller-owned
// links, bucket access, and the stock hash functions.

use libsrv::hashtable::{
    hashtable_cmp_bytes, hashtable_hash_hash4, hashtable_hash_key8, hashtable_hash_low,
    Hashtable, HashtableLink,
};
use libsrv::shmem::{Shmem, ShmemLevel};

struct Entry {
    link: HashtableLink,
    key: Vec<u8>,
    value: u32,
}

impl Entry {
    fn new(key: &[u8], value: u32) -> Box<Entry> {
        let mut e = Box::new(Entry {
            link: HashtableLink::new(),
            key: key.to_vec(),
            value,
        });
        e.link.key = e.key.as_ptr();
        e.link.len = e.key.len();
        e
    }
}

fn entry_of(link: *mut HashtableLink) -> *mut Entry {
    unsafe { (link as *mut u8).sub(std::mem::offset_of!(Entry, link)) as *mut Entry }
}

fn shmem() -> Shmem {
    Shmem::create(1 << 20, 64, 64 << 10, ShmemLevel::Exp, 2).expect("create shmem")
}

#[test]
fn join_lookup_remove() {
    let shm = shmem();
    let mut ht =
        Hashtable::create(&shm, 64, hashtable_hash_key8, hashtable_cmp_bytes).expect("create");

    let mut a = Entry::new(b"alpha", 1);
    let mut b = Entry::new(b"beta", 2);
    let mut c = Entry::new(b"gamma", 3);
    unsafe {
        ht.join(&mut a.link);
        ht.join(&mut b.link);
        ht.join(&mut c.link);
    }
    assert_eq!(ht.len(), 3);
    assert!(!ht.is_empty());

    let found = ht.lookup(b"beta".as_ptr(), 4).expect("beta present");
    assert_eq!(unsafe { (*entry_of(found)).value }, 2);

    assert!(ht.lookup(b"delta".as_ptr(), 5).is_none());

    unsafe {
        assert!(ht.remove_link(&mut b.link));
        assert!(!ht.remove_link(&mut b.link));
    }
    assert!(ht.lookup(b"beta".as_ptr(), 4).is_none());
    assert_eq!(ht.len(), 2);

    ht.free_memory().expect("free table");
    shm.release().expect("release");
}

#[test]
fn colliding_keys_chain_in_one_bucket() {
    let shm = shmem();
    // A tiny table, so the keys collide heavily.
    let mut ht =
        Hashtable::create(&shm, 1, hashtable_hash_key8, hashtable_cmp_bytes).expect("create");

    let mut entries: Vec<Box<Entry>> = (0..16)
        .map(|i| Entry::new(format!("key-{i}").as_bytes(), i))
        .collect();
    for e in entries.iter_mut() {
        unsafe { ht.join(&mut e.link) };
    }

    for i in 0..16u32 {
        let key = format!("key-{i}");
        let found = ht.lookup(key.as_ptr(), key.len()).expect("present");
        assert_eq!(unsafe { (*entry_of(found)).value }, i);
    }

    ht.free_memory().expect("free table");
    shm.release().expect("release");
}

#[test]
fn bucket_count_rounds_to_prime() {
    let shm = shmem();
    let ht = Hashtable::create(&shm, 100, hashtable_hash_key8, hashtable_cmp_bytes)
        .expect("create");
    assert_eq!(ht.bucket_count(), 101);
    ht.free_memory().expect("free table");
    shm.release().expect("release");
}

#[test]
fn get_bucket_bounds() {
    let shm = shmem();
    let mut ht =
        Hashtable::create(&shm, 8, hashtable_hash_key8, hashtable_cmp_bytes).expect("create");
    let size = ht.bucket_count();
    assert!(ht.get_bucket(size).is_none());

    let mut e = Entry::new(b"solo", 9);
    unsafe { ht.join(&mut e.link) };
    let i = hashtable_hash_key8(e.key.as_ptr(), e.key.len(), size);
    assert_eq!(ht.get_bucket(i).expect("head"), &mut e.link as *mut _);

    ht.free_memory().expect("free table");
    shm.release().expect("release");
}

#[test]
fn drain_items_empties_the_table() {
    let shm = shmem();
    let mut ht =
        Hashtable::create(&shm, 16, hashtable_hash_low, hashtable_cmp_bytes).expect("create");

    let mut entries: Vec<Box<Entry>> = (0..8)
        .map(|i| Entry::new(format!("Key{i}").as_bytes(), i))
        .collect();
    for e in entries.iter_mut() {
        unsafe { ht.join(&mut e.link) };
    }

    let mut seen = 0;
    unsafe { ht.drain_items(|_| seen += 1) };
    assert_eq!(seen, 8);
    assert!(ht.is_empty());

    ht.free_memory().expect("free table");
    shm.release().expect("release");
}

#[test]
fn stock_hashes_are_deterministic_and_in_range() {
    for hash in [hashtable_hash_hash4, hashtable_hash_key8, hashtable_hash_low] {
        for key in [&b"a"[..], b"abcdefgh", b"abcdefghij", b"0123456789abcdef"] {
            let h1 = hash(key.as_ptr(), key.len(), 97);
            let h2 = hash(key.as_ptr(), key.len(), 97);
            assert_eq!(h1, h2);
            assert!(h1 < 97);
        }
    }
    // The case-folding hash treats case variants alike.
    assert_eq!(
        hashtable_hash_low(b"MiXeD".as_ptr(), 5, 97),
        hashtable_hash_low(b"mixed".as_ptr(), 5, 97)
    );
}
