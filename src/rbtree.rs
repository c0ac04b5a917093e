// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Intrusive red-black tree with an external sentinel.  Nodes are embedded
// in their owners (timer nodes inside events), so insert/delete never
// allocate.  The insert order is pluggable; the stock `insert_timer_value`
// compares keys as a signed difference so millisecond clocks that wrap
// stay ordered.

use std::ptr;

pub type RbtreeKey = i64;

const RED: u8 = 1;
const BLACK: u8 = 0;

/// Node embedded in the owning structure.
#[repr(C)]
pub struct RbtreeNode {
    pub key: RbtreeKey,
    left: *mut RbtreeNode,
    right: *mut RbtreeNode,
    parent: *mut RbtreeNode,
    color: u8,
}

impl RbtreeNode {
    pub const fn new() -> Self {
        Self {
            key: 0,
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            color: BLACK,
        }
    }
}

/// Places `node` under `temp` by key order.  Runs with the tree locked in
/// the structural sense: only pointer writes, no rebalancing (the caller
/// rebalances afterwards).
pub type RbtreeInsertFn =
    unsafe fn(temp: *mut RbtreeNode, node: *mut RbtreeNode, sentinel: *mut RbtreeNode);

/// The tree head.  `sentinel` stands in for every absent child.
pub struct Rbtree {
    root: *mut RbtreeNode,
    sentinel: *mut RbtreeNode,
    insert: RbtreeInsertFn,
}

unsafe fn is_red(n: *mut RbtreeNode) -> bool {
    (*n).color == RED
}

unsafe fn set_red(n: *mut RbtreeNode) {
    (*n).color = RED;
}

unsafe fn set_black(n: *mut RbtreeNode) {
    (*n).color = BLACK;
}

unsafe fn copy_color(dst: *mut RbtreeNode, src: *mut RbtreeNode) {
    (*dst).color = (*src).color;
}

/// Signed-difference ordering for timer keys.
///
/// # Safety
/// Standard intrusive contract: all three nodes valid, `node` unlinked.
pub unsafe fn rbtree_insert_timer_value(
    mut temp: *mut RbtreeNode,
    node: *mut RbtreeNode,
    sentinel: *mut RbtreeNode,
) {
    loop {
        let p = if ((*node).key - (*temp).key) < 0 {
            &mut (*temp).left
        } else {
            &mut (*temp).right
        };
        if *p == sentinel {
            *p = node;
            break;
        }
        temp = *p;
    }
    (*node).parent = temp;
    (*node).left = sentinel;
    (*node).right = sentinel;
    set_red(node);
}

impl Rbtree {
    /// # Safety
    /// `sentinel` must stay valid and pinned for the life of the tree.
    pub unsafe fn init(sentinel: *mut RbtreeNode, insert: RbtreeInsertFn) -> Self {
        set_black(sentinel);
        Self {
            root: sentinel,
            sentinel,
            insert,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == self.sentinel
    }

    /// Smallest-key node, or the sentinel when empty.
    pub fn min(&self) -> *mut RbtreeNode {
        unsafe {
            let mut node = self.root;
            if node == self.sentinel {
                return self.sentinel;
            }
            while (*node).left != self.sentinel {
                node = (*node).left;
            }
            node
        }
    }

    pub fn sentinel(&self) -> *mut RbtreeNode {
        self.sentinel
    }

    unsafe fn left_rotate(&mut self, node: *mut RbtreeNode) {
        let temp = (*node).right;
        (*node).right = (*temp).left;
        if (*temp).left != self.sentinel {
            (*(*temp).left).parent = node;
        }
        (*temp).parent = (*node).parent;
        if node == self.root {
            self.root = temp;
        } else if node == (*(*node).parent).left {
            (*(*node).parent).left = temp;
        } else {
            (*(*node).parent).right = temp;
        }
        (*temp).left = node;
        (*node).parent = temp;
    }

    unsafe fn right_rotate(&mut self, node: *mut RbtreeNode) {
        let temp = (*node).left;
        (*node).left = (*temp).right;
        if (*temp).right != self.sentinel {
            (*(*temp).right).parent = node;
        }
        (*temp).parent = (*node).parent;
        if node == self.root {
            self.root = temp;
        } else if node == (*(*node).parent).right {
            (*(*node).parent).right = temp;
        } else {
            (*(*node).parent).left = temp;
        }
        (*temp).right = node;
        (*node).parent = temp;
    }

    /// # Safety
    /// `node` must be valid and not currently on any tree.
    pub unsafe fn insert(&mut self, node: *mut RbtreeNode) {
        if self.root == self.sentinel {
            (*node).parent = ptr::null_mut();
            (*node).left = self.sentinel;
            (*node).right = self.sentinel;
            set_black(node);
            self.root = node;
            return;
        }

        (self.insert)(self.root, node, self.sentinel);

        let mut node = node;
        while node != self.root && is_red((*node).parent) {
            let parent = (*node).parent;
            let grand = (*parent).parent;
            if parent == (*grand).left {
                let uncle = (*grand).right;
                if is_red(uncle) {
                    set_black(parent);
                    set_black(uncle);
                    set_red(grand);
                    node = grand;
                } else {
                    if node == (*parent).right {
                        node = parent;
                        self.left_rotate(node);
                    }
                    let parent = (*node).parent;
                    let grand = (*parent).parent;
                    set_black(parent);
                    set_red(grand);
                    self.right_rotate(grand);
                }
            } else {
                let uncle = (*grand).left;
                if is_red(uncle) {
                    set_black(parent);
                    set_black(uncle);
                    set_red(grand);
                    node = grand;
                } else {
                    if node == (*parent).left {
                        node = parent;
                        self.right_rotate(node);
                    }
                    let parent = (*node).parent;
                    let grand = (*parent).parent;
                    set_black(parent);
                    set_red(grand);
                    self.left_rotate(grand);
                }
            }
        }
        set_black(self.root);
    }

    /// # Safety
    /// `node` must currently be on this tree.
    pub unsafe fn delete(&mut self, node: *mut RbtreeNode) {
        let sentinel = self.sentinel;

        let (subst, temp) = if (*node).left == sentinel {
            (node, (*node).right)
        } else if (*node).right == sentinel {
            (node, (*node).left)
        } else {
            let mut subst = (*node).right;
            while (*subst).left != sentinel {
                subst = (*subst).left;
            }
            (subst, (*subst).right)
        };

        if subst == self.root {
            self.root = temp;
            set_black(temp);
            (*node).left = ptr::null_mut();
            (*node).right = ptr::null_mut();
            (*node).parent = ptr::null_mut();
            return;
        }

        let red = is_red(subst);

        if subst == (*(*subst).parent).left {
            (*(*subst).parent).left = temp;
        } else {
            (*(*subst).parent).right = temp;
        }

        if subst == node {
            (*temp).parent = (*subst).parent;
        } else {
            if (*subst).parent == node {
                (*temp).parent = subst;
            } else {
                (*temp).parent = (*subst).parent;
            }
            (*subst).left = (*node).left;
            (*subst).right = (*node).right;
            (*subst).parent = (*node).parent;
            copy_color(subst, node);

            if node == self.root {
                self.root = subst;
            } else if node == (*(*node).parent).left {
                (*(*node).parent).left = subst;
            } else {
                (*(*node).parent).right = subst;
            }

            if (*subst).left != sentinel {
                (*(*subst).left).parent = subst;
            }
            if (*subst).right != sentinel {
                (*(*subst).right).parent = subst;
            }
        }

        (*node).left = ptr::null_mut();
        (*node).right = ptr::null_mut();
        (*node).parent = ptr::null_mut();

        if red {
            return;
        }

        let mut temp = temp;
        while temp != self.root && !is_red(temp) {
            if temp == (*(*temp).parent).left {
                let mut w = (*(*temp).parent).right;
                if is_red(w) {
                    set_black(w);
                    set_red((*temp).parent);
                    self.left_rotate((*temp).parent);
                    w = (*(*temp).parent).right;
                }
                if !is_red((*w).left) && !is_red((*w).right) {
                    set_red(w);
                    temp = (*temp).parent;
                } else {
                    if !is_red((*w).right) {
                        set_black((*w).left);
                        set_red(w);
                        self.right_rotate(w);
                        w = (*(*temp).parent).right;
                    }
                    copy_color(w, (*temp).parent);
                    set_black((*temp).parent);
                    set_black((*w).right);
                    self.left_rotate((*temp).parent);
                    temp = self.root;
                }
            } else {
                let mut w = (*(*temp).parent).left;
                if is_red(w) {
                    set_black(w);
                    set_red((*temp).parent);
                    self.right_rotate((*temp).parent);
                    w = (*(*temp).parent).left;
                }
                if !is_red((*w).left) && !is_red((*w).right) {
                    set_red(w);
                    temp = (*temp).parent;
                } else {
                    if !is_red((*w).left) {
                        set_black((*w).right);
                        set_red(w);
                        self.left_rotate(w);
                        w = (*(*temp).parent).left;
                    }
                    copy_color(w, (*temp).parent);
                    set_black((*temp).parent);
                    set_black((*w).left);
                    self.right_rotate((*temp).parent);
                    temp = self.root;
                }
            }
        }
        set_black(temp);
    }
}
