//! Slab-backed doubly linked lists for the window and the two SLRU segments.
//!
//! All three lists share one slab so an entry can move between segments
//! without reallocating; links are slab indices.

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Window,
    Probation,
    Protected,
}

#[derive(Debug)]
pub(crate) struct StoreItem<V> {
    pub key_hash: u64,
    pub conflict: u64,
    pub stage: Stage,
    pub value: V,
}

#[derive(Debug)]
struct Slot<V> {
    item: StoreItem<V>,
    prev: usize,
    next: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct List {
    head: usize,
    tail: usize,
    len: usize,
}

impl List {
    pub fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn back(&self) -> Option<usize> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }
}

#[derive(Debug)]
pub(crate) struct Slab<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
}

impl<V> Slab<V> {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            slots: Vec::with_capacity(n),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, item: StoreItem<V>) -> usize {
        let slot = Some(Slot {
            item,
            prev: NIL,
            next: NIL,
        });
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    /// Frees a slot that has already been unlinked.
    pub fn take(&mut self, idx: usize) -> StoreItem<V> {
        match self.slots[idx].take() {
            Some(slot) => {
                self.free.push(idx);
                slot.item
            }
            None => panic!("cache slot {} is vacant", idx),
        }
    }

    pub fn item(&self, idx: usize) -> &StoreItem<V> {
        &self.slot(idx).item
    }

    pub fn item_mut(&mut self, idx: usize) -> &mut StoreItem<V> {
        &mut self.slot_mut(idx).item
    }

    /// Exchanges the items held by two slots, keeping their list positions.
    pub fn swap_items(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.slots.split_at_mut(hi);
        match (left[lo].as_mut(), right[0].as_mut()) {
            (Some(x), Some(y)) => std::mem::swap(&mut x.item, &mut y.item),
            _ => panic!("cache slots {} and {} must both be occupied", a, b),
        }
    }

    pub fn push_front(&mut self, list: &mut List, idx: usize) {
        let old_head = list.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slot_mut(old_head).prev = idx;
        } else {
            list.tail = idx;
        }
        list.head = idx;
        list.len += 1;
    }

    pub fn unlink(&mut self, list: &mut List, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slot_mut(prev).next = next;
        } else {
            list.head = next;
        }
        if next != NIL {
            self.slot_mut(next).prev = prev;
        } else {
            list.tail = prev;
        }
        let slot = self.slot_mut(idx);
        slot.prev = NIL;
        slot.next = NIL;
        list.len -= 1;
    }

    pub fn move_to_front(&mut self, list: &mut List, idx: usize) {
        if list.head == idx {
            return;
        }
        self.unlink(list, idx);
        self.push_front(list, idx);
    }

    fn slot(&self, idx: usize) -> &Slot<V> {
        match self.slots[idx].as_ref() {
            Some(slot) => slot,
            None => panic!("cache slot {} is vacant", idx),
        }
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<V> {
        match self.slots[idx].as_mut() {
            Some(slot) => slot,
            None => panic!("cache slot {} is vacant", idx),
        }
    }
}
