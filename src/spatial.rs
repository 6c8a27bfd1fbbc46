//! A concurrent spatial index over moving 2D objects: a doubly-linked list
//! kept sorted on x, supporting O(k) neighborhood queries bounded by L∞
//! distance. y is carried but not indexed; it only filters queries.
//!
//! Nodes live in an arena and are linked by index, so no pointers ever cross
//! the lock boundary. The tracker borrows its entries: the owner of a
//! [`NeighborRef`] must call [`NeighborTracker::detach`] (or at least
//! [`NeighborTracker::remove`]) before discarding the handle, otherwise the
//! slot and its payload stay allocated.

use std::sync::{RwLock, RwLockReadGuard};

/// Owner-held handle to a tracked slot. Not clonable; one handle per object.
#[derive(Debug)]
pub struct NeighborRef {
    slot: u32,
}

struct Slot<T> {
    payload: Option<T>,
    x: i32,
    y: i32,
    prev: Option<u32>,
    next: Option<u32>,
    enlisted: bool,
}

struct TrackerState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
}

pub struct NeighborTracker<T> {
    state: RwLock<TrackerState<T>>,
}

impl<T> Default for NeighborTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NeighborTracker<T> {
    pub fn new() -> NeighborTracker<T> {
        NeighborTracker {
            state: RwLock::new(TrackerState {
                slots: Vec::new(),
                free: Vec::new(),
                head: None,
            }),
        }
    }

    /// Allocates a slot for `payload`. The object is not part of the sorted
    /// list until the first [`update`](Self::update).
    pub fn attach(&self, payload: T) -> NeighborRef {
        let mut state = self.state.write().unwrap();
        let slot = Slot {
            payload: Some(payload),
            x: 0,
            y: 0,
            prev: None,
            next: None,
            enlisted: false,
        };
        let index = match state.free.pop() {
            Some(index) => {
                state.slots[index as usize] = slot;
                index
            }
            None => {
                state.slots.push(slot);
                (state.slots.len() - 1) as u32
            }
        };
        NeighborRef { slot: index }
    }

    /// Removes the object from the list and releases its slot, returning the
    /// payload.
    pub fn detach(&self, node: NeighborRef) -> T {
        let mut state = self.state.write().unwrap();
        state.unlink(node.slot);
        state.free.push(node.slot);
        state.slots[node.slot as usize]
            .payload
            .take()
            .expect("detached slot still owns its payload")
    }

    /// Moves the object to `(x, y)`, inserting it into the sorted list on
    /// first use. Subsequent moves walk the list from the old position.
    ///
    /// Membership is decided inside the write critical section, so two
    /// concurrent first updates of the same handle insert exactly once.
    pub fn update(&self, node: &NeighborRef, x: i32, y: i32) {
        let mut state = self.state.write().unwrap();
        if state.slots[node.slot as usize].enlisted {
            state.relocate(node.slot, x, y);
        } else {
            state.insert(node.slot, x, y);
        }
    }

    /// Takes the object out of the sorted list, keeping its slot. Removing a
    /// node that is not enlisted is a no-op.
    pub fn remove(&self, node: &NeighborRef) {
        let mut state = self.state.write().unwrap();
        state.unlink(node.slot);
    }

    /// All enlisted objects within L∞ distance `dist` of `node`, excluding
    /// `node` itself. The returned guard holds the read lock; references
    /// obtained from it are valid until the guard is dropped.
    pub fn get_neighbors(&self, node: &NeighborRef, dist: i32) -> Neighbors<'_, T> {
        let guard = self.state.read().unwrap();
        let mut found = Vec::new();

        let slot = &guard.slots[node.slot as usize];
        if slot.enlisted {
            let (x, y) = (slot.x, slot.y);

            let mut cursor = slot.prev;
            while let Some(i) = cursor {
                let s = &guard.slots[i as usize];
                if x - s.x > dist {
                    break;
                }
                if (y - s.y).abs() <= dist {
                    found.push(i);
                }
                cursor = s.prev;
            }

            let mut cursor = slot.next;
            while let Some(i) = cursor {
                let s = &guard.slots[i as usize];
                if s.x - x > dist {
                    break;
                }
                if (y - s.y).abs() <= dist {
                    found.push(i);
                }
                cursor = s.next;
            }
        }

        Neighbors { guard, found }
    }

    #[cfg(test)]
    fn walk_x(&self) -> Vec<i32> {
        let state = self.state.read().unwrap();
        let mut xs = Vec::new();
        let mut cursor = state.head;
        while let Some(i) = cursor {
            xs.push(state.slots[i as usize].x);
            cursor = state.slots[i as usize].next;
        }
        xs
    }
}

impl<T> TrackerState<T> {
    fn unlink(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if !slot.enlisted {
            return;
        }
        slot.enlisted = false;
        let (prev, next) = (slot.prev, slot.next);
        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
    }

    fn insert(&mut self, index: u32, x: i32, y: i32) {
        {
            let slot = &mut self.slots[index as usize];
            slot.enlisted = true;
            slot.x = x;
            slot.y = y;
        }

        let Some(head) = self.head else {
            self.head = Some(index);
            let slot = &mut self.slots[index as usize];
            slot.prev = None;
            slot.next = None;
            return;
        };

        if self.slots[head as usize].x >= x {
            self.slots[index as usize].prev = None;
            self.slots[index as usize].next = Some(head);
            self.slots[head as usize].prev = Some(index);
            self.head = Some(index);
            return;
        }

        let mut cursor = head;
        loop {
            match self.slots[cursor as usize].next {
                None => {
                    self.slots[index as usize].prev = Some(cursor);
                    self.slots[index as usize].next = None;
                    self.slots[cursor as usize].next = Some(index);
                    return;
                }
                Some(after) => {
                    if self.slots[after as usize].x >= x {
                        self.slots[index as usize].prev = Some(cursor);
                        self.slots[index as usize].next = Some(after);
                        self.slots[cursor as usize].next = Some(index);
                        self.slots[after as usize].prev = Some(index);
                        return;
                    }
                    cursor = after;
                }
            }
        }
    }

    fn relocate(&mut self, index: u32, x: i32, y: i32) {
        let old_x = self.slots[index as usize].x;
        self.slots[index as usize].x = x;
        self.slots[index as usize].y = y;

        if x > old_x {
            // the immediate right neighbor may now be to the left
            let Some(next) = self.slots[index as usize].next else {
                return;
            };
            if self.slots[next as usize].x >= x {
                return;
            }

            let prev = self.slots[index as usize].prev;
            self.slots[next as usize].prev = prev;
            match prev {
                Some(p) => self.slots[p as usize].next = Some(next),
                None => self.head = Some(next),
            }

            let mut cursor = next;
            loop {
                match self.slots[cursor as usize].next {
                    None => {
                        self.slots[cursor as usize].next = Some(index);
                        self.slots[index as usize].prev = Some(cursor);
                        self.slots[index as usize].next = None;
                        return;
                    }
                    Some(after) => {
                        if self.slots[after as usize].x >= x {
                            self.slots[index as usize].prev = Some(cursor);
                            self.slots[index as usize].next = Some(after);
                            self.slots[cursor as usize].next = Some(index);
                            self.slots[after as usize].prev = Some(index);
                            return;
                        }
                        cursor = after;
                    }
                }
            }
        } else {
            // the immediate left neighbor may now be to the right
            let Some(prev) = self.slots[index as usize].prev else {
                return;
            };
            if self.slots[prev as usize].x <= x {
                return;
            }

            let next = self.slots[index as usize].next;
            self.slots[prev as usize].next = next;
            if let Some(n) = next {
                self.slots[n as usize].prev = Some(prev);
            }

            let mut cursor = prev;
            loop {
                match self.slots[cursor as usize].prev {
                    None => {
                        self.slots[cursor as usize].prev = Some(index);
                        self.slots[index as usize].next = Some(cursor);
                        self.slots[index as usize].prev = None;
                        self.head = Some(index);
                        return;
                    }
                    Some(before) => {
                        if self.slots[before as usize].x <= x {
                            self.slots[index as usize].next = Some(cursor);
                            self.slots[index as usize].prev = Some(before);
                            self.slots[cursor as usize].prev = Some(index);
                            self.slots[before as usize].next = Some(index);
                            return;
                        }
                        cursor = before;
                    }
                }
            }
        }
    }
}

/// Result of a neighborhood query; holds the tracker's read lock.
pub struct Neighbors<'a, T> {
    guard: RwLockReadGuard<'a, TrackerState<T>>,
    found: Vec<u32>,
}

impl<'a, T> Neighbors<'a, T> {
    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.found.iter().map(move |&i| {
            self.guard.slots[i as usize]
                .payload
                .as_ref()
                .expect("enlisted slot owns its payload")
        })
    }
}
