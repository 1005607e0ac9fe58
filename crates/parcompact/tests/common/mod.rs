//! Shared helpers: random object graphs with a model of what they should
//! look like after a collection.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};

use parcompact::{HeaderLayout, Heap, HeapWord, ObjectModel, RootSet, SpaceId};

/// Region size used by the tests, in words.
pub const R: usize = 64;

/// Deterministic xorshift generator.
pub struct Rng(u64);

impl Rng {
    pub const fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// What an object should look like, independent of where it lives.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: HeapWord,
    pub refs: Vec<Option<usize>>,
    pub data: usize,
}

impl Node {
    pub const fn words(&self) -> usize {
        HeaderLayout::object_words(self.refs.len(), self.data)
    }
}

/// Objects allocated by a test. Data word `i` of object `id` holds
/// `id * 1000 + i`.
#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub roots: Vec<usize>,
}

pub fn data_value(id: usize, i: usize) -> u64 {
    (id as u64) * 1_000 + i as u64
}

impl Graph {
    /// Allocate an object with `refs` null references and `data` data words
    /// (at least one).
    pub fn alloc(&mut self, heap: &Heap, space: SpaceId, refs: usize, data: usize) -> Option<usize> {
        assert!(data >= 1);
        let addr = HeaderLayout::allocate(heap, space, refs, data)?;
        let id = self.nodes.len();
        for i in 0..data {
            HeaderLayout::set_data(heap, addr, i, data_value(id, i));
        }
        self.nodes.push(Node {
            addr,
            refs: vec![None; refs],
            data,
        });
        Some(id)
    }

    /// Point reference `slot` of `from` at `to`.
    pub fn link(&mut self, heap: &Heap, from: usize, slot: usize, to: usize) {
        HeaderLayout::set_ref(heap, self.nodes[from].addr, slot, self.nodes[to].addr);
        self.nodes[from].refs[slot] = Some(to);
    }

    /// Wire every reference slot to a random object (or leave it null).
    pub fn link_randomly(&mut self, heap: &Heap, rng: &mut Rng) {
        let n = self.nodes.len();
        for from in 0..n {
            for slot in 0..self.nodes[from].refs.len() {
                if rng.below(4) != 0 {
                    let to = rng.below(n);
                    self.link(heap, from, slot, to);
                }
            }
        }
    }

    /// Register `id` as a root.
    pub fn root(&mut self, roots: &RootSet, id: usize) -> usize {
        self.roots.push(id);
        roots.push(self.nodes[id].addr)
    }

    /// Indices reachable from the roots.
    pub fn reachable(&self) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                queue.extend(self.nodes[id].refs.iter().flatten().copied());
            }
        }
        seen
    }

    /// Words occupied by reachable objects.
    pub fn live_words(&self) -> usize {
        self.reachable().iter().map(|&id| self.nodes[id].words()).sum()
    }

    /// Walk the heap from `roots` and check that every reachable object has
    /// its contents and references intact. Updates each node's address.
    /// Returns the ids found.
    pub fn verify(&mut self, heap: &Heap, roots: &RootSet) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for (idx, &id) in self.roots.iter().enumerate() {
            queue.push_back((roots.get(idx), id));
        }
        while let Some((addr, expected)) = queue.pop_front() {
            assert!(heap.contains(addr), "reference {addr} outside the heap");
            let id = (HeaderLayout::get_data(heap, addr, 0) / 1_000) as usize;
            assert_eq!(id, expected, "object at {addr} has the wrong identity");
            if !seen.insert(id) {
                assert_eq!(self.nodes[id].addr, addr, "object {id} seen at two addresses");
                continue;
            }
            self.nodes[id].addr = addr;
            let node = &self.nodes[id];
            assert_eq!(HeaderLayout.size_of(heap, addr), node.words());
            assert_eq!(HeaderLayout::ref_count(heap, addr), node.refs.len());
            for i in 0..node.data {
                assert_eq!(HeaderLayout::get_data(heap, addr, i), data_value(id, i));
            }
            for (slot, target) in node.refs.iter().enumerate() {
                let referent = HeaderLayout::get_ref(heap, addr, slot);
                match target {
                    Some(to) => queue.push_back((referent, *to)),
                    None => assert!(referent.is_null(), "slot {slot} of {id} should be null"),
                }
            }
        }
        seen
    }
}

/// Check that `[bottom, top)` of every space is a sequence of objects.
pub fn assert_parsable(heap: &Heap) {
    for space in heap.spaces() {
        let mut addr = space.bottom();
        while addr < space.top() {
            let size = HeaderLayout.size_of(heap, addr);
            assert!(size >= HeaderLayout::HEADER_WORDS, "bad object at {addr}");
            addr += size;
        }
        assert_eq!(addr, space.top(), "{} space is not parsable", space.id().name());
    }
}
