//! One independently locked LIRS segment.
//!
//! Entries live in an index arena. Three sentinel slots anchor the
//! recency stack, the resident cold queue and the non-resident queue; all
//! links are arena indices so the structure needs no unsafe code.
//!
//! An entry is hot when it is not linked into any queue. Resident entries
//! carry a value, non-resident (ghost) entries keep only their key.

use std::borrow::Borrow;

pub(crate) const NIL: usize = usize::MAX;

const STACK: usize = 0;
const QUEUE: usize = 1;
const QUEUE2: usize = 2;
const SENTINELS: usize = 3;

/// Initial bucket count of a segment.
const INITIAL_BUCKETS: usize = 16;

/// Largest bucket array a segment grows to.
const MAX_BUCKETS: usize = 1 << 28;

struct Entry<K, V> {
    key: Option<K>,
    value: Option<V>,
    hash: u64,
    memory: usize,
    /// Stack move counter value when the entry was last moved to the top.
    top_move: u64,
    stack_prev: usize,
    stack_next: usize,
    queue_prev: usize,
    queue_next: usize,
    map_next: usize,
}

impl<K, V> Entry<K, V> {
    fn vacant() -> Self {
        Self {
            key: None,
            value: None,
            hash: 0,
            memory: 0,
            top_move: 0,
            stack_prev: NIL,
            stack_next: NIL,
            queue_prev: NIL,
            queue_next: NIL,
            map_next: NIL,
        }
    }

    #[inline]
    fn is_hot(&self) -> bool {
        self.queue_next == NIL
    }
}

pub(crate) struct Segment<K, V> {
    entries: Vec<Entry<K, V>>,
    free: Vec<usize>,
    buckets: Vec<usize>,
    mask: usize,
    /// Entries in the map, resident or not.
    map_size: usize,
    stack_size: usize,
    queue_size: usize,
    queue2_size: usize,
    used_memory: usize,
    max_memory: usize,
    stack_move_distance: u64,
    non_resident_queue_size: usize,
    stack_move_counter: u64,
    pub(crate) hits: u64,
    pub(crate) misses: u64,
}

impl<K: Eq, V> Segment<K, V> {
    pub(crate) fn new(
        max_memory: usize,
        stack_move_distance: u64,
        non_resident_queue_size: usize,
    ) -> Self {
        let mut entries = Vec::with_capacity(SENTINELS);
        let mut stack = Entry::vacant();
        stack.stack_prev = STACK;
        stack.stack_next = STACK;
        entries.push(stack);
        for q in [QUEUE, QUEUE2] {
            let mut queue = Entry::vacant();
            queue.queue_prev = q;
            queue.queue_next = q;
            entries.push(queue);
        }
        Self {
            entries,
            free: Vec::new(),
            buckets: vec![NIL; INITIAL_BUCKETS],
            mask: INITIAL_BUCKETS - 1,
            map_size: 0,
            stack_size: 0,
            queue_size: 0,
            queue2_size: 0,
            used_memory: 0,
            max_memory: max_memory.max(1),
            stack_move_distance,
            non_resident_queue_size,
            stack_move_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.used_memory
    }

    pub(crate) fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Resident entries.
    pub(crate) fn resident(&self) -> usize {
        self.map_size - self.queue2_size
    }

    pub(crate) fn non_resident(&self) -> usize {
        self.queue2_size
    }

    pub(crate) fn hot(&self) -> usize {
        self.map_size - self.queue_size - self.queue2_size
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.mask + 1
    }

    fn find<Q>(&self, key: &Q, hash: u64) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut idx = self.buckets[hash as usize & self.mask];
        while idx != NIL {
            let e = &self.entries[idx];
            if e.hash == hash && e.key.as_ref().map(|k| k.borrow() == key).unwrap_or(false) {
                return idx;
            }
            idx = e.map_next;
        }
        NIL
    }

    /// Looks up a resident value and records the access.
    pub(crate) fn get<Q>(&mut self, key: &Q, hash: u64) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let idx = self.find(key, hash);
        if idx == NIL || self.entries[idx].value.is_none() {
            self.misses += 1;
            return None;
        }
        self.access(idx);
        self.hits += 1;
        self.entries[idx].value.as_ref()
    }

    /// Looks up a resident value without touching recency.
    pub(crate) fn peek<Q>(&self, key: &Q, hash: u64) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let idx = self.find(key, hash);
        if idx == NIL {
            return None;
        }
        self.entries[idx].value.as_ref()
    }

    /// Adds or replaces an entry. Returns the previous resident value.
    pub(crate) fn put(&mut self, key: K, hash: u64, value: V, memory: usize) -> Option<V> {
        let existing = self.find(&key, hash);
        let existed = existing != NIL;
        let old = if existed {
            self.remove_entry(existing)
        } else {
            None
        };
        if memory > self.max_memory {
            // larger than the whole segment, never cached
            return old;
        }

        let idx = self.alloc(key, hash, value, memory);
        let bucket = hash as usize & self.mask;
        self.entries[idx].map_next = self.buckets[bucket];
        self.buckets[bucket] = idx;
        self.used_memory += memory;
        if self.used_memory > self.max_memory {
            self.evict();
            // a full cache admits new entries as cold
            if self.stack_size > 0 {
                self.add_to_queue(QUEUE, idx);
            }
        }
        self.map_size += 1;
        self.add_to_stack(idx);
        if existed {
            // re-referenced keys, even ghosts, become hot
            self.access(idx);
        }
        old
    }

    /// Removes an entry. Returns its value if it was resident.
    pub(crate) fn remove<Q>(&mut self, key: &Q, hash: u64) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let idx = self.find(key, hash);
        if idx == NIL {
            return None;
        }
        self.remove_entry(idx)
    }

    /// Lowers or raises the memory budget, evicting as needed.
    pub(crate) fn set_max_memory(&mut self, max_memory: usize) {
        self.max_memory = max_memory.max(1);
        if self.used_memory > self.max_memory {
            self.evict();
        }
    }

    pub(crate) fn clear(&mut self) {
        let max_memory = self.max_memory;
        let (distance, nr) = (self.stack_move_distance, self.non_resident_queue_size);
        let (hits, misses) = (self.hits, self.misses);
        *self = Segment::new(max_memory, distance, nr);
        self.hits = hits;
        self.misses = misses;
    }

    /// Returns the bucket count the table should be resized to, if any.
    pub(crate) fn new_map_len(&self) -> Option<usize> {
        let len = self.mask + 1;
        if len * 3 < self.map_size * 4 && len < MAX_BUCKETS {
            Some(len << 1)
        } else if len > 32 && len / 8 > self.map_size {
            Some(len >> 1)
        } else {
            None
        }
    }

    /// Rebuilds the bucket array with `len` buckets.
    pub(crate) fn rehash(&mut self, len: usize) {
        debug_assert!(len.is_power_of_two());
        self.buckets = vec![NIL; len];
        self.mask = len - 1;
        for idx in SENTINELS..self.entries.len() {
            if self.entries[idx].key.is_none() {
                continue;
            }
            let bucket = self.entries[idx].hash as usize & self.mask;
            self.entries[idx].map_next = self.buckets[bucket];
            self.buckets[bucket] = idx;
        }
    }

    pub(crate) fn hot_keys(&self) -> Vec<&K> {
        let mut keys = Vec::new();
        let mut idx = self.entries[STACK].stack_next;
        while idx != STACK {
            let e = &self.entries[idx];
            if e.is_hot() {
                if let Some(k) = e.key.as_ref() {
                    keys.push(k);
                }
            }
            idx = e.stack_next;
        }
        keys
    }

    pub(crate) fn queue_keys(&self, non_resident: bool) -> Vec<&K> {
        let start = if non_resident { QUEUE2 } else { QUEUE };
        let mut keys = Vec::new();
        let mut idx = self.entries[start].queue_next;
        while idx != start {
            if let Some(k) = self.entries[idx].key.as_ref() {
                keys.push(k);
            }
            idx = self.entries[idx].queue_next;
        }
        keys
    }

    fn alloc(&mut self, key: K, hash: u64, value: V, memory: usize) -> usize {
        let mut entry = Entry::vacant();
        entry.key = Some(key);
        entry.value = Some(value);
        entry.hash = hash;
        entry.memory = memory;
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    fn remove_entry(&mut self, idx: usize) -> Option<V> {
        let bucket = self.entries[idx].hash as usize & self.mask;
        let next = self.entries[idx].map_next;
        if self.buckets[bucket] == idx {
            self.buckets[bucket] = next;
        } else {
            let mut prev = self.buckets[bucket];
            while prev != NIL && self.entries[prev].map_next != idx {
                prev = self.entries[prev].map_next;
            }
            if prev == NIL {
                return None;
            }
            self.entries[prev].map_next = next;
        }

        self.map_size -= 1;
        self.used_memory -= self.entries[idx].memory;
        if self.entries[idx].stack_next != NIL {
            self.remove_from_stack(idx);
        }
        if self.entries[idx].is_hot() {
            // the newest cold entry takes the place of the removed hot one
            let first = self.entries[QUEUE].queue_next;
            if first != QUEUE {
                self.remove_from_queue(first);
                if self.entries[first].stack_next == NIL {
                    self.add_to_stack_bottom(first);
                }
            }
            self.prune_stack();
        } else {
            self.remove_from_queue(idx);
        }

        let old = self.entries[idx].value.take();
        self.entries[idx] = Entry::vacant();
        self.free.push(idx);
        old
    }

    fn access(&mut self, idx: usize) {
        if self.entries[idx].is_hot() {
            if idx != self.entries[STACK].stack_next && self.entries[idx].stack_next != NIL {
                let moved = self.stack_move_counter - self.entries[idx].top_move;
                if moved > self.stack_move_distance {
                    let was_end = idx == self.entries[STACK].stack_prev;
                    self.remove_from_stack(idx);
                    if was_end {
                        // the new stack bottom may be cold
                        self.prune_stack();
                    }
                    self.add_to_stack(idx);
                }
            }
        } else if self.entries[idx].value.is_some() {
            self.remove_from_queue(idx);
            if self.entries[idx].stack_next != NIL {
                // cold entries still on the stack become hot, so one hot entry turns cold
                self.remove_from_stack(idx);
                self.convert_oldest_hot_to_cold();
            } else {
                self.add_to_queue(QUEUE, idx);
            }
            self.add_to_stack(idx);
            self.prune_stack();
        }
    }

    fn evict(&mut self) {
        loop {
            self.evict_block();
            if self.used_memory <= self.max_memory || (self.queue_size == 0 && self.stack_size == 0)
            {
                break;
            }
        }
    }

    fn evict_block(&mut self) {
        while self.queue_size <= (self.resident() >> 5) && self.stack_size > 0 {
            if !self.convert_oldest_hot_to_cold() {
                break;
            }
        }
        while self.used_memory > self.max_memory && self.queue_size > 0 {
            let idx = self.entries[QUEUE].queue_prev;
            self.used_memory -= self.entries[idx].memory;
            self.remove_from_queue(idx);
            self.entries[idx].value = None;
            self.entries[idx].memory = 0;
            self.add_to_queue(QUEUE2, idx);
            self.trim_non_resident_queue();
        }
    }

    fn trim_non_resident_queue(&mut self) {
        let max_queue2 = self.non_resident_queue_size * self.resident();
        while self.queue2_size > max_queue2 {
            let idx = self.entries[QUEUE2].queue_prev;
            self.remove_entry(idx);
        }
    }

    fn convert_oldest_hot_to_cold(&mut self) -> bool {
        let last = self.entries[STACK].stack_prev;
        if last == STACK {
            return false;
        }
        self.remove_from_stack(last);
        self.add_to_queue(QUEUE, last);
        self.prune_stack();
        true
    }

    /// Drops cold entries from the bottom so the stack always ends with a hot one.
    fn prune_stack(&mut self) {
        loop {
            let last = self.entries[STACK].stack_prev;
            if self.entries[last].is_hot() {
                break;
            }
            self.remove_from_stack(last);
        }
    }

    fn add_to_stack(&mut self, idx: usize) {
        let top = self.entries[STACK].stack_next;
        self.entries[idx].stack_prev = STACK;
        self.entries[idx].stack_next = top;
        self.entries[top].stack_prev = idx;
        self.entries[STACK].stack_next = idx;
        self.stack_size += 1;
        self.entries[idx].top_move = self.stack_move_counter;
        self.stack_move_counter += 1;
    }

    fn add_to_stack_bottom(&mut self, idx: usize) {
        let bottom = self.entries[STACK].stack_prev;
        self.entries[idx].stack_next = STACK;
        self.entries[idx].stack_prev = bottom;
        self.entries[bottom].stack_next = idx;
        self.entries[STACK].stack_prev = idx;
        self.stack_size += 1;
    }

    fn remove_from_stack(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].stack_prev, self.entries[idx].stack_next);
        self.entries[prev].stack_next = next;
        self.entries[next].stack_prev = prev;
        self.entries[idx].stack_prev = NIL;
        self.entries[idx].stack_next = NIL;
        self.stack_size -= 1;
    }

    fn add_to_queue(&mut self, queue: usize, idx: usize) {
        let first = self.entries[queue].queue_next;
        self.entries[idx].queue_prev = queue;
        self.entries[idx].queue_next = first;
        self.entries[first].queue_prev = idx;
        self.entries[queue].queue_next = idx;
        if self.entries[idx].value.is_some() {
            self.queue_size += 1;
        } else {
            self.queue2_size += 1;
        }
    }

    fn remove_from_queue(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].queue_prev, self.entries[idx].queue_next);
        self.entries[prev].queue_next = next;
        self.entries[next].queue_prev = prev;
        self.entries[idx].queue_prev = NIL;
        self.entries[idx].queue_next = NIL;
        if self.entries[idx].value.is_some() {
            self.queue_size -= 1;
        } else {
            self.queue2_size -= 1;
        }
    }
}
