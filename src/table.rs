use std::ops::Index;

use log::debug;

use crate::utils::{mix, MyHash};

#[derive(Clone)]
struct Entry<T> {
    value: T,
    next: usize,
    occupied: bool,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            next: 0,
            occupied: true,
        }
    }
}

/// Hash-consing table with bucket chaining.
///
/// Index 0 is a sentinel and never holds a value, so `0` doubles as the
/// end-of-chain marker. Unlike a fixed-capacity table, the storage grows on
/// demand and the bucket array is doubled once chains get long.
pub struct Table<T> {
    data: Vec<Entry<T>>,
    buckets: Vec<usize>,
    bitmask: u64,
    free: Vec<usize>,
    real_size: usize,
}

impl<T> Table<T>
where
    T: Default,
{
    /// Create a new table with room for `2^bits` values before the first reallocation.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Storage bits should be in the range 0..=31");

        let capacity = 1 << bits;
        let mut data = Vec::with_capacity(capacity);
        // Sentinel:
        data.push(Entry::new(T::default()));

        let buckets_size = 1 << bits.clamp(4, 20);

        Self {
            data,
            buckets: vec![0; buckets_size],
            bitmask: (buckets_size - 1) as u64,
            free: Vec::new(),
            real_size: 0,
        }
    }
}

impl<T> Table<T> {
    /// Number of slots ever allocated (including freed ones and the sentinel).
    pub fn size(&self) -> usize {
        self.data.len()
    }
    /// Number of occupied cells.
    pub fn real_size(&self) -> usize {
        self.real_size
    }
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn value(&self, index: usize) -> &T {
        assert_ne!(index, 0, "Index is 0");
        &self.data[index].value
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        index != 0 && index < self.data.len() && self.data[index].occupied
    }

    fn alloc(&mut self, value: T) -> usize {
        self.real_size += 1;
        match self.free.pop() {
            Some(index) => {
                self.data[index] = Entry::new(value);
                index
            }
            None => {
                self.data.push(Entry::new(value));
                self.data.len() - 1
            }
        }
    }

    /// Iterate over the indices of all occupied cells.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (1..self.data.len()).filter(|&i| self.data[i].occupied)
    }
}

impl<T> Table<T>
where
    T: MyHash + Eq,
{
    fn bucket_index(&self, value: &T) -> usize {
        (mix(value.hash()) & self.bitmask) as usize
    }

    /// Put a value into the table and return its index.
    /// If an equal value is already present, its index is returned instead.
    pub fn put(&mut self, value: T) -> usize {
        let bucket = self.bucket_index(&value);

        let mut index = self.buckets[bucket];
        while index != 0 {
            if self.data[index].value == value {
                return index;
            }
            index = self.data[index].next;
        }

        let i = self.alloc(value);
        self.data[i].next = self.buckets[bucket];
        self.buckets[bucket] = i;

        if self.real_size > 2 * self.buckets.len() {
            self.resize(self.buckets.len() * 2);
        }

        i
    }

    /// Drop every value for which `keep` returns `false`, then relink the chains.
    pub fn retain(&mut self, mut keep: impl FnMut(usize) -> bool) {
        let mut dropped = 0;
        for i in 1..self.data.len() {
            if self.data[i].occupied && !keep(i) {
                self.data[i].occupied = false;
                self.free.push(i);
                dropped += 1;
            }
        }
        self.real_size -= dropped;
        debug!("retain: dropped {} values, {} alive", dropped, self.real_size);
        self.resize(self.buckets.len());
    }

    fn resize(&mut self, num_buckets: usize) {
        debug!("resize: {} -> {} buckets", self.buckets.len(), num_buckets);
        self.buckets = vec![0; num_buckets];
        self.bitmask = (num_buckets - 1) as u64;
        for i in 1..self.data.len() {
            if self.data[i].occupied {
                let bucket = self.bucket_index(&self.data[i].value);
                self.data[i].next = self.buckets[bucket];
                self.buckets[bucket] = i;
            }
        }
    }
}

impl<T> Index<usize> for Table<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        self.value(index)
    }
}
