//! Replicated per-slab velocity storage and the reference counts used to reduce it.
//!
//! Partition `c` belongs to slab `c / partitions_per_slab`.
//! Every body keeps one velocity copy per slab.
//! Within a slab, partitions update the copy in order, so velocities flow Gauss-Seidel style.
//! Across slabs the copies diverge and are averaged by [`average_slabs`]
//! using the number of slabs that actually touched the body.

use crate::{
    device::{arena::DeviceVec, map_range},
    math::Velocity,
};

/// An array of fixed-size bit arrays, one per body, with one bit per slab.
#[derive(Debug)]
pub struct SlabMask {
    entry_size: usize,
    entry_count: usize,
    bits: DeviceVec<u64>,
}

impl SlabMask {
    /// Number of words needed to hold `bits_per_entry` bits per entry.
    pub fn words_per_entry(bits_per_entry: usize) -> usize {
        (bits_per_entry.max(1) + 63) / 64
    }

    /// Wrap a zeroed buffer of `entry_count * words_per_entry(bits_per_entry)` words.
    pub fn new(bits: DeviceVec<u64>, entry_count: usize) -> Self {
        let entry_size = if entry_count == 0 {
            1
        } else {
            bits.len() / entry_count
        };
        Self {
            entry_size: entry_size.max(1),
            entry_count,
            bits,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn entry(&self, idx: usize) -> Entry<'_> {
        let start = idx * self.entry_size;
        Entry(&self.bits[start..start + self.entry_size])
    }

    pub fn entry_mut(&mut self, idx: usize) -> EntryMut<'_> {
        let start = idx * self.entry_size;
        EntryMut(&mut self.bits[start..start + self.entry_size])
    }

    /// Zero the entries of the given bodies.
    pub fn clear_entries(&mut self, entries: &[u32]) {
        for &idx in entries {
            self.entry_mut(idx as usize).clear();
        }
    }

    /// Number of set bits in an entry, i.e. the body's slab reference count.
    pub fn count(&self, idx: usize) -> u32 {
        self.entry(idx).0.iter().map(|w| w.count_ones()).sum()
    }
}

/// A view into a single entry in a slab mask.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a>(&'a [u64]);

impl<'a> Entry<'a> {
    pub fn iter(self) -> EntryIter<'a> {
        EntryIter {
            words: self.0,
            word_idx: 0,
            curr_word: self.0.first().copied().unwrap_or(0),
        }
    }

    pub fn has(&self, idx: usize) -> bool {
        self.0[idx / 64] & (1_u64 << (idx % 64)) != 0
    }
}

#[derive(Debug)]
pub struct EntryMut<'a>(&'a mut [u64]);

impl<'a> EntryMut<'a> {
    /// Set the bit at an index.
    ///
    /// # Panics
    /// Panics if the index is outside the entry's range.
    pub fn set(&mut self, idx: usize) {
        self.0[idx / 64] |= 1_u64 << (idx % 64);
    }

    pub fn clear(&mut self) {
        self.0.iter_mut().for_each(|w| *w = 0);
    }
}

/// Iterator over the set bits of an entry in ascending order.
#[derive(Debug, Clone, Copy)]
pub struct EntryIter<'a> {
    words: &'a [u64],
    word_idx: usize,
    // copy each word into the iterator so we can remove bits from it
    // instead of reading from the original bitset every time
    curr_word: u64,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.curr_word != 0 {
                let first_bit_idx = self.curr_word.trailing_zeros();
                self.curr_word ^= 1 << first_bit_idx;
                return Some(self.word_idx * 64 + first_bit_idx as usize);
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.curr_word = self.words[self.word_idx];
        }
    }
}

//
// Slab velocity copies
//

/// One velocity copy per `(body, slab)`.
#[derive(Debug)]
pub struct SlabVelocities {
    num_slabs: usize,
    data: DeviceVec<Velocity>,
}

impl SlabVelocities {
    /// Wrap a buffer of `num_bodies * num_slabs` velocities.
    pub fn new(data: DeviceVec<Velocity>, num_slabs: usize) -> Self {
        Self {
            num_slabs: num_slabs.max(1),
            data,
        }
    }

    pub fn num_slabs(&self) -> usize {
        self.num_slabs
    }

    #[inline]
    pub fn get(&self, body: u32, slab: usize) -> Velocity {
        self.data[body as usize * self.num_slabs + slab]
    }

    #[inline]
    pub fn set(&mut self, body: u32, slab: usize, vel: Velocity) {
        self.data[body as usize * self.num_slabs + slab] = vel;
    }

    /// Write `vel` into every slab copy of `body`.
    pub fn broadcast(&mut self, body: u32, vel: Velocity) {
        let start = body as usize * self.num_slabs;
        self.data[start..start + self.num_slabs]
            .iter_mut()
            .for_each(|v| *v = vel);
    }
}

/// Reduce the slab copies of `bodies` into their canonical velocities.
///
/// The new velocity is the starting canonical velocity
/// plus the mean of the changes made in every slab that references the body.
/// Bodies referenced by no slab keep their velocity.
/// Slabs are summed in index order so the result doesn't depend on scheduling.
pub fn average_slabs(
    slabs: &SlabVelocities,
    mask: &SlabMask,
    canonical: &mut [Velocity],
    bodies: &[u32],
) {
    let averaged: Vec<Option<Velocity>> = map_range(bodies.len(), |i| {
        let body = bodies[i];
        let count = mask.count(body as usize);
        if count == 0 {
            return None;
        }
        let start = canonical[body as usize];
        let mut sum = Velocity::default();
        for slab in mask.entry(body as usize).iter() {
            sum += slabs.get(body, slab) - start;
        }
        Some(start + sum * (1.0 / count as f64))
    });
    for (&body, avg) in bodies.iter().zip(averaged) {
        if let Some(avg) = avg {
            canonical[body as usize] = avg;
        }
    }
}
