//! Contact force thresholds: which body pairs started or stopped pushing
//! harder than their threshold since the previous step.
//!
//! The write-back kernel emits one [`ThresholdElement`] per contact manager with a threshold.
//! This module sorts them into body pairs with a stable radix sort,
//! sums each pair's force, and diffs the pairs above threshold against the previous step.

/// Bits per radix digit.
pub const RADIX_BITS: u32 = 4;
const RADIX_BUCKETS: usize = 1 << RADIX_BITS;

/// One contact manager's normal force for this step.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ThresholdElement {
    /// The lower node index of the body pair.
    /// Rigid bodies are their solver index, articulations come after all bodies.
    pub node_a: u32,
    pub node_b: u32,
    /// The contact manager this came from.
    pub manager: u32,
    pub normal_force: f64,
    pub threshold: f64,
    /// Total force of all managers between the same pair, filled in by the pipeline.
    pub accumulated_force: f64,
}

impl ThresholdElement {
    pub fn new(node_a: u32, node_b: u32, manager: u32, normal_force: f64, threshold: f64) -> Self {
        let (node_a, node_b) = if node_a <= node_b {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        };
        Self {
            node_a,
            node_b,
            manager,
            normal_force,
            threshold,
            accumulated_force: 0.0,
        }
    }

    pub fn pair(&self) -> (u32, u32) {
        (self.node_a, self.node_b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum ForceChange {
    /// The pair went above its threshold this step.
    Found,
    /// The pair was above its threshold last step and isn't anymore.
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ThresholdChange {
    pub element: ThresholdElement,
    pub change: ForceChange,
}

/// The exceeded-pair set of the previous step.
///
/// Double-buffered: the pipeline reads the previous set and swaps in the new one.
#[derive(Clone, Debug, Default)]
pub struct ThresholdHistory {
    previous: Vec<ThresholdElement>,
    current: Vec<ThresholdElement>,
}

impl ThresholdHistory {
    pub fn previous(&self) -> &[ThresholdElement] {
        &self.previous
    }

    /// Make `exceeded` the set the next step compares against.
    pub fn advance(&mut self, exceeded: Vec<ThresholdElement>) {
        self.current = exceeded;
        std::mem::swap(&mut self.previous, &mut self.current);
        self.current.clear();
    }

    pub fn clear(&mut self) {
        self.previous.clear();
        self.current.clear();
    }
}

/// Result of one pass of the threshold pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThresholdOutput {
    /// Pairs above their threshold this step, sorted by pair.
    pub exceeded: Vec<ThresholdElement>,
    pub changes: Vec<ThresholdChange>,
}

//
// Radix sort
//

/// Number of 4-bit passes needed to sort keys up to `max_key`, rounded up to an even
/// number so the result lands back in the buffer it started in.
pub fn radix_pass_count(max_key: u32) -> u32 {
    let bits = (32 - max_key.leading_zeros()).max(1);
    let passes = (bits + RADIX_BITS - 1) / RADIX_BITS;
    passes + passes % 2
}

/// Stably reorder `ranks` by `key(rank)` with `passes` least-significant-digit passes,
/// ping-ponging between `ranks` and a scratch buffer.
pub fn radix_sort_ranks(ranks: &mut Vec<u32>, passes: u32, key: impl Fn(u32) -> u32) {
    let mut scratch = vec![0; ranks.len()];
    for pass in 0..passes {
        let shift = pass * RADIX_BITS;
        let digit = |rank: u32| ((key(rank) >> shift) as usize) & (RADIX_BUCKETS - 1);

        let mut offsets = [0usize; RADIX_BUCKETS];
        for &rank in ranks.iter() {
            offsets[digit(rank)] += 1;
        }
        let mut sum = 0;
        for offset in offsets.iter_mut() {
            let count = *offset;
            *offset = sum;
            sum += count;
        }
        for &rank in ranks.iter() {
            let d = digit(rank);
            scratch[offsets[d]] = rank;
            offsets[d] += 1;
        }
        std::mem::swap(ranks, &mut scratch);
    }
}

//
// Pipeline
//

/// Sort the stream into body pairs, sum each pair's force and report the pairs
/// whose exceeded state differs from `previous_exceeded`.
///
/// Pure in its inputs: running it twice on the same stream and history
/// gives the same output.
pub fn process_threshold_stream(
    stream: &[ThresholdElement],
    previous_exceeded: &[ThresholdElement],
    max_node: u32,
) -> ThresholdOutput {
    let _span = crate::tracy_span!("threshold pipeline", "process_threshold_stream");

    // snapshot so the accumulation doesn't touch the shared stream
    let snapshot = stream.to_vec();

    let passes = radix_pass_count(max_node);
    let mut ranks: Vec<u32> = (0..snapshot.len() as u32).collect();
    radix_sort_ranks(&mut ranks, passes, |r| snapshot[r as usize].node_b);
    radix_sort_ranks(&mut ranks, passes, |r| snapshot[r as usize].node_a);
    let sorted: Vec<ThresholdElement> = ranks.iter().map(|&r| snapshot[r as usize]).collect();

    let exceeded = accumulate_pairs(&sorted);
    let changes = merge_exceeded(previous_exceeded, &exceeded);
    ThresholdOutput { exceeded, changes }
}

/// Sum the force of each run of equal pairs in a sorted stream
/// and keep the first element of every run that is above its threshold.
fn accumulate_pairs(sorted: &[ThresholdElement]) -> Vec<ThresholdElement> {
    let mut exceeded = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let pair = sorted[start].pair();
        let end = start
            + sorted[start..]
                .iter()
                .take_while(|e| e.pair() == pair)
                .count();
        let run = &sorted[start..end];
        let total: f64 = run.iter().map(|e| e.normal_force).sum();
        let threshold = run
            .iter()
            .map(|e| e.threshold)
            .fold(f64::INFINITY, f64::min);
        if total > threshold {
            let mut element = run[0];
            element.accumulated_force = total;
            element.threshold = threshold;
            exceeded.push(element);
        }
        start = end;
    }
    exceeded
}

/// Diff two pair-sorted exceeded sets.
///
/// Both sets go into one list, previous first, and get sorted by pair.
/// The first half of the mask marks elements whose pair appears only once (a transition),
/// the second half holds the exclusive prefix sum of the first half,
/// which is each transition's slot in the output.
fn merge_exceeded(
    previous: &[ThresholdElement],
    current: &[ThresholdElement],
) -> Vec<ThresholdChange> {
    let total = previous.len() + current.len();
    if total == 0 {
        return Vec::new();
    }
    let combined: Vec<(ThresholdElement, ForceChange)> = previous
        .iter()
        .map(|e| (*e, ForceChange::Lost))
        .chain(current.iter().map(|e| (*e, ForceChange::Found)))
        .collect();

    let max_node = combined
        .iter()
        .map(|(e, _)| e.node_a.max(e.node_b))
        .max()
        .unwrap_or(0);
    let passes = radix_pass_count(max_node);
    let mut ranks: Vec<u32> = (0..total as u32).collect();
    radix_sort_ranks(&mut ranks, passes, |r| combined[r as usize].0.node_b);
    radix_sort_ranks(&mut ranks, passes, |r| combined[r as usize].0.node_a);

    let mut mask = vec![0u32; total * 2];
    let pair_at = |i: usize| combined[ranks[i] as usize].0.pair();
    for i in 0..total {
        let same_as_prev = i > 0 && pair_at(i - 1) == pair_at(i);
        let same_as_next = i + 1 < total && pair_at(i + 1) == pair_at(i);
        mask[i] = u32::from(!same_as_prev && !same_as_next);
    }
    let mut sum = 0;
    for i in 0..total {
        mask[total + i] = sum;
        sum += mask[i];
    }

    let mut changes = vec![None; sum as usize];
    for i in 0..total {
        if mask[i] == 1 {
            let (element, change) = combined[ranks[i] as usize];
            changes[mask[total + i] as usize] = Some(ThresholdChange { element, change });
        }
    }
    changes.into_iter().flatten().collect()
}
