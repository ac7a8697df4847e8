use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

thread_local! {
    // 0 means "not yet seated"; seeds are forced odd so they are never 0.
    static CELL_PROBE: Cell<usize> = const { Cell::new(0) };
}

static PROBE_SEED: AtomicUsize = AtomicUsize::new(0);

fn next_probe() -> usize {
    let seed = PROBE_SEED.fetch_add(1, Ordering::Relaxed) as u64;
    (seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) as usize) | 1
}

fn rehash(mut probe: usize) -> usize {
    probe ^= probe << 13;
    probe ^= probe >> 17;
    probe ^= probe << 5;
    probe
}

/// A counter spread over multiple cache-line-padded cells to spread write
/// contention.
///
/// Writers pick a cell through a per-thread probe; a failed compare-and-swap
/// re-seats the thread on a different cell, so sustained contention on any
/// single cell disperses. [`sum_and_reset`](Self::sum_and_reset) drains every
/// cell to zero and returns the total. It does not produce a snapshot
/// instantaneous with concurrent adds, but two concurrent drains partition
/// the cells between them: no add is ever lost or counted twice.
pub struct ShardedAdder {
    cells: Box<[CachePadded<AtomicI64>]>,
}

impl Default for ShardedAdder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedAdder {
    /// Creates an adder with one cell per hardware thread, rounded up to a
    /// power of two.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_cells(threads.next_power_of_two())
    }

    /// Creates an adder with the given cell count.
    ///
    /// # Panics
    ///
    /// Panics if `cells` is not a power of two.
    pub fn with_cells(cells: usize) -> Self {
        assert!(cells.is_power_of_two(), "cell count must be a power of two");
        let cells = (0..cells)
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect();
        Self { cells }
    }

    /// Adds `amount` to the counter. Wait-free in the absence of contention.
    pub fn add(&self, amount: i64) {
        let mut probe = CELL_PROBE.with(|slot| {
            let probe = slot.get();
            if probe != 0 {
                probe
            } else {
                let seeded = next_probe();
                slot.set(seeded);
                seeded
            }
        });
        let mask = self.cells.len() - 1;
        loop {
            let cell = &self.cells[probe & mask];
            let current = cell.load(Ordering::Relaxed);
            if cell
                .compare_exchange_weak(
                    current,
                    current.wrapping_add(amount),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
            // contended cell: move this thread elsewhere
            probe = rehash(probe);
            CELL_PROBE.with(|slot| slot.set(probe));
        }
    }

    /// Drains every cell to zero and returns the wrapping sum.
    pub fn sum_and_reset(&self) -> i64 {
        self.cells
            .iter()
            .fold(0i64, |total, cell| total.wrapping_add(cell.swap(0, Ordering::AcqRel)))
    }

    /// Returns the wrapping sum of all cells without resetting them.
    ///
    /// The result is a racy estimate under concurrent adds.
    pub fn sum(&self) -> i64 {
        self.cells
            .iter()
            .fold(0i64, |total, cell| total.wrapping_add(cell.load(Ordering::Relaxed)))
    }
}
