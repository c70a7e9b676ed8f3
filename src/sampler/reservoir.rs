use super::rng::Lcg48;

/// Fixed-capacity random sample of timer observations. NaN marks an empty
/// slot.
///
/// Only the first `active` slots participate; the allocation may be larger
/// when the configured reservoir size exceeds the sampling threshold.
#[derive(Debug)]
pub struct Reservoir {
    slots: Box<[f64]>,
    active: usize,
    fill: usize,
}

impl Reservoir {
    pub fn new(capacity: usize, active: usize) -> Self {
        let active = active.min(capacity);
        Self {
            slots: vec![f64::NAN; capacity].into_boxed_slice(),
            active,
            fill: 0,
        }
    }

    /// Offers a value to the reservoir. `window` is the observation count
    /// of the current sampling window.
    ///
    /// During the fill phase values are appended in order. Afterwards a
    /// slot index is drawn as `r mod window`; the draw intentionally
    /// retains early samples more often as the window grows, matching the
    /// upstream reconstruction.
    pub fn offer(&mut self, value: f64, window: u64, rng: &mut Lcg48) {
        if self.fill < self.active {
            self.slots[self.fill] = value;
            self.fill += 1;
            return;
        }
        if window == 0 {
            return;
        }
        let k = rng.next_u31() % window;
        if (k as usize) < self.active {
            self.slots[k as usize] = value;
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots[..self.active]
            .iter()
            .filter(|v| !v.is_nan())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the occupied slots in index order.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.slots[..self.active]
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
    }

    /// Empties every slot. The fill cursor is left alone: within one
    /// sampling episode the fill phase runs only once.
    pub fn clear(&mut self) {
        for slot in &mut self.slots[..self.active] {
            *slot = f64::NAN;
        }
    }

    /// Restarts the fill phase. Called when a bucket leaves the sampling
    /// state.
    pub fn reset_fill(&mut self) {
        self.fill = 0;
    }
}
