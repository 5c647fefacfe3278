//! Combination resolver
//!
//! Arbitrates overlapping triggers: combinations are matched longest first,
//! a longer combination displaces shorter triggered subsets, and releasing a
//! longer combination lets still-held shorter ones fire again. The injection
//! owns this table; handlers carry slot indices into it and queue actions
//! here during dispatch, which the pipeline applies afterwards.

use std::collections::HashSet;

use evmapper_config::InputMatchKey;

/// Deferred work queued by handlers during a dispatch round. The queue is
/// applied in order, so releases of displaced combinations land before the
/// winning combination's press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverAction {
    /// Emit a synthetic release for the handler's output.
    Release { handler: usize },
    /// The handler may fire again if its combination is still satisfied.
    Reactivate { handler: usize },
    /// Emit the press of a combination that just won arbitration.
    EmitPress { handler: usize },
}

#[derive(Debug)]
struct Slot {
    handler: usize,
    keys: HashSet<InputMatchKey>,
    triggered: bool,
    /// Slots whose key sets are proper subsets of this one.
    subsets: Vec<usize>,
}

/// Per-preset registry of combinations, sorted once at build time.
#[derive(Debug, Default)]
pub struct Resolver {
    slots: Vec<Slot>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a combination's button conditions. Returns the slot index
    /// the owning handler keeps.
    pub fn register(&mut self, handler: usize, keys: Vec<InputMatchKey>) -> usize {
        self.slots.push(Slot {
            handler,
            keys: keys.into_iter().collect(),
            triggered: false,
            subsets: Vec::new(),
        });
        self.slots.len() - 1
    }

    /// Precompute the proper-subset relation once all slots are registered.
    pub fn finalize(&mut self) {
        for i in 0..self.slots.len() {
            let mut subsets = Vec::new();
            for j in 0..self.slots.len() {
                if i == j {
                    continue;
                }
                let shorter = &self.slots[j];
                let longer = &self.slots[i];
                if shorter.keys.len() < longer.keys.len()
                    && shorter.keys.is_subset(&longer.keys)
                {
                    subsets.push(j);
                }
            }
            self.slots[i].subsets = subsets;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of button conditions registered for a slot.
    pub fn slot_len(&self, slot: usize) -> usize {
        self.slots[slot].keys.len()
    }

    pub fn is_triggered(&self, slot: usize) -> bool {
        self.slots[slot].triggered
    }

    /// A combination fired. Any triggered proper subset must release its
    /// output so it is not stuck pressed underneath the longer combination.
    pub fn activated(&mut self, slot: usize, actions: &mut Vec<ResolverAction>) {
        self.slots[slot].triggered = true;
        let subsets = self.slots[slot].subsets.clone();
        for subset in subsets {
            if self.slots[subset].triggered {
                self.slots[subset].triggered = false;
                actions.push(ResolverAction::Release {
                    handler: self.slots[subset].handler,
                });
            }
        }
    }

    /// A combination released. Still-held shorter combinations get a chance
    /// to fire again.
    pub fn deactivated(&mut self, slot: usize, actions: &mut Vec<ResolverAction>) {
        self.slots[slot].triggered = false;
        for &subset in &self.slots[slot].subsets {
            if !self.slots[subset].triggered {
                actions.push(ResolverAction::Reactivate {
                    handler: self.slots[subset].handler,
                });
            }
        }
    }

    /// Mark a slot triggered without the displacement cascade, used when a
    /// shorter combination re-fires after a longer one released.
    pub fn mark_triggered(&mut self, slot: usize) {
        self.slots[slot].triggered = true;
    }

    pub fn mark_released(&mut self, slot: usize) {
        self.slots[slot].triggered = false;
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.triggered = false;
        }
    }
}
