//! Pending work, keyed by identity, in registration order.

use crate::error::Result;
use crate::model::WorkKey;
use crate::work::WorkUnit;

/// Ordered set of work units keyed by [`WorkKey`].
///
/// Insertion order matters: it breaks ties between equal priorities.
#[derive(Default)]
pub(crate) struct PendingSet {
    units: Vec<Box<dyn WorkUnit>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or replace the unit with the same key and move the
    /// replacement to the end. Returns the replaced unit.
    pub fn upsert(&mut self, unit: Box<dyn WorkUnit>) -> Option<Box<dyn WorkUnit>> {
        let replaced = self
            .units
            .iter()
            .position(|pending| pending.key() == unit.key())
            .map(|index| self.units.remove(index));
        self.units.push(unit);
        replaced
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn contains(&self, key: &WorkKey) -> bool {
        self.units.iter().any(|unit| unit.key() == key)
    }

    /// Units in ascending priority, ties in insertion order.
    ///
    /// Sorting in place keeps later insertions correct: a stable sort of the
    /// sorted set plus appended units equals a stable sort of the original.
    pub fn in_execution_order(&mut self) -> &mut [Box<dyn WorkUnit>] {
        // sort_by_key is stable
        self.units.sort_by_key(|unit| unit.priority());
        &mut self.units
    }

    /// Run `f` over the units in execution order, removing each unit it
    /// succeeds on. Stops at the first failure; that unit and the rest stay.
    pub fn drain_each(
        &mut self,
        mut f: impl FnMut(&mut Box<dyn WorkUnit>) -> Result<()>,
    ) -> Result<()> {
        self.in_execution_order();
        while let Some(unit) = self.units.first_mut() {
            f(unit)?;
            self.units.remove(0);
        }
        Ok(())
    }
}
