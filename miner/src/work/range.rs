use std::fmt;
use std::sync::Arc;

use super::unit::WorkUnit;

/// A slice of a unit's candidate space handed to one kernel invocation.
#[derive(Clone)]
pub struct NonceRange {
    unit: Arc<WorkUnit>,
    base: u64,
    size: u64,
}

impl NonceRange {
    pub(crate) fn new(unit: Arc<WorkUnit>, base: u64, size: u64) -> Self {
        debug_assert!(base + size <= unit.nonces());
        Self { unit, base, size }
    }

    pub fn unit(&self) -> &Arc<WorkUnit> {
        &self.unit
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Nonce values covered by this range.
    pub fn nonces(&self) -> impl Iterator<Item = u32> {
        (self.base..self.end()).map(|n| n as u32)
    }
}

impl fmt::Debug for NonceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceRange")
            .field("unit", &self.unit.id())
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}
