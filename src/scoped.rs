//! Restorable override cells.
//!
//! Every piece of test-time configuration (runtime handle, default headers,
//! JSON serializer, active rules, session allow-list) lives in a
//! [`ScopedOverride`], so leaving a scope returns the process to exactly the
//! state it had before the scope was entered.

use crate::error::{MockError, Result};

/// A base value plus a stack of overrides layered on top of it.
#[derive(Debug, Clone)]
pub struct ScopedOverride<T> {
    base: T,
    stack: Vec<T>,
    /// Maximum number of simultaneously active overrides (None = unbounded)
    max_depth: Option<usize>,
}

impl<T> ScopedOverride<T> {
    /// Create an override cell that supports arbitrary nesting.
    pub fn new(base: T) -> Self {
        Self {
            base,
            stack: Vec::new(),
            max_depth: None,
        }
    }

    /// Create a single-slot cell: activating twice without a restore fails.
    pub fn single(base: T) -> Self {
        Self::with_max_depth(base, 1)
    }

    pub fn with_max_depth(base: T, max_depth: usize) -> Self {
        Self {
            base,
            stack: Vec::new(),
            max_depth: Some(max_depth),
        }
    }

    /// Install `value` on top of the current one.
    ///
    /// Returns the new depth. Fails with [`MockError::AlreadyActive`] when the
    /// depth limit is reached; the cell is left untouched in that case.
    pub fn activate(&mut self, value: T) -> Result<usize> {
        if let Some(max) = self.max_depth {
            if self.stack.len() >= max {
                return Err(MockError::AlreadyActive {
                    depth: self.stack.len(),
                });
            }
        }
        self.stack.push(value);
        Ok(self.stack.len())
    }

    /// Reinstall the previous value. A no-op when nothing is active.
    pub fn restore(&mut self) -> Option<T> {
        self.stack.pop()
    }

    /// The current value.
    pub fn value(&self) -> &T {
        self.stack.last().unwrap_or(&self.base)
    }

    pub fn value_mut(&mut self) -> &mut T {
        self.stack.last_mut().unwrap_or(&mut self.base)
    }

    /// Mutable access to a specific level (0 = base).
    pub fn level_mut(&mut self, depth: usize) -> Option<&mut T> {
        if depth == 0 {
            Some(&mut self.base)
        } else {
            self.stack.get_mut(depth - 1)
        }
    }

    /// Number of active overrides.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }
}

impl<T: Clone> ScopedOverride<T> {
    /// Activate a copy of the current value, so the new level can be extended
    /// without touching the outer one.
    pub fn activate_copy(&mut self) -> Result<usize> {
        let copy = self.value().clone();
        self.activate(copy)
    }
}

impl<T: Default> Default for ScopedOverride<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
