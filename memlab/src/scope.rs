use log::debug;

use crate::{Handle, MemError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Sentinel,
    Tracked(Handle),
}

/// Handles grouped by lexical scope.
///
/// Values created while no scope is open belong to no frame. Nothing records
/// them, and no scope ending ever unmarks them.
#[derive(Debug, Default)]
pub struct ScopeStack {
    entries: Vec<Entry>,
    depth: usize,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self) {
        self.entries.push(Entry::Sentinel);
        self.depth += 1;
    }

    /// Records `handle` in the innermost frame. A no-op with no scope open.
    pub fn track(&mut self, handle: Handle) {
        if self.depth > 0 {
            self.entries.push(Entry::Tracked(handle));
        }
    }

    /// Pops the innermost frame and returns the handles it tracked, newest
    /// first. The caller unmarks them.
    pub fn close(&mut self) -> Result<Vec<Handle>> {
        if self.depth == 0 {
            return Err(MemError::NoOpenScope);
        }

        let mut popped = Vec::new();
        while let Some(entry) = self.entries.pop() {
            match entry {
                Entry::Sentinel => break,
                Entry::Tracked(handle) => popped.push(handle),
            }
        }
        self.depth -= 1;

        debug!("scope: closed depth {} with {} handles", self.depth + 1, popped.len());
        Ok(popped)
    }

    /// Open scopes.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Handles tracked across every open frame.
    pub fn tracked(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Tracked(_)))
            .count()
    }
}
