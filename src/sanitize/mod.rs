//! Result sanitization.
//!
//! Values read back from storage often carry padding from fixed-width columns.
//! The sanitizer walks a result graph through the [`Traversable`] capability
//! and trims leading and trailing whitespace from every string leaf in place:
//!
//! - sequences and maps: every element / value (map keys are untouched)
//! - dynamic rows and JSON objects: every column value
//! - records declared with [`traversable_record!`](crate::traversable_record):
//!   every member not flagged computed, not mapped or read-only
//! - shared `Arc<Mutex<_>>` nodes: visited once, so cycles terminate
//!
//! The concurrent mode fans out over children with rayon once a node has at
//! least `parallel_threshold` of them. Every branch joins before `run` returns.

mod record;
mod traverse;

pub use record::{MemberFlags, SkipReason};
pub use traverse::{Child, Shape, SharedTraversable, Traversable};

use crate::config::DEFAULT_PARALLEL_THRESHOLD;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Whether to walk children one by one or fan out with rayon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SanitizeMode {
    #[default]
    Sequential,
    Concurrent,
}

/// Counters collected during one sanitization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SanitizeStats {
    /// Strings that had whitespace removed.
    pub trimmed: usize,
    /// Record members left alone because of their flags.
    pub skipped: usize,
    /// Shared nodes reached again after their first visit.
    pub revisited: usize,
}

/// Sanitizer configuration.
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    mode: SanitizeMode,
    parallel_threshold: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(SanitizeMode::Sequential)
    }
}

impl Sanitizer {
    /// Create a new sanitizer.
    pub fn new(mode: SanitizeMode) -> Self {
        Self {
            mode,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Set the minimum number of children before fanning out. Zero is treated as one.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold.max(1);
        self
    }

    pub fn mode(&self) -> SanitizeMode {
        self.mode
    }

    /// Trim every reachable string leaf of `value` in place.
    pub fn run<T: Traversable + ?Sized>(&self, value: &mut T) -> SanitizeStats {
        let pass = Pass {
            sanitizer: *self,
            visited: Mutex::new(HashSet::new()),
            trimmed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            revisited: AtomicUsize::new(0),
        };
        pass.visit(value.children());
        pass.into_stats()
    }
}

/// State of one pass. Shared by reference across rayon workers.
struct Pass {
    sanitizer: Sanitizer,
    visited: Mutex<HashSet<usize>>,
    trimmed: AtomicUsize,
    skipped: AtomicUsize,
    revisited: AtomicUsize,
}

impl Pass {
    fn visit(&self, children: Vec<Child<'_>>) {
        let fan_out = self.sanitizer.mode == SanitizeMode::Concurrent
            && children.len() >= self.sanitizer.parallel_threshold;
        if fan_out {
            children
                .into_par_iter()
                .for_each(|child| self.visit_child(child));
        } else {
            for child in children {
                self.visit_child(child);
            }
        }
    }

    fn visit_child(&self, child: Child<'_>) {
        match child {
            Child::Text(text) => {
                if trim_in_place(text) {
                    self.trimmed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Child::Node(node) => self.visit(node.children()),
            Child::Skipped { member, reason } => {
                trace!(member, %reason, "Skipping member");
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Child::Shared { addr, node } => {
                // Checked before locking: a node already on the path is never re-entered.
                if self.first_visit(addr) {
                    node.with_locked(&mut |inner| self.visit(inner.children()));
                } else {
                    self.revisited.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn first_visit(&self, addr: usize) -> bool {
        let mut visited = self.visited.lock().unwrap_or_else(|e| e.into_inner());
        visited.insert(addr)
    }

    fn into_stats(self) -> SanitizeStats {
        SanitizeStats {
            trimmed: self.trimmed.into_inner(),
            skipped: self.skipped.into_inner(),
            revisited: self.revisited.into_inner(),
        }
    }
}

/// Trim leading and trailing whitespace. Returns whether anything was removed.
pub fn trim_in_place(text: &mut String) -> bool {
    let trimmed = text.trim();
    if trimmed.len() == text.len() {
        return false;
    }
    let start = trimmed.as_ptr() as usize - text.as_ptr() as usize;
    let end = start + trimmed.len();
    text.truncate(end);
    text.drain(..start);
    true
}

/// Sanitize `value` sequentially.
pub fn sanitize<T: Traversable + ?Sized>(value: &mut T) -> SanitizeStats {
    Sanitizer::new(SanitizeMode::Sequential).run(value)
}

/// Sanitize `value` with rayon fan-out over wide nodes.
pub fn sanitize_concurrent<T: Traversable + ?Sized>(value: &mut T) -> SanitizeStats {
    Sanitizer::new(SanitizeMode::Concurrent).run(value)
}
