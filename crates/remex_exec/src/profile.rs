//! Phase timing.

use std::time::{Duration, Instant};
use tracing::{debug, debug_span, Span};

/// Times one phase of a spawn and logs the elapsed time when dropped
///
/// The guard owns a span instead of entering it, so it can be held across
/// `.await`; attach async work to it with `.instrument(scope.span().clone())`.
#[derive(Debug)]
pub struct ProfileScope {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl ProfileScope {
    /// Start timing `name`
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            span: debug_span!("phase", name),
        }
    }

    /// Phase name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Span covering the phase
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Time since the phase started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        debug!(
            parent: &self.span,
            phase = self.name,
            elapsed_us = self.start.elapsed().as_micros() as u64,
            "phase finished"
        );
    }
}
