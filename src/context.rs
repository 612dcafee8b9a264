//! Shared request-scoped context threaded explicitly into constructors,
//! rather than pulled from thread-locals or globals.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Generates a correlation id for a fresh unit of work (a job, an
/// inbound webhook delivery). Delegates to a UUID-shaped random string
/// rather than pulling in a dedicated uuid dependency, since the only
/// requirement is uniqueness-in-practice for log correlation, not a
/// standards-conformant UUID.
#[must_use]
pub fn new_correlation_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Abstracts "now" so tests can inject a fixed clock instead of
/// depending on wall-clock time; production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock: wall-clock time via `chrono::Utc::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Cross-cutting dependencies every subsystem constructor accepts
/// explicitly: a clock and a correlation-id generator. Metrics
/// themselves are recorded through the global `metrics` recorder (set up
/// once at startup) rather than threaded through `Context`, matching how
/// this crate's `tracing` spans are ambient rather than passed around.
#[derive(Clone)]
pub struct Context {
    pub clock: Arc<dyn Clock>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }
}

impl Context {
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn fixed_clock_is_stable() {
        let at = DateTime::from_timestamp(0, 0).unwrap();
        let context = Context { clock: Arc::new(FixedClock(at)) };
        assert_eq!(context.now(), at);
        assert_eq!(context.now(), at);
    }
}
