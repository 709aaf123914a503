//! Progress reporting trait, decoupling the orchestrator from any concrete
//! output sink (CLI `eprintln!`, a test collector, …).

/// Minimal progress-reporting contract. Implementations decide how (and
/// whether) to render; the orchestrator only ever calls these three.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A [`Reporter`] that discards everything, for tests that don't care about
/// progress output.
#[derive(Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}
