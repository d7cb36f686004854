//! Optional latency instrumentation.
//!
//! A toggleable sink sampling queue hand-off points. Disabled it costs one
//! relaxed atomic load per sample site; it is not part of the endpoint
//! contract and nothing in the layer reads it back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Where a sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A message or control event entered an endpoint inbox.
    EndpointEnqueue,
    /// The multiplexer thread took it back out.
    EndpointDequeue,
}

/// One timestamped sample.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// The sampled hand-off point.
    pub stage: Stage,
    /// When it was sampled.
    pub at: Instant,
}

/// A start/stop-toggled timestamp recorder.
#[derive(Default)]
pub struct Instrumentation {
    enabled: AtomicBool,
    samples: Mutex<Vec<Sample>>,
}

impl Instrumentation {
    /// A disabled recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin recording samples.
    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Stop recording samples.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether sampling is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record a sample if recording is active.
    pub fn record(&self, stage: Stage) {
        if !self.is_enabled() {
            return;
        }
        let sample = Sample {
            stage,
            at: Instant::now(),
        };
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }

    /// Take every recorded sample.
    pub fn take(&self) -> Vec<Sample> {
        match self.samples.lock() {
            Ok(mut samples) => std::mem::take(&mut *samples),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let instr = Instrumentation::new();
        instr.record(Stage::EndpointEnqueue);
        assert!(instr.take().is_empty());

        instr.start();
        instr.record(Stage::EndpointEnqueue);
        instr.record(Stage::EndpointDequeue);
        instr.stop();
        instr.record(Stage::EndpointEnqueue);
        assert_eq!(instr.take().len(), 2);
    }
}
