pub mod nmap;
pub mod options;
pub mod registry;

pub use nmap::NmapRunner;
pub use options::{ScanOptions, ScanType};
pub use registry::RunnerRegistry;

use crate::error::RunnerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub step: String,
    pub force: bool,
}

impl ProgressEvent {
    pub fn new(percent: u8, step: impl Into<String>) -> Self {
        Self {
            percent,
            step: step.into(),
            force: false,
        }
    }

    pub fn forced(percent: u8, step: impl Into<String>) -> Self {
        Self {
            force: true,
            ..Self::new(percent, step)
        }
    }
}

/// Called on the runner's own thread.
pub trait ProgressSink {
    fn report(&mut self, event: ProgressEvent);
}

impl ProgressSink for Vec<ProgressEvent> {
    fn report(&mut self, event: ProgressEvent) {
        self.push(event);
    }
}

/// Blocks until the tool exits and reaps its child process before returning.
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        target: &str,
        options: &ScanOptions,
        progress: &mut dyn ProgressSink,
    ) -> Result<String, RunnerError>;
}
