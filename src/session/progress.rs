//! Operation progress
//!
//! State of one in-flight batch operation: counters, cancellation and the
//! sticky choices (overwrite mode, skip-to-all) that live for this batch only.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileOperation {
    None,
    Copy,
    Move,
    Delete,
    SetProperties,
    RenameFile,
    CustomCommand,
    CalculateSize,
    RemoteMove,
    RemoteCopy,
    GetProperties,
    CalculateChecksum,
    Lock,
    Unlock,
}

/// Which side an operation works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationSide {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CancelStatus {
    Continue,
    /// Stop after the current file
    Cancel,
    /// Stop the current transfer too
    CancelTransfer,
    /// Stop and abandon the remote side immediately
    RemoteAbort,
}

/// Sticky overwrite decision for the rest of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOverwrite {
    /// Ask for each file
    No,
    /// Overwrite everything
    All,
    /// Overwrite nothing
    None,
    /// Overwrite only when the source is newer
    Older,
    Alternate,
    Append,
    Resume,
    AlternateResume,
}

/// What to do once the operation has finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnceDoneOperation {
    #[default]
    Idle,
    Disconnect,
    Suspend,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    pub operation: FileOperation,
    pub side: OperationSide,
    /// Number of top-level items, 0 when unknown
    pub count: usize,
    pub processed: usize,
    pub file_name: String,
    pub total_size: u64,
    pub total_size_set: bool,
    pub transferred: u64,
    pub skipped: u64,
    pub cancel: CancelStatus,
    pub batch_overwrite: BatchOverwrite,
    pub skip_to_all: bool,
    pub in_progress: bool,
    pub suspended: bool,
    /// Operation on temporary files the user never sees
    pub temp: bool,
    #[serde(skip)]
    started: Option<Instant>,
    #[serde(skip)]
    suspended_at: Option<Instant>,
    #[serde(skip)]
    suspended_for: Duration,
}

impl Default for OperationProgress {
    fn default() -> Self {
        Self {
            operation: FileOperation::None,
            side: OperationSide::Remote,
            count: 0,
            processed: 0,
            file_name: String::new(),
            total_size: 0,
            total_size_set: false,
            transferred: 0,
            skipped: 0,
            cancel: CancelStatus::Continue,
            batch_overwrite: BatchOverwrite::No,
            skip_to_all: false,
            in_progress: false,
            suspended: false,
            temp: false,
            started: None,
            suspended_at: None,
            suspended_for: Duration::ZERO,
        }
    }
}

impl OperationProgress {
    /// A progress that is already running
    pub fn start(operation: FileOperation, side: OperationSide, count: usize, temp: bool) -> Self {
        Self {
            operation,
            side,
            count,
            temp,
            in_progress: true,
            started: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn stop(&mut self) {
        self.in_progress = false;
        self.file_name.clear();
    }

    pub fn set_file(&mut self, file_name: &str) {
        self.file_name = file_name.to_string();
    }

    /// One top-level item is done
    pub fn finish(&mut self) {
        self.processed += 1;
        self.file_name.clear();
    }

    pub fn set_total_size(&mut self, size: u64) {
        self.total_size = size;
        self.total_size_set = true;
    }

    pub fn add_transferred(&mut self, bytes: u64) {
        self.transferred += bytes;
    }

    pub fn add_skipped(&mut self, bytes: u64) {
        self.skipped += bytes;
    }

    /// Raise the cancel level, never lower it
    pub fn set_cancel_at_least(&mut self, cancel: CancelStatus) {
        self.cancel = self.cancel.max(cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel != CancelStatus::Continue
    }

    /// Pause time accounting while the user is being asked
    pub fn suspend(&mut self) {
        if !self.suspended {
            self.suspended = true;
            self.suspended_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            if let Some(at) = self.suspended_at.take() {
                self.suspended_for += at.elapsed();
            }
        }
    }

    /// Running time excluding suspensions
    pub fn time_elapsed(&self) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let pending = self
            .suspended_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);
        started
            .elapsed()
            .saturating_sub(self.suspended_for + pending)
    }

    /// Completed share of the total size, 0..=100
    pub fn total_transferred_percent(&self) -> u8 {
        if !self.total_size_set || self.total_size == 0 {
            return 0;
        }
        let done = (self.transferred + self.skipped).min(self.total_size);
        ((done as u128 * 100) / self.total_size as u128) as u8
    }
}

/// Payload of the `finished` callback
#[derive(Debug, Clone, Serialize)]
pub struct FinishedEvent {
    pub operation: FileOperation,
    pub side: OperationSide,
    pub temp: bool,
    pub file_name: String,
    pub success: bool,
    /// The callback may ask for an action once the whole operation is done
    pub once_done: OnceDoneOperation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut progress = OperationProgress::start(FileOperation::Copy, OperationSide::Local, 2, false);
        assert!(progress.in_progress);
        progress.set_total_size(200);
        progress.set_file("a");
        progress.add_transferred(50);
        progress.add_skipped(50);
        progress.finish();
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.total_transferred_percent(), 50);
        assert!(progress.file_name.is_empty());
        progress.stop();
        assert!(!progress.in_progress);
    }

    #[test]
    fn test_cancel_only_raises() {
        let mut progress = OperationProgress::default();
        progress.set_cancel_at_least(CancelStatus::CancelTransfer);
        progress.set_cancel_at_least(CancelStatus::Cancel);
        assert_eq!(progress.cancel, CancelStatus::CancelTransfer);
        assert!(progress.is_cancelled());
    }

    #[test]
    fn test_suspend_resume() {
        let mut progress = OperationProgress::start(FileOperation::Delete, OperationSide::Remote, 1, false);
        progress.suspend();
        assert!(progress.suspended);
        progress.resume();
        assert!(!progress.suspended);
        assert!(progress.time_elapsed() <= Duration::from_secs(5));
    }
}
