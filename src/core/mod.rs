pub mod initiator;
pub mod models;
pub mod monitor;
pub mod notifier;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use initiator::{BackupInitiator, StartedBackup};
pub use models::{
    BackupConfiguration, BackupFinished, BackupJob, BackupStarted, JobId, JobStatus, JobType,
    ProgressEvent, SshTestResult, StartResponse,
};
pub use monitor::Monitor;
pub use notifier::{ProgressNotifier, ProgressSubscription, Visibility};
pub use registry::{JobRegistry, MergeOutcome, SnapshotSummary, SyncSummary};
