//! Background jobs: tenant-scoped, retried with backoff, dead-lettered when
//! attempts run out.

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, Execution, ExecutorError, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, GENERATE_DIVISION_INVOICE, GENERATE_FINANCER_INVOICE, Job,
    JobAttemptRecord, JobId, JobKind, JobResult, JobStatus, PROJECTION_REBUILD, RetryPolicy,
};
