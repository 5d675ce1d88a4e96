//! Background job processing for the file service
//!
//! Two queues are consumed: `fileQueue` carries `{fileId, userId}` jobs for
//! the [`ThumbnailWorker`], `userQueue` carries `{userId}` jobs for the
//! [`WelcomeWorker`].

pub mod config;
pub mod jobs;
pub mod queue;
pub mod thumbnail_generator;
pub mod thumbnail_worker;
pub mod welcome_worker;

pub use jobs::{EntityKind, JobError, ThumbnailJob, WelcomeJob};
pub use queue::{Consumer, Delivery, Queue, RetryPolicy, THUMBNAIL_QUEUE, WELCOME_QUEUE};
pub use thumbnail_worker::{DerivationReport, THUMBNAIL_WIDTHS, ThumbnailWorker};
pub use welcome_worker::{LogNotifier, Notifier, WelcomeWorker};
