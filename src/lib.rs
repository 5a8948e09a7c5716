pub mod actions;
pub mod bounces;
pub mod config;
pub mod db;
pub mod download;
pub mod job;
pub mod lock;
pub mod mailbox;
pub mod processor;
pub mod reprocess;
pub mod rules;
pub mod subscribers;

pub use actions::{ActionHandler, ActionKind, ActionRegistry, ProcessingContext};
pub use config::Config;
pub use job::{run_job, JobOptions, JobSummary};
pub use lock::{LockGuard, LockService};
pub use mailbox::MailboxClient;
pub use processor::AdvancedRuleProcessor;
