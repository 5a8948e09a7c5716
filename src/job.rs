use crate::actions::ActionRegistry;
use crate::bounces::BounceStore;
use crate::config::Config;
use crate::db::Db;
use crate::download::{build_clients, DownloadProcessor, DownloadReport};
use crate::processor::{AdvancedRuleProcessor, ProcessorReport};
use crate::reprocess::{ConsecutiveBounceHandler, UnidentifiedBounceReprocessor};
use crate::rules::RuleStore;
use crate::subscribers::SubscriberStore;
use anyhow::Result;

/// Invocation switches, straight from the command line.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub protocol: String,
    pub purge_unprocessed: bool,
    pub rules_batch_size: usize,
    pub test_mode: bool,
}

#[derive(Debug, Default, Clone)]
pub struct JobSummary {
    pub download: DownloadReport,
    pub processing: ProcessorReport,
    pub identified: u64,
    pub unconfirmed: u64,
    pub purged: u64,
}

impl JobSummary {
    /// The operator-facing summary printed on success.
    pub fn render(&self) -> String {
        let mut lines = self.download.lines.clone();
        lines.push(format!(
            "{} bounces processed by advanced processing",
            self.processing.matched
        ));
        lines.push(format!("{} bounces were not matched", self.processing.unmatched));
        if self.identified > 0 {
            lines.push(format!("{} bounces re-identified", self.identified));
        }
        if self.unconfirmed > 0 {
            lines.push(format!("{} subscribers auto unconfirmed", self.unconfirmed));
        }
        if self.purged > 0 {
            lines.push(format!("{} unprocessed bounces purged", self.purged));
        }
        lines.join("\n")
    }
}

/// Run the whole pipeline: download, advanced rule processing, the secondary
/// passes, and the optional purge. The caller holds the lock around this.
pub fn run_job(db: Db, config: &Config, options: &JobOptions) -> Result<JobSummary> {
    // Resolved first so an unsupported protocol fails before any mutation.
    let mut clients = build_clients(&options.protocol, config)?;

    let bounces = BounceStore::new(db.clone());
    let rules = RuleStore::new(db.clone());
    let subscribers = SubscriberStore::new(db);

    let download = DownloadProcessor::new(bounces.clone(), subscribers.clone(), options.test_mode)
        .run(&mut clients)?;

    let registry = ActionRegistry::standard(
        bounces.clone(),
        subscribers.clone(),
        &config.blacklist_reason,
    );
    let processing = AdvancedRuleProcessor::new(
        bounces.clone(),
        rules,
        subscribers.clone(),
        registry,
        options.rules_batch_size,
    )
    .run()?;

    let identified =
        UnidentifiedBounceReprocessor::new(bounces.clone(), subscribers.clone()).run()?;
    let unconfirmed = ConsecutiveBounceHandler::new(subscribers, config).run()?;

    let purged = if options.purge_unprocessed {
        let purged = bounces.purge_unmatched()?;
        log::info!("Purged {purged} unprocessed bounces");
        purged
    } else {
        0
    };

    Ok(JobSummary {
        download,
        processing,
        identified,
        unconfirmed,
        purged,
    })
}
