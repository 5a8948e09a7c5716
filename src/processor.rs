use crate::actions::{ActionRegistry, ProcessingContext};
use crate::bounces::BounceStore;
use crate::rules::{RuleMatcher, RuleStore};
use crate::subscribers::SubscriberStore;
use anyhow::Result;

/// Outcome of one advanced-processing run.
#[derive(Debug, Default, Clone)]
pub struct ProcessorReport {
    pub rules_loaded: usize,
    pub matched: u64,
    pub unmatched: u64,
    pub processed: u64,
    pub total: u64,
}

/// The classification batch loop: walks unclassified bounces in ascending
/// link-id order, matches each against the active rules and dispatches the
/// matched rule's action.
pub struct AdvancedRuleProcessor {
    bounces: BounceStore,
    rules: RuleStore,
    subscribers: SubscriberStore,
    registry: ActionRegistry,
    batch_size: usize,
}

impl AdvancedRuleProcessor {
    pub fn new(
        bounces: BounceStore,
        rules: RuleStore,
        subscribers: SubscriberStore,
        registry: ActionRegistry,
        batch_size: usize,
    ) -> Self {
        AdvancedRuleProcessor {
            bounces,
            rules,
            subscribers,
            registry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run(&self) -> Result<ProcessorReport> {
        let rules = self.rules.load_active()?;
        if rules.is_empty() {
            log::info!("No active bounce rules, skipping advanced processing");
            return Ok(ProcessorReport::default());
        }
        let matcher = RuleMatcher::new(&rules);

        // Snapshot taken once; action handlers delete rows as we go, so the
        // percentage is an approximation, never refreshed mid-run.
        let total = self.bounces.count_unclassified()?;
        let mut report = ProcessorReport {
            rules_loaded: rules.len(),
            total,
            ..Default::default()
        };

        let mut from_id = 0i64;
        loop {
            let batch = self.bounces.fetch_batch(from_id, self.batch_size)?;
            if batch.is_empty() {
                break;
            }

            for row in batch {
                from_id = row.link_id;
                let text = format!("{}\n\n{}", row.bounce.header, row.bounce.data);

                match matcher.match_text(&text, &rules) {
                    Some(rule) => {
                        self.rules.increment_match_count(rule.id)?;
                        self.rules.link_rule_to_bounce(rule.id, row.bounce.id)?;

                        let subscriber = self.subscribers.find(row.user_id)?;
                        let context =
                            ProcessingContext::new(subscriber, row.bounce, row.user_id, rule.id);
                        self.registry.dispatch(&rule.action, &context)?;
                        report.matched += 1;
                    }
                    None => {
                        report.unmatched += 1;
                    }
                }
                report.processed += 1;
            }

            // Deletions can shrink the underlying count below the snapshot;
            // never report past the starting total.
            let shown = report.processed.min(total);
            log::info!("Advanced bounce processing: {shown}/{total} bounces processed");
        }

        log::info!(
            "Advanced bounce processing done: {} matched, {} not matched",
            report.matched,
            report.unmatched
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionHandler, ActionKind};
    use crate::db;
    use anyhow::bail;
    use chrono::Utc;

    struct Fixture {
        bounces: BounceStore,
        rules: RuleStore,
        subscribers: SubscriberStore,
    }

    fn fixture() -> Fixture {
        let db = db::open_in_memory().unwrap();
        Fixture {
            bounces: BounceStore::new(db.clone()),
            rules: RuleStore::new(db.clone()),
            subscribers: SubscriberStore::new(db),
        }
    }

    fn processor(f: &Fixture, batch_size: usize) -> AdvancedRuleProcessor {
        let registry =
            ActionRegistry::standard(f.bounces.clone(), f.subscribers.clone(), "bounced");
        AdvancedRuleProcessor::new(
            f.bounces.clone(),
            f.rules.clone(),
            f.subscribers.clone(),
            registry,
            batch_size,
        )
    }

    fn add_bounce(f: &Fixture, user_id: i64, body: &str) -> i64 {
        let id = f.bounces.insert("Subject: failure notice", body, Utc::now()).unwrap();
        f.bounces.link_to_message(id, user_id, 1).unwrap();
        id
    }

    #[test]
    fn test_no_active_rules_does_no_work() {
        let f = fixture();
        add_bounce(&f, 1, "550 user unknown");
        let report = processor(&f, 10).run().unwrap();
        assert_eq!(report.rules_loaded, 0);
        assert_eq!(report.processed, 0);
        assert_eq!(f.bounces.count_unclassified().unwrap(), 1);
    }

    #[test]
    fn test_blacklist_scenario() {
        // A blacklistuser rule matching a bounce tied to an unconfirmed,
        // non-blacklisted subscriber.
        let f = fixture();
        let user = f.subscribers.insert("alice@example.com", false).unwrap();
        let rule = f.rules.insert(10, "user unknown", "blacklistuser", true).unwrap();
        let bounce = add_bounce(&f, user, "550 5.1.1 user unknown");

        let report = processor(&f, 10).run().unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.unmatched, 0);
        let subscriber = f.subscribers.find(user).unwrap().unwrap();
        assert!(subscriber.blacklisted);
        assert_eq!(f.subscribers.history_count(user).unwrap(), 1);
        assert_eq!(f.rules.match_count(rule).unwrap(), 1);
        // blacklistuser leaves the bounce in place.
        assert!(f.bounces.find(bounce).unwrap().is_some());
    }

    #[test]
    fn test_delete_user_scenario() {
        let f = fixture();
        let user = f.subscribers.insert("gone@example.com", true).unwrap();
        f.rules.insert(10, "user unknown", "deleteuser", true).unwrap();
        let bounce = add_bounce(&f, user, "550 user unknown");

        processor(&f, 10).run().unwrap();

        assert!(f.subscribers.find(user).unwrap().is_none());
        assert!(f.bounces.find(bounce).unwrap().is_some());
    }

    #[test]
    fn test_unmatched_bounces_left_untouched() {
        let f = fixture();
        f.rules.insert(10, "user unknown", "blacklistuser", true).unwrap();
        let bounce = add_bounce(&f, 1, "450 greylisted, try again later");

        let report = processor(&f, 10).run().unwrap();

        assert_eq!(report.matched, 0);
        assert_eq!(report.unmatched, 1);
        assert!(f.bounces.find(bounce).unwrap().is_some());
    }

    #[test]
    fn test_header_participates_in_classification_text() {
        let f = fixture();
        f.rules.insert(10, "failure notice", "blacklistuser", true).unwrap();
        add_bounce(&f, 1, "no diagnostic at all");

        let report = processor(&f, 10).run().unwrap();
        assert_eq!(report.matched, 1);
    }

    #[test]
    fn test_multiple_batches_cover_everything_once() {
        let f = fixture();
        f.rules.insert(10, "user unknown", "blacklistuser", true).unwrap();
        for i in 0..7 {
            let user = f
                .subscribers
                .insert(&format!("user{i}@example.com"), true)
                .unwrap();
            add_bounce(&f, user, "550 user unknown");
        }

        let report = processor(&f, 3).run().unwrap();

        assert_eq!(report.processed, 7);
        assert_eq!(report.matched, 7);
        assert_eq!(report.total, 7);
    }

    #[test]
    fn test_deleting_actions_do_not_stall_the_cursor() {
        // Handlers that delete bounces shrink the underlying set mid-run; the
        // cursor keeps advancing and terminates on the empty batch.
        let f = fixture();
        f.rules
            .insert(10, "user unknown", "blacklistuseranddeletebounce", true)
            .unwrap();
        for i in 0..5 {
            let user = f
                .subscribers
                .insert(&format!("user{i}@example.com"), true)
                .unwrap();
            add_bounce(&f, user, "550 user unknown");
        }

        let report = processor(&f, 2).run().unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(f.bounces.count_unclassified().unwrap(), 0);
    }

    struct FailingHandler;

    impl ActionHandler for FailingHandler {
        fn supports(&self, action: ActionKind) -> bool {
            action == ActionKind::BlacklistUser
        }

        fn handle(&self, _context: &ProcessingContext) -> Result<()> {
            bail!("simulated handler failure")
        }
    }

    #[test]
    fn test_handler_failure_aborts_the_run() {
        let f = fixture();
        f.rules.insert(10, "user unknown", "blacklistuser", true).unwrap();
        for i in 0..4 {
            add_bounce(&f, i, "550 user unknown");
        }

        let mut registry = ActionRegistry::new();
        registry.register(Box::new(FailingHandler));
        let processor = AdvancedRuleProcessor::new(
            f.bounces.clone(),
            f.rules.clone(),
            f.subscribers.clone(),
            registry,
            2,
        );

        assert!(processor.run().is_err());
        // The failing bounce got its rule link before dispatch; the rest of
        // the set was never fetched.
        assert_eq!(f.bounces.count_unclassified().unwrap(), 3);
    }

    #[test]
    fn test_unknown_action_still_counts_as_matched() {
        let f = fixture();
        let rule = f.rules.insert(10, "user unknown", "ringthebell", true).unwrap();
        add_bounce(&f, 1, "550 user unknown");

        let report = processor(&f, 10).run().unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(f.rules.match_count(rule).unwrap(), 1);
    }
}
