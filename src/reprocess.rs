use crate::bounces::BounceStore;
use crate::config::Config;
use crate::download::{extract_list_member, extract_message_id};
use crate::subscribers::SubscriberStore;
use anyhow::Result;

/// Second look at bounces that arrived without any subscriber linkage.
///
/// Identification can fail on the first pass when the subscriber was added
/// after the bounce was downloaded, or when the stamped headers sit deep in a
/// forwarded notification. This sweep re-reads the stored text and creates
/// the missing linkage where it now resolves, putting the bounce back in
/// reach of the next advanced-processing run.
pub struct UnidentifiedBounceReprocessor {
    bounces: BounceStore,
    subscribers: SubscriberStore,
}

impl UnidentifiedBounceReprocessor {
    pub fn new(bounces: BounceStore, subscribers: SubscriberStore) -> Self {
        UnidentifiedBounceReprocessor { bounces, subscribers }
    }

    /// Returns the number of bounces newly identified.
    pub fn run(&self) -> Result<u64> {
        let mut identified = 0u64;
        for bounce in self.bounces.unmatched_bounces()? {
            if self.bounces.has_link(bounce.id)? {
                continue;
            }
            let text = format!("{}\n\n{}", bounce.header, bounce.data);
            let Some(email) = extract_list_member(&text) else {
                continue;
            };
            let Some(subscriber) = self.subscribers.find_by_email(&email)? else {
                continue;
            };
            let message_id = extract_message_id(&text).unwrap_or(0);
            self.bounces.link_to_message(bounce.id, subscriber.id, message_id)?;
            self.subscribers.increment_bounce_count(subscriber.id)?;
            identified += 1;
        }
        if identified > 0 {
            log::info!("Re-identified {identified} previously unidentified bounces");
        }
        Ok(identified)
    }
}

/// Unconfirms subscribers whose bounce count reached the configured
/// threshold, with a history entry. Blacklisted subscribers are left alone.
pub struct ConsecutiveBounceHandler {
    subscribers: SubscriberStore,
    threshold: u32,
}

impl ConsecutiveBounceHandler {
    pub fn new(subscribers: SubscriberStore, config: &Config) -> Self {
        ConsecutiveBounceHandler {
            subscribers,
            threshold: config.consecutive_bounce_threshold,
        }
    }

    /// Returns the number of subscribers unconfirmed by this pass.
    pub fn run(&self) -> Result<u64> {
        let mut unconfirmed = 0u64;
        for subscriber in self.subscribers.over_bounce_threshold(self.threshold)? {
            self.subscribers.set_unconfirmed(subscriber.id)?;
            self.subscribers.add_history(
                subscriber.id,
                "Auto unconfirmed",
                &format!(
                    "Subscriber auto unconfirmed after {} consecutive bounces",
                    subscriber.bounce_count
                ),
            )?;
            log::info!(
                "Unconfirmed subscriber {} ({}) after {} bounces",
                subscriber.id,
                subscriber.email,
                subscriber.bounce_count
            );
            unconfirmed += 1;
        }
        Ok(unconfirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Utc;

    struct Fixture {
        bounces: BounceStore,
        subscribers: SubscriberStore,
    }

    fn fixture() -> Fixture {
        let db = db::open_in_memory().unwrap();
        Fixture {
            bounces: BounceStore::new(db.clone()),
            subscribers: SubscriberStore::new(db),
        }
    }

    #[test]
    fn test_reprocessor_links_newly_known_subscribers() {
        let f = fixture();
        // The bounce arrived before anybody knew this address.
        let bounce = f
            .bounces
            .insert("Subject: failure", "550 unknown\nX-ListMember: late@example.com", Utc::now())
            .unwrap();
        let reprocessor = UnidentifiedBounceReprocessor::new(f.bounces.clone(), f.subscribers.clone());
        assert_eq!(reprocessor.run().unwrap(), 0);

        let user = f.subscribers.insert("late@example.com", true).unwrap();
        assert_eq!(reprocessor.run().unwrap(), 1);
        assert!(f.bounces.has_link(bounce).unwrap());
        assert_eq!(f.bounces.count_unclassified().unwrap(), 1);
        assert_eq!(f.subscribers.find(user).unwrap().unwrap().bounce_count, 1);

        // Already linked now; nothing left to identify.
        assert_eq!(reprocessor.run().unwrap(), 0);
    }

    #[test]
    fn test_consecutive_handler_unconfirms_over_threshold() {
        let f = fixture();
        let heavy = f.subscribers.insert("heavy@example.com", true).unwrap();
        let light = f.subscribers.insert("light@example.com", true).unwrap();
        for _ in 0..5 {
            f.subscribers.increment_bounce_count(heavy).unwrap();
        }
        f.subscribers.increment_bounce_count(light).unwrap();

        let config = Config::default();
        let handler = ConsecutiveBounceHandler::new(f.subscribers.clone(), &config);
        assert_eq!(handler.run().unwrap(), 1);

        let subscriber = f.subscribers.find(heavy).unwrap().unwrap();
        assert!(!subscriber.confirmed);
        assert_eq!(f.subscribers.history_count(heavy).unwrap(), 1);
        assert!(f.subscribers.find(light).unwrap().unwrap().confirmed);

        // Second pass finds nobody confirmed over the threshold.
        assert_eq!(handler.run().unwrap(), 0);
    }

    #[test]
    fn test_consecutive_handler_skips_blacklisted() {
        let f = fixture();
        let listed = f.subscribers.insert("listed@example.com", true).unwrap();
        for _ in 0..9 {
            f.subscribers.increment_bounce_count(listed).unwrap();
        }
        f.subscribers.set_blacklisted(listed).unwrap();

        let config = Config::default();
        let handler = ConsecutiveBounceHandler::new(f.subscribers.clone(), &config);
        assert_eq!(handler.run().unwrap(), 0);
        assert!(f.subscribers.find(listed).unwrap().unwrap().confirmed);
    }
}
