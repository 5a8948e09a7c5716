use crate::bounces::{Bounce, BounceStore};
use crate::subscribers::{Subscriber, SubscriberStore};
use anyhow::Result;

/// The remediation actions a bounce rule can request. Rules store the
/// identifier as text; everything past `parse` works with the enum so the
/// dispatch table is checked exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    BlacklistEmailAndDeleteBounce,
    BlacklistUserAndDeleteBounce,
    BlacklistUser,
    DecreaseCountConfirmUserAndDeleteBounce,
    DeleteUser,
}

impl ActionKind {
    pub fn parse(action: &str) -> Option<ActionKind> {
        match action {
            "blacklistemailanddeletebounce" => Some(ActionKind::BlacklistEmailAndDeleteBounce),
            "blacklistuseranddeletebounce" => Some(ActionKind::BlacklistUserAndDeleteBounce),
            "blacklistuser" => Some(ActionKind::BlacklistUser),
            "decreasecountconfirmuseranddeletebounce" => {
                Some(ActionKind::DecreaseCountConfirmUserAndDeleteBounce)
            }
            "deleteuser" => Some(ActionKind::DeleteUser),
            _ => None,
        }
    }
}

/// Ephemeral per-bounce value passed to exactly one handler and discarded.
/// `confirmed`/`blacklisted` are the subscriber's flags as of the lookup.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub subscriber: Option<Subscriber>,
    pub bounce: Bounce,
    pub user_id: i64,
    pub confirmed: bool,
    pub blacklisted: bool,
    pub rule_id: i64,
}

impl ProcessingContext {
    pub fn new(subscriber: Option<Subscriber>, bounce: Bounce, user_id: i64, rule_id: i64) -> Self {
        let (confirmed, blacklisted) = subscriber
            .as_ref()
            .map(|s| (s.confirmed, s.blacklisted))
            .unwrap_or((false, false));
        ProcessingContext {
            subscriber,
            bounce,
            user_id,
            confirmed,
            blacklisted,
            rule_id,
        }
    }
}

pub trait ActionHandler {
    fn supports(&self, action: ActionKind) -> bool;
    fn handle(&self, context: &ProcessingContext) -> Result<()>;
}

/// Unordered handler collection; dispatch invokes the first handler whose
/// `supports` answers for the action. An identifier no handler supports
/// leaves the bounce unresolved, which is intentional and not an error.
pub struct ActionRegistry {
    handlers: Vec<Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        ActionRegistry { handlers: Vec::new() }
    }

    /// The full handler set for the five defined action identifiers.
    pub fn standard(bounces: BounceStore, subscribers: SubscriberStore, blacklist_reason: &str) -> Self {
        let mut registry = ActionRegistry::new();
        registry.register(Box::new(BlacklistEmailAndDeleteBounce {
            bounces: bounces.clone(),
            subscribers: subscribers.clone(),
            reason: blacklist_reason.to_string(),
        }));
        registry.register(Box::new(BlacklistUserAndDeleteBounce {
            bounces: bounces.clone(),
            subscribers: subscribers.clone(),
        }));
        registry.register(Box::new(BlacklistUser {
            subscribers: subscribers.clone(),
        }));
        registry.register(Box::new(DecreaseCountConfirmUserAndDeleteBounce {
            bounces,
            subscribers: subscribers.clone(),
        }));
        registry.register(Box::new(DeleteUser { subscribers }));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch by raw action identifier. Returns whether any handler ran.
    pub fn dispatch(&self, action: &str, context: &ProcessingContext) -> Result<bool> {
        let kind = match ActionKind::parse(action) {
            Some(kind) => kind,
            None => {
                log::debug!("Unknown bounce action '{action}', leaving bounce {} unresolved", context.bounce.id);
                return Ok(false);
            }
        };
        for handler in &self.handlers {
            if handler.supports(kind) {
                handler.handle(context)?;
                return Ok(true);
            }
        }
        log::debug!("No handler for action '{action}', leaving bounce {} unresolved", context.bounce.id);
        Ok(false)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Blacklist the subscriber's address with a reason, then delete the bounce.
struct BlacklistEmailAndDeleteBounce {
    bounces: BounceStore,
    subscribers: SubscriberStore,
    reason: String,
}

impl ActionHandler for BlacklistEmailAndDeleteBounce {
    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::BlacklistEmailAndDeleteBounce
    }

    fn handle(&self, context: &ProcessingContext) -> Result<()> {
        let Some(subscriber) = &context.subscriber else {
            return Ok(());
        };
        if !context.blacklisted {
            self.subscribers.blacklist_email(&subscriber.email, &self.reason)?;
            self.subscribers.add_history(
                subscriber.id,
                "Blacklisted email",
                &format!("Email blacklisted after bounce rule {} matched", context.rule_id),
            )?;
        }
        self.bounces.delete(context.bounce.id)?;
        Ok(())
    }
}

/// Blacklist the subscriber, then delete the bounce.
struct BlacklistUserAndDeleteBounce {
    bounces: BounceStore,
    subscribers: SubscriberStore,
}

impl ActionHandler for BlacklistUserAndDeleteBounce {
    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::BlacklistUserAndDeleteBounce
    }

    fn handle(&self, context: &ProcessingContext) -> Result<()> {
        let Some(subscriber) = &context.subscriber else {
            return Ok(());
        };
        if !context.blacklisted {
            self.subscribers.set_blacklisted(subscriber.id)?;
            self.subscribers.add_history(
                subscriber.id,
                "Blacklisted subscriber",
                &format!("Subscriber blacklisted after bounce rule {} matched", context.rule_id),
            )?;
        }
        self.bounces.delete(context.bounce.id)?;
        Ok(())
    }
}

/// Blacklist the subscriber; the bounce stays for later inspection.
struct BlacklistUser {
    subscribers: SubscriberStore,
}

impl ActionHandler for BlacklistUser {
    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::BlacklistUser
    }

    fn handle(&self, context: &ProcessingContext) -> Result<()> {
        let Some(subscriber) = &context.subscriber else {
            return Ok(());
        };
        if !context.blacklisted {
            self.subscribers.set_blacklisted(subscriber.id)?;
            self.subscribers.add_history(
                subscriber.id,
                "Blacklisted subscriber",
                &format!("Subscriber blacklisted after bounce rule {} matched", context.rule_id),
            )?;
        }
        Ok(())
    }
}

/// Give the subscriber a bounce back and make sure they count as confirmed,
/// then delete the bounce.
struct DecreaseCountConfirmUserAndDeleteBounce {
    bounces: BounceStore,
    subscribers: SubscriberStore,
}

impl ActionHandler for DecreaseCountConfirmUserAndDeleteBounce {
    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::DecreaseCountConfirmUserAndDeleteBounce
    }

    fn handle(&self, context: &ProcessingContext) -> Result<()> {
        let Some(subscriber) = &context.subscriber else {
            return Ok(());
        };
        self.subscribers.decrement_bounce_count(subscriber.id)?;
        if !context.confirmed {
            self.subscribers.set_confirmed(subscriber.id)?;
            self.subscribers.add_history(
                subscriber.id,
                "Confirmed subscriber",
                &format!("Subscriber re-confirmed after bounce rule {} matched", context.rule_id),
            )?;
        }
        self.bounces.delete(context.bounce.id)?;
        Ok(())
    }
}

/// Remove the subscriber entirely. The bounce row is left alone; subscriber
/// removal cascades through the persistence layer.
struct DeleteUser {
    subscribers: SubscriberStore,
}

impl ActionHandler for DeleteUser {
    fn supports(&self, action: ActionKind) -> bool {
        action == ActionKind::DeleteUser
    }

    fn handle(&self, context: &ProcessingContext) -> Result<()> {
        let Some(subscriber) = &context.subscriber else {
            return Ok(());
        };
        log::info!(
            "Deleting subscriber {} ({}) after bounce rule {} matched",
            subscriber.id,
            subscriber.email,
            context.rule_id
        );
        self.subscribers.delete(subscriber.id)?;
        Ok(())
    }
}
