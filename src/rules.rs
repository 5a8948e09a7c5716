use crate::db::Db;
use anyhow::Result;
use regex::Regex;
use rusqlite::params;
use std::collections::HashMap;

/// A classification rule: a pattern matched against bounce text and the
/// remediation action to dispatch on a hit. `match_count` only ever grows.
#[derive(Debug, Clone)]
pub struct BounceRule {
    pub id: i64,
    pub priority: i64,
    pub pattern: String,
    pub action: String,
    pub match_count: i64,
}

#[derive(Clone)]
pub struct RuleStore {
    db: Db,
}

impl RuleStore {
    pub fn new(db: Db) -> Self {
        RuleStore { db }
    }

    /// Active rules in matching order: ascending priority, then id for a
    /// stable order between rules sharing a priority.
    pub fn load_active(&self) -> Result<Vec<BounceRule>> {
        let mut stmt = self.db.prepare(
            "SELECT id, priority, pattern, action, match_count FROM bounce_rule
             WHERE active = 1
             ORDER BY priority ASC, id ASC",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(BounceRule {
                    id: row.get(0)?,
                    priority: row.get(1)?,
                    pattern: row.get(2)?,
                    action: row.get(3)?,
                    match_count: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn insert(&self, priority: i64, pattern: &str, action: &str, active: bool) -> Result<i64> {
        self.db.execute(
            "INSERT INTO bounce_rule (priority, pattern, action, active) VALUES (?, ?, ?, ?)",
            params![priority, pattern, action, active as i64],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn increment_match_count(&self, rule_id: i64) -> Result<()> {
        self.db.execute(
            "UPDATE bounce_rule SET match_count = match_count + 1 WHERE id = ?",
            params![rule_id],
        )?;
        Ok(())
    }

    pub fn link_rule_to_bounce(&self, rule_id: i64, bounce_id: i64) -> Result<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO rule_match (rule_id, bounce_id) VALUES (?, ?)",
            params![rule_id, bounce_id],
        )?;
        Ok(())
    }

    pub fn match_count(&self, rule_id: i64) -> Result<i64> {
        let count: i64 = self.db.query_row(
            "SELECT match_count FROM bounce_rule WHERE id = ?",
            params![rule_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// First-match-wins matcher over an ordered rule list. Patterns are compiled
/// once up front; a pattern that fails to compile is logged and can never
/// match, so one bad rule does not abort the run.
pub struct RuleMatcher {
    compiled: HashMap<i64, Regex>,
}

impl RuleMatcher {
    pub fn new(rules: &[BounceRule]) -> Self {
        let mut compiled = HashMap::new();
        for rule in rules {
            match Regex::new(&rule.pattern) {
                Ok(regex) => {
                    compiled.insert(rule.id, regex);
                }
                Err(e) => {
                    log::warn!(
                        "Skipping bounce rule {} with invalid pattern '{}': {e}",
                        rule.id,
                        rule.pattern
                    );
                }
            }
        }
        RuleMatcher { compiled }
    }

    /// The first rule, in the order given, whose pattern matches `text`.
    pub fn match_text<'r>(&self, text: &str, rules: &'r [BounceRule]) -> Option<&'r BounceRule> {
        rules.iter().find(|rule| {
            self.compiled
                .get(&rule.id)
                .map(|regex| regex.is_match(text))
                .unwrap_or(false)
        })
    }
}
