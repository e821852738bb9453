//! Forwarding rule table and matcher.
//!
//! The [`RuleTable`] is the sole owner of [`Rule`] objects. All mutation
//! goes through its synchronized methods; matching is a pure function over
//! a snapshot of the current rules, so a message may fan out to zero, one,
//! or many rules with no ordering or priority between them.

use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::models::rule::{ContentFilter, EndpointKind, Rule};
use crate::{AppError, Result};

/// Owner of the mutable forwarding rule set.
pub struct RuleTable {
    rules: RwLock<Vec<Rule>>,
    /// Mention target for [`ContentFilter::MentionsTarget`] rules.
    operator_name: String,
}

impl RuleTable {
    /// Build a table from an initial rule set.
    #[must_use]
    pub fn new(rules: Vec<Rule>, operator_name: impl Into<String>) -> Self {
        Self {
            rules: RwLock::new(rules),
            operator_name: operator_name.into(),
        }
    }

    /// Copy of the current rule set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Rule> {
        self.read().clone()
    }

    /// Number of rules in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the table holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append a new rule.
    pub fn add(&self, rule: Rule) {
        self.write().push(rule);
    }

    /// Replace the rule with the same id in place.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no rule has `rule.id`.
    pub fn update(&self, rule: Rule) -> Result<()> {
        let mut rules = self.write();
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(slot) => {
                *slot = rule;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("rule {}", rule.id))),
        }
    }

    /// Delete a rule by id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no rule has `rule_id`.
    pub fn remove(&self, rule_id: &str) -> Result<()> {
        let mut rules = self.write();
        let before = rules.len();
        rules.retain(|rule| rule.id != rule_id);
        if rules.len() == before {
            return Err(AppError::NotFound(format!("rule {rule_id}")));
        }
        Ok(())
    }

    /// Flip a rule's enabled flag, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no rule has `rule_id`.
    pub fn toggle(&self, rule_id: &str) -> Result<bool> {
        let mut rules = self.write();
        match rules.iter_mut().find(|rule| rule.id == rule_id) {
            Some(rule) => {
                rule.enabled = !rule.enabled;
                Ok(rule.enabled)
            }
            None => Err(AppError::NotFound(format!("rule {rule_id}"))),
        }
    }

    /// Find a rule by id.
    #[must_use]
    pub fn find(&self, rule_id: &str) -> Option<Rule> {
        self.read().iter().find(|rule| rule.id == rule_id).cloned()
    }

    /// Return every enabled rule whose source matches the inbound message.
    ///
    /// A rule matches when its source kind equals `origin_kind`, its source
    /// identifier is empty or equals `origin_identifier`, and the message
    /// body satisfies the rule's content filter. All matches are returned;
    /// the caller creates one task per match.
    #[must_use]
    pub fn match_rules(
        &self,
        content: &str,
        origin_identifier: &str,
        origin_kind: EndpointKind,
    ) -> Vec<Rule> {
        let matched: Vec<Rule> = self
            .read()
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| rule.source.kind == origin_kind)
            .filter(|rule| {
                rule.source.identifier.is_empty() || rule.source.identifier == origin_identifier
            })
            .filter(|rule| rule.source.filter.matches(content, &self.operator_name))
            .cloned()
            .collect();

        debug!(
            origin = origin_identifier,
            kind = origin_kind.label(),
            matched = matched.len(),
            "rule matching complete"
        );
        matched
    }

    /// Validate the rule set before the pipeline starts.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the table is empty, no rule is
    /// enabled, an enabled rule is missing its target identifier, or a
    /// range filter is missing either marker. The source identifier may be
    /// empty — that is the wildcard form.
    pub fn validate(&self) -> Result<()> {
        let rules = self.read();
        if rules.is_empty() {
            return Err(AppError::Config("no forwarding rules configured".into()));
        }

        let enabled: Vec<&Rule> = rules.iter().filter(|rule| rule.enabled).collect();
        if enabled.is_empty() {
            return Err(AppError::Config("no forwarding rule is enabled".into()));
        }

        for rule in enabled {
            if rule.target.identifier.is_empty() {
                return Err(AppError::Config(format!(
                    "rule '{}' has no target identifier",
                    rule.name
                )));
            }
            if let ContentFilter::Range {
                start_marker,
                end_marker,
            } = &rule.source.filter
            {
                if start_marker.is_empty() || end_marker.is_empty() {
                    return Err(AppError::Config(format!(
                        "rule '{}' range filter needs both start and end markers",
                        rule.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Rule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Rule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}
