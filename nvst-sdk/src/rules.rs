use anyhow::{Context as _, Result};
use regex::{Captures, Regex};

use crate::{DeviceSource, ExtractedFields};

/// Portion of a device log a rule searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Whole,
    /// Only the text after the last `after test` marker.
    AfterTest,
}

/// A single named field extraction: one pattern, one assignment.
#[derive(Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub scope: Scope,
    pub pattern: &'static str,
    pub assign: fn(&mut ExtractedFields, &Captures<'_>),
}

impl std::fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldRule")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Compiled rule table. Rules are independent and order-insensitive.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<(FieldRule, Regex)>,
}

impl RuleSet {
    pub fn compile(rules: &[FieldRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(rule.pattern)
                    .map(|regex| (*rule, regex))
                    .with_context(|| format!("invalid pattern for rule {}", rule.name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|(rule, _)| rule.name)
    }

    /// Runs every rule against its scope; returns the names of rules that matched.
    pub fn apply(&self, source: &DeviceSource<'_>, fields: &mut ExtractedFields) -> Vec<&'static str> {
        let after = source.after_test();
        let mut matched = Vec::new();

        for (rule, regex) in &self.rules {
            let haystack = match rule.scope {
                Scope::Whole => source.text,
                Scope::AfterTest => match after {
                    Some(tail) => tail,
                    None => continue,
                },
            };

            if let Some(caps) = regex.captures(haystack) {
                (rule.assign)(fields, &caps);
                matched.push(rule.name);
            }
        }

        matched
    }
}

/// Capture group `index`, trimmed.
pub fn group(caps: &Captures<'_>, index: usize) -> Option<String> {
    caps.get(index).map(|m| m.as_str().trim().to_string())
}
