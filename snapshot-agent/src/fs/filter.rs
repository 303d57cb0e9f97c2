//! Keyspace and table include/exclude filters.
//!
//! Each filter is a comma-separated list of `keyspace` or `keyspace.table`
//! patterns; both halves are anchored regexes. Exclusion wins over inclusion,
//! and an empty include list includes everything.

use crate::utils::errors::{BackupError, Result};
use regex::Regex;

#[derive(Debug, Clone)]
struct TablePattern {
    keyspace: Regex,
    table: Option<Regex>,
}

impl TablePattern {
    fn parse(raw: &str) -> Result<Self> {
        let (keyspace, table) = match raw.split_once('.') {
            Some((ks, table)) => (ks, Some(table)),
            None => (raw, None),
        };
        Ok(Self {
            keyspace: anchored(keyspace)?,
            table: table.map(anchored).transpose()?,
        })
    }

    fn matches_keyspace(&self, keyspace: &str) -> bool {
        self.keyspace.is_match(keyspace)
    }

    fn matches(&self, keyspace: &str, table: &str) -> bool {
        self.keyspace.is_match(keyspace)
            && self.table.as_ref().map_or(true, |t| t.is_match(table))
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| BackupError::Config(format!("invalid filter pattern {pattern}: {e}")))
}

fn parse_list(list: &str) -> Result<Vec<TablePattern>> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(TablePattern::parse)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ColumnFamilyFilter {
    include: Vec<TablePattern>,
    exclude: Vec<TablePattern>,
}

impl ColumnFamilyFilter {
    pub fn new(include: &str, exclude: &str) -> Result<Self> {
        Ok(Self {
            include: parse_list(include)?,
            exclude: parse_list(exclude)?,
        })
    }

    /// True when no table of `keyspace` can pass the filter, so the whole
    /// keyspace directory can be skipped.
    pub fn is_keyspace_filtered(&self, keyspace: &str) -> bool {
        let excluded = self
            .exclude
            .iter()
            .any(|p| p.table.is_none() && p.matches_keyspace(keyspace));
        if excluded {
            return true;
        }
        !self.include.is_empty() && !self.include.iter().any(|p| p.matches_keyspace(keyspace))
    }

    pub fn is_table_filtered(&self, keyspace: &str, table: &str) -> bool {
        if self.is_keyspace_filtered(keyspace) {
            return true;
        }
        if self.exclude.iter().any(|p| p.matches(keyspace, table)) {
            return true;
        }
        !self.include.is_empty() && !self.include.iter().any(|p| p.matches(keyspace, table))
    }
}
