use regex::Regex;
use crate::{Result, SqlSplitError};

/// Pulls prefixed table identifiers out of raw SQL text.
///
/// No parsing happens here: every occurrence of `<prefix><identifier>` on a word
/// boundary counts, in order of appearance, duplicates included. The prefix is
/// stripped from the returned names. With an empty prefix every lowercase word
/// matches, so deployments are expected to configure one.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    prefix: String,
    table_pattern: Regex,
    create_temp_pattern: Regex,
    drop_table_pattern: Regex,
}

/// Temp-table lifecycle statement found in a DDL string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempTableChange {
    Created(String),
    Dropped(String),
}

const IDENTIFIER: &str = "[a-z][A-Za-z0-9_]*";

impl TableExtractor {
    pub fn new(prefix: &str) -> Result<Self> {
        let escaped = regex::escape(prefix);
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| {
                SqlSplitError::Config(format!("invalid table prefix {prefix:?}: {e}"))
            })
        };

        Ok(Self {
            prefix: prefix.to_string(),
            table_pattern: compile(format!(r"\b{escaped}({IDENTIFIER})"))?,
            create_temp_pattern: compile(format!(
                r"(?i:\bcreate\s+temp(?:orary)?\s+table\s+(?:if\s+not\s+exists\s+)?){escaped}({IDENTIFIER})"
            ))?,
            drop_table_pattern: compile(format!(
                r"(?i:\bdrop\s+table\s+(?:if\s+exists\s+)?){escaped}({IDENTIFIER})"
            ))?,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Table names referenced by `sql`, in order, duplicates preserved
    pub fn table_names(&self, sql: &str) -> Vec<String> {
        self.table_pattern
            .captures_iter(sql)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Detect `CREATE TEMP TABLE` / `DROP TABLE` for a prefixed table
    pub fn temp_table_change(&self, sql: &str) -> Option<TempTableChange> {
        if let Some(caps) = self.create_temp_pattern.captures(sql) {
            return caps.get(1).map(|m| TempTableChange::Created(m.as_str().to_string()));
        }
        self.drop_table_pattern
            .captures(sql)
            .and_then(|caps| caps.get(1))
            .map(|m| TempTableChange::Dropped(m.as_str().to_string()))
    }
}
