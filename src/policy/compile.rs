use tracing::debug;

use super::model::{RuleEntry, RuleList};

/// Parses newline-separated rule text into a [`RuleList`].
///
/// Each line is trimmed and split on `/`; every part is trimmed again. Blank lines and lines
/// whose owner part is empty are dropped.
pub fn parse_rule_list(text: &str) -> RuleList {
    let mut entries = Vec::new();
    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('/').map(str::trim).collect();
        match RuleEntry::from_parts(&parts) {
            Some(entry) => entries.push(entry),
            None => debug!(line, "dropping rule list entry with empty owner"),
        }
    }
    RuleList::new(entries)
}
