use super::model::{RuleEntry, RuleList};

impl RuleEntry {
    pub fn matches(&self, owner: &str, repo: &str) -> bool {
        match self {
            RuleEntry::Owner(expected) => expected.as_ref() == owner,
            RuleEntry::Repo {
                owner: expected_owner,
                repo: expected_repo,
            } => expected_owner.as_ref() == owner && expected_repo.as_ref() == repo,
            RuleEntry::AnyOwnerRepo { repo: expected } => expected.as_ref() == repo,
        }
    }
}

impl RuleList {
    /// First entry matching the `[owner, repo, ..]` components. Fewer than two components
    /// never match.
    pub fn find_match(&self, components: &[&str]) -> Option<&RuleEntry> {
        let [owner, repo, ..] = components else {
            return None;
        };
        self.entries()
            .iter()
            .find(|entry| entry.matches(owner, repo))
    }

    pub fn matches(&self, components: &[&str]) -> bool {
        self.find_match(components).is_some()
    }
}
