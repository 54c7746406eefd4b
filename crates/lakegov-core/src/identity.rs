//! Group-name to external-id lookup

use std::collections::BTreeMap;

/// Resolves a group name to the identifier the identity provider puts in
/// federated sessions.
///
/// Directory synchronization is eventually consistent, so `None` means
/// "not known yet" rather than "does not exist".
pub trait IdentityDirectory: Send + Sync {
    fn group_id(&self, group_name: &str) -> Option<String>;
}

/// Directory backed by the `identity.groups` table of the configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    groups: BTreeMap<String, String>,
}

impl StaticDirectory {
    pub fn new(groups: BTreeMap<String, String>) -> Self {
        Self { groups }
    }

    pub fn with_group(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.groups.insert(name.into(), id.into());
        self
    }
}

impl IdentityDirectory for StaticDirectory {
    fn group_id(&self, group_name: &str) -> Option<String> {
        self.groups
            .get(group_name)
            .filter(|id| !id.trim().is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let directory = StaticDirectory::default()
            .with_group("data-engineers-dev", "g-0001")
            .with_group("pending", "");

        assert_eq!(directory.group_id("data-engineers-dev"), Some("g-0001".to_string()));
        assert_eq!(directory.group_id("pending"), None);
        assert_eq!(directory.group_id("unknown"), None);
    }
}
