//! Account-header rules: URL-prefix → header-name mappings.
//!
//! The reverse-proxy data plane resolves which request headers may carry the
//! caller's account by matching the request's `host/path` against the rule
//! set: longest prefix wins, with a `*` wildcard rule as universal fallback.

use serde::{Deserialize, Serialize};

/// The universal fallback rule key.
pub const WILDCARD_PREFIX: &str = "*";

/// One rule row as persisted in the strong store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHeaderRule {
    /// `host/path` prefix, or `*` for the fallback.
    pub url_prefix: String,
    /// Header names, returned verbatim on match.
    pub headers: Vec<String>,
    pub updated_at_ns: i64,
}

/// Immutable resolution table built from the current rule set.
///
/// Rebuilt on rule CRUD and swapped in atomically; resolution itself is
/// lock-free.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    /// Sorted by prefix length descending so the first prefix hit wins.
    rules: Vec<AccountHeaderRule>,
    wildcard: Option<Vec<String>>,
}

impl RuleTable {
    #[must_use]
    pub fn new(mut rules: Vec<AccountHeaderRule>) -> Self {
        let wildcard = rules
            .iter()
            .find(|r| r.url_prefix == WILDCARD_PREFIX)
            .map(|r| r.headers.clone());
        rules.retain(|r| r.url_prefix != WILDCARD_PREFIX);
        rules.sort_by(|a, b| b.url_prefix.len().cmp(&a.url_prefix.len()));
        Self { rules, wildcard }
    }

    /// Resolves the header list for `host` + `path`.
    ///
    /// The target is normalized to `host/path` with the host lowercased and
    /// any port stripped. Longest matching prefix wins; `*` is the fallback.
    #[must_use]
    pub fn resolve(&self, host: &str, path: &str) -> Option<&[String]> {
        let target = normalize_target(host, path);
        self.rules
            .iter()
            .find(|r| target.starts_with(&r.url_prefix))
            .map(|r| r.headers.as_slice())
            .or(self.wildcard.as_deref())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len() + usize::from(self.wildcard.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercased host without port, concatenated with the path.
fn normalize_target(host: &str, path: &str) -> String {
    let host = crate::authority::extract_authority(host);
    if path.starts_with('/') {
        format!("{host}{path}")
    } else {
        format!("{host}/{path}")
    }
}
