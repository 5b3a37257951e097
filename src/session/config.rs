use crate::bookmark::Bookmark;
use crate::core::AccessMode;
use crate::transaction::TransactionConfig;
use std::collections::BTreeSet;

/// Per-session settings
///
/// Anything left unset falls back to the driver's [`crate::DriverConfig`].
///
/// # Examples
///
/// ```
/// use causaldb::{AccessMode, SessionConfig};
///
/// let config = SessionConfig::new()
///     .database("orders")
///     .default_access_mode(AccessMode::Read)
///     .with_bookmark_tokens(["orders:42"]);
/// assert_eq!(config.database.as_deref(), Some("orders"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Target database
    pub database: Option<String>,

    /// Mode used by [`crate::Session::run_default`] and
    /// [`crate::Session::begin_default_transaction`]
    pub default_access_mode: Option<AccessMode>,

    /// Causal starting point
    pub bookmark: Bookmark,

    /// Raw tokens for the session's database, e.g. received from another process
    pub bookmark_tokens: BTreeSet<String>,

    /// Applied to every transaction the session opens unless overridden
    pub transaction_config: TransactionConfig,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn default_access_mode(mut self, mode: AccessMode) -> Self {
        self.default_access_mode = Some(mode);
        self
    }

    /// Start from `bookmark`, merged with any bookmark set earlier.
    pub fn with_bookmark(mut self, bookmark: &Bookmark) -> Self {
        self.bookmark = self.bookmark.merge(bookmark);
        self
    }

    /// Start from raw tokens for the session's database.
    pub fn with_bookmark_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bookmark_tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn transaction_config(mut self, config: TransactionConfig) -> Self {
        self.transaction_config = config;
        self
    }

    /// The session's starting bookmark once its database is known.
    pub(crate) fn initial_bookmark(&self, database: &str) -> Bookmark {
        self.bookmark
            .merge(&Bookmark::new(database, self.bookmark_tokens.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_bookmark_merges_tokens_and_bookmark() {
        let config = SessionConfig::new()
            .with_bookmark(&Bookmark::new("foo", ["foo:1"]))
            .with_bookmark_tokens(["foo:2", ""]);

        let bookmark = config.initial_bookmark("foo");
        assert_eq!(
            bookmark.tokens_for("foo").collect::<Vec<_>>(),
            vec!["foo:1", "foo:2"]
        );
    }

    #[test]
    fn test_defaults_are_unset() {
        let config = SessionConfig::default();
        assert!(config.database.is_none());
        assert!(config.default_access_mode.is_none());
        assert!(config.initial_bookmark("foo").is_empty());
    }
}
