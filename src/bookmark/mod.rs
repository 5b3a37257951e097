// ============================================================================
// Bookmarks
// ============================================================================
//
// A bookmark is the set of causal tokens a client has seen, grouped by
// database. Tokens are opaque: the server alone knows how they order. The
// client only ever unions them, which keeps merging commutative, associative
// and idempotent.
//
// Bookmarks are values. Nothing mutates one in place; a session replaces its
// bookmark with a merged copy after every commit, so a bookmark handed out
// earlier is never affected by later work.
//
// ============================================================================

use crate::core::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark {
    tokens: BTreeMap<String, BTreeSet<String>>,
}

impl Bookmark {
    /// A bookmark that places no causal constraint on the server.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a bookmark for `database` from raw server tokens.
    ///
    /// Blank tokens are dropped.
    pub fn new<I, S>(database: impl Into<String>, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = tokens
            .into_iter()
            .map(Into::into)
            .filter(|token| !token.trim().is_empty())
            .collect();

        let mut map = BTreeMap::new();
        if !set.is_empty() {
            map.insert(database.into(), set);
        }
        Self { tokens: map }
    }

    /// Union of two bookmarks. Neither input is modified.
    pub fn merge(&self, other: &Bookmark) -> Bookmark {
        let mut tokens = self.tokens.clone();
        for (database, set) in &other.tokens {
            tokens
                .entry(database.clone())
                .or_default()
                .extend(set.iter().cloned());
        }
        Bookmark { tokens }
    }

    /// Union of any number of bookmarks.
    pub fn merge_all<'a>(bookmarks: impl IntoIterator<Item = &'a Bookmark>) -> Bookmark {
        bookmarks
            .into_iter()
            .fold(Bookmark::empty(), |acc, bookmark| acc.merge(bookmark))
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.values().all(BTreeSet::is_empty)
    }

    /// Number of tokens across all databases.
    pub fn len(&self) -> usize {
        self.tokens.values().map(BTreeSet::len).sum()
    }

    /// The subset of this bookmark that belongs to `database`.
    pub fn for_database(&self, database: &str) -> Bookmark {
        let tokens = self
            .tokens
            .get(database)
            .map(|set| BTreeMap::from([(database.to_string(), set.clone())]))
            .unwrap_or_default();
        Bookmark { tokens }
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    pub fn tokens_for<'a>(&'a self, database: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.tokens
            .get(database)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// All tokens, regardless of database.
    pub fn to_token_set(&self) -> BTreeSet<String> {
        self.tokens.values().flatten().cloned().collect()
    }

    /// Rejects a bookmark that carries tokens for any database other than `database`.
    pub fn ensure_database(&self, database: &str) -> Result<()> {
        let foreign: Vec<&str> = self
            .tokens
            .iter()
            .filter(|(name, set)| name.as_str() != database && !set.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();

        if foreign.is_empty() {
            Ok(())
        } else {
            Err(DriverError::InvalidBookmark(format!(
                "bookmark holds tokens for database(s) [{}] but the session targets '{}'",
                foreign.join(", "),
                database
            )))
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .tokens
            .iter()
            .map(|(database, set)| {
                let joined = set.iter().cloned().collect::<Vec<_>>().join(",");
                format!("{database}=[{joined}]")
            })
            .collect();
        write!(f, "Bookmark{{{}}}", parts.join("; "))
    }
}

/// A session's current bookmark, replaced wholesale after each commit.
pub(crate) type SharedBookmark = Arc<Mutex<Bookmark>>;

/// Back-reference from a transaction to the bookmark of the session that opened it.
pub(crate) type BookmarkLink = Weak<Mutex<Bookmark>>;

/// Replaces the bookmark behind `link` with its union with `update`.
pub(crate) fn merge_into(link: &BookmarkLink, update: &Bookmark) -> Result<()> {
    if let Some(shared) = link.upgrade() {
        let mut current = shared.lock()?;
        *current = current.merge(update);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Bookmark> {
        vec![
            Bookmark::empty(),
            Bookmark::new("foo", ["foo:1"]),
            Bookmark::new("foo", ["foo:1", "foo:2"]),
            Bookmark::new("foo", ["foo:3"]),
            Bookmark::new("bar", ["bar:7"]),
            Bookmark::new("foo", ["foo:2"]).merge(&Bookmark::new("bar", ["bar:1"])),
        ]
    }

    #[test]
    fn test_merge_is_commutative() {
        for a in samples() {
            for b in samples() {
                assert_eq!(a.merge(&b), b.merge(&a), "{a} / {b}");
            }
        }
    }

    #[test]
    fn test_merge_is_associative() {
        for a in samples() {
            for b in samples() {
                for c in samples() {
                    assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
                }
            }
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        for a in samples() {
            assert_eq!(a.merge(&a), a);
            assert_eq!(a.merge(&Bookmark::empty()), a);
        }
    }

    #[test]
    fn test_merge_does_not_mutate_inputs() {
        let a = Bookmark::new("foo", ["foo:1"]);
        let b = Bookmark::new("foo", ["foo:2"]);
        let merged = a.merge(&b);

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_blank_tokens_are_ignored() {
        let bookmark = Bookmark::new("foo", ["", "  "]);
        assert!(bookmark.is_empty());
        assert_eq!(bookmark, Bookmark::empty());
    }

    #[test]
    fn test_for_database_filters() {
        let bookmark = Bookmark::new("foo", ["foo:1"]).merge(&Bookmark::new("bar", ["bar:1"]));

        let foo = bookmark.for_database("foo");
        assert_eq!(foo.tokens_for("foo").collect::<Vec<_>>(), vec!["foo:1"]);
        assert_eq!(foo.databases().collect::<Vec<_>>(), vec!["foo"]);
        assert!(bookmark.for_database("baz").is_empty());
    }

    #[test]
    fn test_ensure_database_rejects_foreign_tokens() {
        let bookmark = Bookmark::new("bar", ["bar:1"]);
        assert!(bookmark.ensure_database("bar").is_ok());
        assert!(matches!(
            bookmark.ensure_database("foo"),
            Err(DriverError::InvalidBookmark(_))
        ));
        assert!(Bookmark::empty().ensure_database("foo").is_ok());
    }

    #[test]
    fn test_serde_roundtrip_keeps_tokens() {
        let bookmark = Bookmark::new("foo", ["foo:1", "foo:9"]);
        let json = serde_json::to_string(&bookmark).unwrap();
        assert_eq!(json, r#"{"foo":["foo:1","foo:9"]}"#);
        let back: Bookmark = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bookmark);
    }
}
