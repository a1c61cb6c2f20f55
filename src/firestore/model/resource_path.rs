use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash-separated path of a collection or document, relative to the database root.
///
/// Ordering compares segment by segment, a prefix sorting before its extensions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath(Vec<String>);

impl ResourcePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parses `a/b/c`. Leading and trailing slashes are ignored, empty inner segments are not.
    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument(format!("Invalid path ({path}). Paths must not contain // in them.")));
        }
        Ok(Self::from_segments(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// The parent path; the root is its own parent.
    pub fn without_last(&self) -> Self {
        let end = self.0.len().saturating_sub(1);
        Self(self.0[..end].to_vec())
    }

    pub fn canonical_string(&self) -> String {
        self.0.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        other.0.len() == self.0.len() + 1 && self.is_prefix_of(other)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders() {
        let path = ResourcePath::from_string("/rooms/eros/messages/").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.last_segment(), Some("messages"));
        assert_eq!(path.to_string(), "rooms/eros/messages");
        assert!(ResourcePath::from_string("").unwrap().is_empty());
        assert!(ResourcePath::from_string("rooms//eros").is_err());
    }

    #[test]
    fn prefix_sorts_first() {
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let room = rooms.child("eros");
        assert!(rooms < room);
        assert!(room < ResourcePath::from_string("rooms-archive").unwrap());
        assert!(rooms.is_immediate_parent_of(&room));
        assert!(!rooms.is_immediate_parent_of(&room.child("messages")));
        assert_eq!(room.without_last(), rooms);
    }
}
