#![forbid(unsafe_code)]

//! Tree paths in JSON-pointer form.
//!
//! A [`Path`] is a list of segments. Its string form is `/a/b/c` with `~`
//! escaped as `~0` and `/` as `~1`; the root path is the empty string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TreeError;

/// Location of a node or field inside the state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<String>);

impl Path {
    /// The root path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from raw (unescaped) segments.
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a pointer string such as `/entities/e1/position`.
    pub fn parse(s: &str) -> Result<Self, TreeError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(TreeError::MalformedPath(s.to_string()));
        };
        Ok(Self(
            rest.split('/')
                .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
                .collect(),
        ))
    }

    /// Append a segment, returning the child path.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The final segment, or `None` for the root.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `prefix` is this path or one of its ancestors.
    #[must_use]
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            write!(f, "/{}", seg.replace('~', "~0").replace('/', "~1"))?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_empty_string() {
        assert_eq!(Path::root().to_string(), "");
        assert!(Path::parse("").unwrap().is_root());
    }

    #[test]
    fn parse_and_display_round_trip() {
        let path = Path::parse("/entities/e1/position").unwrap();
        assert_eq!(path.segments(), ["entities", "e1", "position"]);
        assert_eq!(path.to_string(), "/entities/e1/position");
    }

    #[test]
    fn escapes_slash_and_tilde() {
        let path = Path::from_segments(["a/b", "c~d"]);
        assert_eq!(path.to_string(), "/a~1b/c~0d");
        assert_eq!(Path::parse("/a~1b/c~0d").unwrap(), path);
    }

    #[test]
    fn missing_leading_slash_is_rejected() {
        assert!(matches!(
            Path::parse("entities"),
            Err(TreeError::MalformedPath(_))
        ));
    }

    #[test]
    fn parent_child_and_prefix() {
        let entities = Path::from_segments(["entities"]);
        let e1 = entities.child("e1");
        assert_eq!(e1.parent(), Some(entities.clone()));
        assert_eq!(e1.last(), Some("e1"));
        assert!(e1.starts_with(&entities));
        assert!(e1.starts_with(&Path::root()));
        assert!(!entities.starts_with(&e1));
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn serde_uses_pointer_string() {
        let path = Path::from_segments(["players", "p1"]);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/players/p1\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
