//! Remote paths.
//!
//! A [`RemotePath`] addresses one node in the hierarchical store. Paths are
//! normalised to their segments, so `"/todos/"`, `"todos"` and
//! `"https://example.com/todos"` all name the same node.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters a path segment may never contain.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// A normalised path into the remote store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath {
    segments: Vec<String>,
}

impl RemotePath {
    /// The root of the store.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a path or url.
    ///
    /// A scheme and host (`https://host`) are stripped. An empty path is
    /// accepted here and yields the root; callers that need a concrete
    /// location reject it (see [`crate::SyncConfig::path`]).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let path = match trimmed.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
            None => trimmed,
        };

        let mut segments = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            validate_segment(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// The path of a direct child.
    pub fn child(&self, key: &str) -> Result<Self> {
        validate_segment(key)?;
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Ok(Self { segments })
    }

    /// The parent path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// The last segment, `None` for the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &RemotePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True if either path contains the other.
    pub fn overlaps(&self, other: &RemotePath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidPath("empty segment".into()));
    }
    if segment.chars().any(|c| FORBIDDEN.contains(&c) || c.is_control()) {
        return Err(Error::InvalidPath(segment.to_string()));
    }
    Ok(())
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.to_string()
    }
}
