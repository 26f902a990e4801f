//! Virtual path validation and manipulation.
//!
//! A virtual path is the namespace-qualified logical location of an entry
//! (`/workspace/alice/doc.txt`), distinct from any object-store key. Paths
//! are validated once at the kernel boundary and carried as [`VirtualPath`]
//! afterwards, so interior code never re-checks syntax.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Maximum byte length of a virtual path.
const MAX_PATH_BYTES: usize = 4096;

/// Maximum number of segments in a virtual path.
const MAX_PATH_DEPTH: usize = 64;

/// A validated, normalized virtual path.
///
/// Invariants held by construction: starts with `/`, no empty / `.` / `..`
/// segments, no control characters, no trailing slash (except the root `/`),
/// at most [`MAX_PATH_DEPTH`] segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// Parses and normalizes `raw` into a `VirtualPath`.
    ///
    /// Repeated slashes collapse; anything else that deviates from the
    /// invariants is rejected with `InvalidArgument`.
    pub fn parse(raw: &str) -> KernelResult<Self> {
        if raw.is_empty() {
            return Err(KernelError::invalid_argument("empty path"));
        }
        if !raw.starts_with('/') {
            return Err(KernelError::invalid_argument(format!(
                "path must be absolute: {raw}"
            )));
        }
        if raw.len() > MAX_PATH_BYTES {
            return Err(KernelError::invalid_argument("path too long"));
        }
        if raw.chars().any(char::is_control) {
            return Err(KernelError::invalid_argument(
                "path contains control characters",
            ));
        }

        let mut segments: Vec<&str> = Vec::new();
        for seg in raw.split('/') {
            match seg {
                "" => {} // leading slash or repeated slash
                "." | ".." => {
                    return Err(KernelError::invalid_argument(format!(
                        "relative segment in path: {raw}"
                    )));
                }
                s => segments.push(s),
            }
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(KernelError::invalid_argument("path too deep"));
        }

        if segments.is_empty() {
            return Ok(Self("/".to_string()));
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    /// The path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the namespace root `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// First segment of the path (the namespace root name), if any.
    #[must_use]
    pub fn root_segment(&self) -> Option<&str> {
        self.0[1..].split('/').next().filter(|s| !s.is_empty())
    }

    /// Parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self("/".to_string())),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final segment of the path, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Appends a single validated segment.
    pub fn join(&self, segment: &str) -> KernelResult<Self> {
        if segment.is_empty() || segment.contains('/') {
            return Err(KernelError::invalid_argument(format!(
                "invalid path segment: {segment}"
            )));
        }
        let joined = if self.is_root() {
            format!("/{segment}")
        } else {
            format!("{}/{segment}", self.0)
        };
        Self::parse(&joined)
    }

    /// Whether `self` is inside the directory `dir` (strictly below it).
    #[must_use]
    pub fn is_inside(&self, dir: &Self) -> bool {
        if dir.is_root() {
            return !self.is_root();
        }
        self.0.len() > dir.0.len()
            && self.0.starts_with(&dir.0)
            && self.0.as_bytes()[dir.0.len()] == b'/'
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0[1..].split('/').count()
        }
    }

    /// Rewrites the `from` directory prefix to `to`, used by move.
    ///
    /// Returns `None` when `self` is neither `from` nor inside it.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if self == from {
            return Some(to.clone());
        }
        if self.is_inside(from) {
            let rest = &self.0[from.0.len()..];
            return Some(Self(format!("{}{rest}", to.0)));
        }
        None
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for VirtualPath {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_normalizes_repeated_slashes() {
        let p = VirtualPath::parse("//workspace///a.txt").unwrap();
        assert_eq!(p.as_str(), "/workspace/a.txt");
    }

    #[test]
    fn parse_rejects_relative_and_dotted() {
        assert!(VirtualPath::parse("workspace/a").is_err());
        assert!(VirtualPath::parse("/workspace/../etc").is_err());
        assert!(VirtualPath::parse("/workspace/./a").is_err());
        assert!(VirtualPath::parse("").is_err());
        assert!(VirtualPath::parse("/a\0b").is_err());
    }

    #[test]
    fn root_parses() {
        let p = VirtualPath::parse("/").unwrap();
        assert!(p.is_root());
        assert_eq!(p.root_segment(), None);
        assert_eq!(p.parent(), None);
        assert_eq!(p.file_name(), None);
        assert_eq!(p.depth(), 0);
    }

    #[test]
    fn parent_and_file_name() {
        let p = VirtualPath::parse("/workspace/alice/doc.txt").unwrap();
        assert_eq!(p.root_segment(), Some("workspace"));
        assert_eq!(p.file_name(), Some("doc.txt"));
        assert_eq!(p.parent().unwrap().as_str(), "/workspace/alice");
        assert_eq!(
            p.parent().unwrap().parent().unwrap().as_str(),
            "/workspace"
        );
        assert_eq!(
            p.parent().unwrap().parent().unwrap().parent().unwrap().as_str(),
            "/"
        );
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn join_validates_segment() {
        let base = VirtualPath::parse("/workspace").unwrap();
        assert_eq!(base.join("a.txt").unwrap().as_str(), "/workspace/a.txt");
        assert!(base.join("a/b").is_err());
        assert!(base.join("").is_err());
        assert!(base.join("..").is_err());
    }

    #[test]
    fn is_inside_is_strict() {
        let dir = VirtualPath::parse("/workspace/proj").unwrap();
        let file = VirtualPath::parse("/workspace/proj/x").unwrap();
        let sibling = VirtualPath::parse("/workspace/project").unwrap();
        assert!(file.is_inside(&dir));
        assert!(!dir.is_inside(&dir));
        assert!(!sibling.is_inside(&dir), "prefix match must be per-segment");
    }

    #[test]
    fn rebase_rewrites_prefix() {
        let from = VirtualPath::parse("/workspace/a").unwrap();
        let to = VirtualPath::parse("/workspace/b").unwrap();
        let p = VirtualPath::parse("/workspace/a/sub/f.txt").unwrap();
        assert_eq!(
            p.rebase(&from, &to).unwrap().as_str(),
            "/workspace/b/sub/f.txt"
        );
        assert_eq!(from.rebase(&from, &to).unwrap(), to);
        let outside = VirtualPath::parse("/shared/x").unwrap();
        assert!(outside.rebase(&from, &to).is_none());
    }

    proptest! {
        /// Parsing is idempotent: re-parsing a normalized path is a no-op.
        #[test]
        fn parse_is_idempotent(segs in proptest::collection::vec("[a-zA-Z0-9][a-zA-Z0-9._-]{0,11}", 1..8)) {
            let raw = format!("/{}", segs.join("/"));
            let once = VirtualPath::parse(&raw).unwrap();
            let twice = VirtualPath::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
