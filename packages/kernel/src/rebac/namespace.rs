//! Data-driven ReBAC namespace configuration.
//!
//! One config per object type declares how each permission is computed from
//! relations. The evaluator in [`super::engine`] is a fixed algorithm
//! interpreting these structures; no dispatch is generated at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A userset rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Userset {
    /// Subjects with a direct (or group-inherited) tuple of this relation.
    Relation { relation: String },
    /// Any branch grants.
    Union { children: Vec<Userset> },
    /// Every branch must grant.
    Intersection { children: Vec<Userset> },
    /// The base grants and the exclusion does not.
    Exclusion {
        base: Box<Userset>,
        subtract: Box<Userset>,
    },
    /// Dereference `tupleset` on the object, then require `computed` on
    /// each referenced node (e.g. "whoever holds `read` on any `parent-of`
    /// of this file holds it here").
    TupleToUserset {
        tupleset: String,
        computed: String,
    },
}

impl Userset {
    #[must_use]
    pub fn relation(name: &str) -> Self {
        Self::Relation {
            relation: name.to_string(),
        }
    }

    #[must_use]
    pub fn union(children: Vec<Userset>) -> Self {
        Self::Union { children }
    }
}

/// Permission rules for one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub object_type: String,
    /// Permission name to rewrite rule. Permissions not listed fall back to
    /// a direct-relation check of the same name.
    pub permissions: HashMap<String, Userset>,
}

impl NamespaceConfig {
    #[must_use]
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            permissions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_permission(mut self, name: &str, rule: Userset) -> Self {
        self.permissions.insert(name.to_string(), rule);
        self
    }

    /// The rewrite rule for a permission.
    ///
    /// Unlisted permissions resolve to a direct check of the relation with
    /// the same name, so relation names themselves are always checkable
    /// (`check(alice, owner-of, file)` needs no config entry).
    #[must_use]
    pub fn rule_for(&self, permission: &str) -> Userset {
        self.permissions
            .get(permission)
            .cloned()
            .unwrap_or_else(|| Userset::relation(permission))
    }
}

/// The built-in namespace set: `file`, `dir`, `group`, and `zone`.
///
/// Files and directories grant `read` to viewers, editors, and owners and
/// inherit both `read` and `write` through `parent-of` edges; groups expose
/// membership; zones grant entry to members and owners.
#[must_use]
pub fn builtin_namespaces() -> Vec<NamespaceConfig> {
    let file_read = Userset::union(vec![
        Userset::relation("viewer-of"),
        Userset::relation("editor-of"),
        Userset::relation("owner-of"),
        Userset::TupleToUserset {
            tupleset: "parent-of".into(),
            computed: "read".into(),
        },
    ]);
    let file_write = Userset::union(vec![
        Userset::relation("editor-of"),
        Userset::relation("owner-of"),
        Userset::TupleToUserset {
            tupleset: "parent-of".into(),
            computed: "write".into(),
        },
    ]);
    let file_execute = Userset::relation("owner-of");

    let file = NamespaceConfig::new("file")
        .with_permission("read", file_read.clone())
        .with_permission("write", file_write.clone())
        .with_permission("execute", file_execute.clone());
    let dir = NamespaceConfig::new("dir")
        .with_permission("read", file_read)
        .with_permission("write", file_write)
        .with_permission("execute", file_execute);

    let group = NamespaceConfig::new("group")
        .with_permission("read", Userset::relation("member-of"))
        .with_permission(
            "write",
            Userset::union(vec![Userset::relation("owner-of")]),
        );

    let zone = NamespaceConfig::new("zone").with_permission(
        "read",
        Userset::union(vec![
            Userset::relation("member-of"),
            Userset::relation("owner-of"),
        ]),
    );

    vec![file, dir, group, zone]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_permission_falls_back_to_relation() {
        let config = NamespaceConfig::new("file");
        assert_eq!(config.rule_for("owner-of"), Userset::relation("owner-of"));
    }

    #[test]
    fn builtin_file_read_is_a_union() {
        let configs = builtin_namespaces();
        let file = configs.iter().find(|c| c.object_type == "file").unwrap();
        match file.rule_for("read") {
            Userset::Union { children } => assert_eq!(children.len(), 4),
            other => panic!("expected union, got {other:?}"),
        }
    }

    #[test]
    fn config_json_round_trip() {
        let config = NamespaceConfig::new("doc").with_permission(
            "share",
            Userset::Exclusion {
                base: Box::new(Userset::relation("editor-of")),
                subtract: Box::new(Userset::relation("suspended")),
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: NamespaceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
