//! Access policy model
//!
//! [`Policy`] and [`Binding`] are the wire shapes of `getIamPolicy` /
//! `setIamPolicy`. [`AccessPolicyView`] is the mergeable view the writers
//! operate on: unconditional bindings as a role to member-set map, plus the
//! etag read with it. Conditional bindings and audit configs ride along
//! untouched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Policy version requested on reads and sent on writes.
pub const IAM_POLICY_VERSION: i32 = 3;

/// Role to members map used by every writer.
pub type RoleBindings = BTreeMap<String, BTreeSet<String>>;

// =========================================================================
// Wire types
// =========================================================================

#[derive(Clone, PartialEq, Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub version: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_configs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub expression: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

// =========================================================================
// Member normalization
// =========================================================================

const CASE_SENSITIVE_PREFIXES: &[&str] = &["principal:", "principalSet:", "principalHierarchy:"];

fn is_case_sensitive(member: &str) -> bool {
    member.contains("allUsers")
        || member.contains("allAuthenticatedUsers")
        || CASE_SENSITIVE_PREFIXES.iter().any(|p| member.starts_with(p))
}

/// Canonical form of a member identifier.
///
/// The type prefix is kept; the value after it is lower-cased. Principal
/// identifiers and `allUsers` / `allAuthenticatedUsers` are case sensitive
/// and returned as given. A `deleted:` marker is set aside first, so
/// `deleted:<type>:<value>` follows the rule for `<type>:<value>`.
pub fn normalize_member(member: &str) -> String {
    let member = member.trim();
    let (deleted, rest) = match member.strip_prefix("deleted:") {
        Some(rest) => ("deleted:", rest),
        None => ("", member),
    };
    if is_case_sensitive(rest) {
        return member.to_string();
    }
    match rest.split_once(':') {
        Some((kind, value)) => format!("{deleted}{kind}:{}", value.to_lowercase()),
        None if !deleted.is_empty() => format!("{deleted}{}", rest.to_lowercase()),
        None => member.to_string(),
    }
}

fn normalize_members<'a>(members: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    members
        .into_iter()
        .map(|m| normalize_member(m))
        .filter(|m| !m.is_empty())
        .collect()
}

// =========================================================================
// Policy view
// =========================================================================

/// The mergeable form of a policy.
#[derive(Clone, PartialEq, Default, Debug)]
pub struct AccessPolicyView {
    pub bindings: RoleBindings,
    pub etag: Option<String>,
    pub version: i32,
    conditional: Vec<Binding>,
    audit_configs: Vec<Value>,
}

impl AccessPolicyView {
    pub fn new(bindings: RoleBindings, etag: Option<String>) -> Self {
        Self {
            bindings,
            etag,
            version: IAM_POLICY_VERSION,
            ..Default::default()
        }
    }

    /// Fold a wire policy into a view. Duplicate unconditional bindings for
    /// one role are merged.
    pub fn from_policy(policy: Policy) -> Self {
        let mut bindings = RoleBindings::new();
        let mut conditional = Vec::new();
        for binding in policy.bindings {
            if binding.condition.is_some() {
                conditional.push(binding);
                continue;
            }
            let members = normalize_members(&binding.members);
            if members.is_empty() {
                continue;
            }
            bindings.entry(binding.role).or_default().extend(members);
        }
        Self {
            bindings,
            etag: policy.etag,
            version: policy.version,
            conditional,
            audit_configs: policy.audit_configs,
        }
    }

    /// Wire policy for a write, carrying the etag this view was read with.
    pub fn to_policy(&self) -> Policy {
        let mut bindings: Vec<Binding> = self
            .bindings
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(role, members)| Binding {
                role: role.clone(),
                members: members.iter().cloned().collect(),
                condition: None,
            })
            .collect();
        bindings.extend(self.conditional.iter().cloned());
        Policy {
            version: IAM_POLICY_VERSION,
            bindings,
            audit_configs: self.audit_configs.clone(),
            etag: self.etag.clone(),
        }
    }

    pub fn members(&self, role: &str) -> Option<&BTreeSet<String>> {
        self.bindings.get(role)
    }

    pub fn conditional_bindings(&self) -> &[Binding] {
        &self.conditional
    }

    /// Whether the unconditional bindings of both views are equal.
    pub fn same_bindings(&self, other: &AccessPolicyView) -> bool {
        self.bindings == other.bindings
    }
}

// =========================================================================
// Writers
// =========================================================================

/// The slice of a policy a change is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScope<'a> {
    /// Every unconditional binding.
    Policy,
    Role(&'a str),
    Member { role: &'a str, member: &'a str },
}

/// One writer's intended change.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyChange {
    /// Authoritative: the unconditional bindings become exactly this map.
    Replace(RoleBindings),
    /// The members of one role become exactly this set.
    SetRole { role: String, members: BTreeSet<String> },
    ClearRole { role: String },
    AddMember { role: String, member: String },
    RemoveMember { role: String, member: String },
}

impl PolicyChange {
    pub fn scope(&self) -> ChangeScope<'_> {
        match self {
            PolicyChange::Replace(_) => ChangeScope::Policy,
            PolicyChange::SetRole { role, .. } | PolicyChange::ClearRole { role } => ChangeScope::Role(role),
            PolicyChange::AddMember { role, member } | PolicyChange::RemoveMember { role, member } => {
                ChangeScope::Member { role, member }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PolicyChange::Replace(bindings) => {
                for (role, members) in bindings {
                    validate_role(role)?;
                    members.iter().try_for_each(|m| validate_member(m))?;
                }
                Ok(())
            }
            PolicyChange::SetRole { role, members } => {
                validate_role(role)?;
                members.iter().try_for_each(|m| validate_member(m))
            }
            PolicyChange::ClearRole { role } => validate_role(role),
            PolicyChange::AddMember { role, member } | PolicyChange::RemoveMember { role, member } => {
                validate_role(role)?;
                validate_member(member)
            }
        }
    }

    /// Apply this change to `view`, touching only its own scope.
    pub fn apply_to(&self, view: &mut AccessPolicyView) {
        match self {
            PolicyChange::Replace(bindings) => {
                view.bindings = bindings
                    .iter()
                    .map(|(role, members)| (role.clone(), normalize_members(members)))
                    .filter(|(_, members)| !members.is_empty())
                    .collect();
            }
            PolicyChange::SetRole { role, members } => {
                let members = normalize_members(members);
                if members.is_empty() {
                    view.bindings.remove(role);
                } else {
                    view.bindings.insert(role.clone(), members);
                }
            }
            PolicyChange::ClearRole { role } => {
                view.bindings.remove(role);
            }
            PolicyChange::AddMember { role, member } => {
                view.bindings
                    .entry(role.clone())
                    .or_default()
                    .insert(normalize_member(member));
            }
            PolicyChange::RemoveMember { role, member } => {
                if let Some(members) = view.bindings.get_mut(role) {
                    members.remove(&normalize_member(member));
                    if members.is_empty() {
                        view.bindings.remove(role);
                    }
                }
            }
        }
    }
}

fn validate_role(role: &str) -> Result<()> {
    if role.trim().is_empty() {
        return Err(Error::validation("role", "expected a non-empty string"));
    }
    if role.chars().any(char::is_whitespace) {
        return Err(Error::validation("role", format!("{role:?} must not contain whitespace")));
    }
    Ok(())
}

fn validate_member(member: &str) -> Result<()> {
    let member = member.trim();
    if member.is_empty() {
        return Err(Error::validation("member", "expected a non-empty string"));
    }
    if member == "allUsers" || member == "allAuthenticatedUsers" {
        return Ok(());
    }
    match member.split_once(':') {
        Some((kind, value)) if !kind.is_empty() && !value.is_empty() => Ok(()),
        _ => Err(Error::validation(
            "member",
            format!("{member:?} must be of the form <type>:<id>"),
        )),
    }
}
