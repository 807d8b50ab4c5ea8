//! Projection of a validated assertion into session attributes and roles.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::model::{Assertion, SamlAttribute};

/// One attribute an [`AttributeRule::Map`] reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeSource {
    pub name: String,
    /// Only match attributes declaring this NameFormat.
    #[serde(default)]
    pub name_format: Option<String>,
}

impl AttributeSource {
    fn matches(&self, attribute: &SamlAttribute) -> bool {
        attribute.name == self.name
            && self
                .name_format
                .as_deref()
                .is_none_or(|format| attribute.name_format.as_deref() == Some(format))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AttributeRule {
    /// Populate `target` from `sources`, listed in priority order.
    ///
    /// With `aggregate` every matching attribute contributes to a
    /// deduplicated union; without it only the highest-priority contribution
    /// is kept.
    Map {
        target: String,
        sources: Vec<AttributeSource>,
        #[serde(default)]
        aggregate: bool,
    },
    /// A literal value, present regardless of the assertion.
    Hardcode { target: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RoleRule {
    Rename { from: String, to: String },
    Hardcode { role: String },
}

fn default_role_attributes() -> Vec<String> {
    vec!["Role".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRules {
    #[serde(default)]
    pub attributes: Vec<AttributeRule>,
    /// Attributes whose values become roles.
    #[serde(default = "default_role_attributes")]
    pub role_attributes: Vec<String>,
    #[serde(default)]
    pub roles: Vec<RoleRule>,
}

impl Default for MappingRules {
    fn default() -> Self {
        Self {
            attributes: Vec::new(),
            role_attributes: default_role_attributes(),
            roles: Vec::new(),
        }
    }
}

/// How the session principal is named.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PrincipalNamePolicy {
    #[default]
    FromNameId,
    /// First value of the attribute (by Name, then FriendlyName), falling
    /// back to the NameID.
    FromAttribute { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    /// Values by attribute Name, in document order.
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Values by FriendlyName.
    pub friendly_attributes: BTreeMap<String, Vec<String>>,
    pub roles: BTreeSet<String>,
}

fn push_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

pub fn project(assertion: &Assertion, rules: &MappingRules) -> Projection {
    let mut projection = Projection::default();
    for attribute in &assertion.attributes {
        projection
            .attributes
            .entry(attribute.name.clone())
            .or_default()
            .extend(attribute.values.iter().cloned());
        if let Some(friendly) = &attribute.friendly_name {
            projection
                .friendly_attributes
                .entry(friendly.clone())
                .or_default()
                .extend(attribute.values.iter().cloned());
        }
    }

    // Targets written by a rule; later rules merge or yield instead of
    // replacing them.
    let mut ruled: HashSet<String> = HashSet::new();
    for rule in &rules.attributes {
        match rule {
            AttributeRule::Map {
                target,
                sources,
                aggregate,
            } => {
                let contributions: Vec<&[String]> = sources
                    .iter()
                    .flat_map(|source| {
                        assertion
                            .attributes
                            .iter()
                            .filter(move |a| source.matches(a))
                            .map(|a| a.values.as_slice())
                    })
                    .collect();
                if contributions.is_empty() {
                    continue;
                }

                let already_ruled = ruled.contains(target);
                if *aggregate {
                    let entry = projection.attributes.entry(target.clone()).or_default();
                    if !already_ruled {
                        entry.clear();
                    }
                    for values in &contributions {
                        push_unique(entry, values);
                    }
                } else if !already_ruled {
                    projection
                        .attributes
                        .insert(target.clone(), contributions[0].to_vec());
                }
                ruled.insert(target.clone());
            }
            AttributeRule::Hardcode { target, value } => {
                let entry = projection.attributes.entry(target.clone()).or_default();
                if !ruled.contains(target) {
                    entry.clear();
                }
                push_unique(entry, std::slice::from_ref(value));
                ruled.insert(target.clone());
            }
        }
    }

    for role_attribute in &rules.role_attributes {
        let by_name = projection.attributes.get(role_attribute);
        let by_friendly = projection.friendly_attributes.get(role_attribute);
        for values in by_name.into_iter().chain(by_friendly) {
            projection.roles.extend(values.iter().cloned());
        }
    }
    for rule in &rules.roles {
        match rule {
            RoleRule::Rename { from, to } => {
                if projection.roles.remove(from) {
                    projection.roles.insert(to.clone());
                }
            }
            RoleRule::Hardcode { role } => {
                projection.roles.insert(role.clone());
            }
        }
    }

    projection
}

/// Principal name for the session. A missing NameID yields an empty name.
pub fn resolve_principal(
    policy: &PrincipalNamePolicy,
    assertion: &Assertion,
    projection: &Projection,
) -> String {
    let name_id = || {
        assertion
            .name_id
            .as_ref()
            .map(|n| n.value.clone())
            .unwrap_or_default()
    };
    match policy {
        PrincipalNamePolicy::FromNameId => name_id(),
        PrincipalNamePolicy::FromAttribute { name } => projection
            .attributes
            .get(name)
            .or_else(|| projection.friendly_attributes.get(name))
            .and_then(|values| values.first().cloned())
            .unwrap_or_else(name_id),
    }
}
