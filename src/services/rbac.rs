//! Authorization of administrative actions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::constants::WILDCARD;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    NetworkAcls,
    Peers,
    MeshState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Put,
    Delete,
}

/// `verb` on the resource instance `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub resource: Resource,
    pub verb: Verb,
    pub name: String,
}

impl Action {
    pub fn new(
        resource: Resource,
        verb: Verb,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            verb,
            name: name.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            Resource::NetworkAcls => "network-acls",
            Resource::Peers => "peers",
            Resource::MeshState => "mesh-state",
        })
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network-acls" => Ok(Resource::NetworkAcls),
            "peers" => Ok(Resource::Peers),
            "mesh-state" => Ok(Resource::MeshState),
            other => Err(Error::InvalidArgument(format!("unknown rbac resource {:?}", other))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            Verb::Get => "get",
            Verb::Put => "put",
            Verb::Delete => "delete",
        })
    }
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(Verb::Get),
            "put" => Ok(Verb::Put),
            "delete" => Ok(Verb::Delete),
            other => Err(Error::InvalidArgument(format!("unknown rbac verb {:?}", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.verb, self.name)
    }
}

pub trait RbacEvaluator: Send + Sync + 'static {
    /// Whether identity checks are enforced at all
    fn is_secure(&self) -> bool;

    /// `caller` is `None` for anonymous requests
    fn evaluate(
        &self,
        caller: Option<&str>,
        action: &Action,
    ) -> bool;
}

/// Used when security is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl RbacEvaluator for AllowAll {
    fn is_secure(&self) -> bool {
        false
    }

    fn evaluate(
        &self,
        _caller: Option<&str>,
        _action: &Action,
    ) -> bool {
        true
    }
}

/// `None` matches anything
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    resource: Option<Resource>,
    verb: Option<Verb>,
    name: Option<String>,
}

impl Rule {
    fn parse(rule: &str) -> Result<Self> {
        if rule == WILDCARD {
            return Ok(Rule {
                resource: None,
                verb: None,
                name: None,
            });
        }
        let parts: Vec<&str> = rule.split(':').collect();
        let [resource, verb, name] = parts.as_slice() else {
            return Err(Error::InvalidArgument(format!(
                "rbac rule {:?} must be `*` or `resource:verb:name`",
                rule
            )));
        };
        Ok(Rule {
            resource: wildcard_or(resource)?,
            verb: wildcard_or(verb)?,
            name: (*name != WILDCARD).then(|| name.to_string()),
        })
    }

    fn matches(
        &self,
        action: &Action,
    ) -> bool {
        self.resource.map_or(true, |r| r == action.resource)
            && self.verb.map_or(true, |v| v == action.verb)
            && self.name.as_deref().map_or(true, |n| n == action.name)
    }
}

fn wildcard_or<T: FromStr<Err = Error>>(segment: &str) -> Result<Option<T>> {
    if segment == WILDCARD {
        Ok(None)
    } else {
        segment.parse().map(Some)
    }
}

/// Grants loaded from configuration: caller id (or `*` for every
/// authenticated caller) to the actions it may perform.
#[derive(Debug, Clone, Default)]
pub struct StaticRbac {
    grants: HashMap<String, Vec<Rule>>,
}

impl StaticRbac {
    pub fn from_config(grants: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut parsed = HashMap::with_capacity(grants.len());
        for (caller, rules) in grants {
            let rules = rules.iter().map(|r| Rule::parse(r)).collect::<Result<Vec<_>>>()?;
            parsed.insert(caller.clone(), rules);
        }
        Ok(Self { grants: parsed })
    }
}

impl RbacEvaluator for StaticRbac {
    fn is_secure(&self) -> bool {
        true
    }

    fn evaluate(
        &self,
        caller: Option<&str>,
        action: &Action,
    ) -> bool {
        let Some(caller) = caller else {
            debug!("anonymous caller denied {}", action);
            return false;
        };
        let allowed = [caller, WILDCARD]
            .iter()
            .filter_map(|c| self.grants.get(*c))
            .flatten()
            .any(|rule| rule.matches(action));
        if !allowed {
            debug!("{} denied {}", caller, action);
        }
        allowed
    }
}

#[cfg(test)]
#[path = "rbac_test.rs"]
mod rbac_test;
