use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse presentation category. Ordering is for display only and carries no
/// deployment guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayPriority {
    #[default]
    Core,
    Compute,
    Storage,
    Other,
}

impl fmt::Display for DisplayPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayPriority::Core => write!(f, "core"),
            DisplayPriority::Compute => write!(f, "compute"),
            DisplayPriority::Storage => write!(f, "storage"),
            DisplayPriority::Other => write!(f, "other"),
        }
    }
}

/// A declared relation target: `<peer>:<interface>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationSpec {
    pub peer: String,
    pub interface: String,
}

impl RelationSpec {
    pub fn new(peer: &str, interface: &str) -> Self {
        Self {
            peer: peer.to_owned(),
            interface: interface.to_owned(),
        }
    }
}

impl fmt::Display for RelationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer, self.interface)
    }
}

impl FromStr for RelationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, interface) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in '{s}'"))?;
        let peer = peer.trim();
        let interface = interface.trim();
        if peer.is_empty() || interface.is_empty() || interface.contains(':') {
            return Err(format!("malformed relation '{s}'"));
        }
        Ok(Self::new(peer, interface))
    }
}

/// Resource constraints for a unit placed on a dedicated machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.mem.is_none() && self.cpu_cores.is_none() && self.root_disk.is_none()
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(mem) = &self.mem {
            parts.push(format!("mem={mem}"));
        }
        if let Some(cores) = self.cpu_cores {
            parts.push(format!("cpu-cores={cores}"));
        }
        if let Some(disk) = &self.root_disk {
            parts.push(format!("root-disk={disk}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Declarative description of one deployable service unit.
///
/// The name and relation list are fixed once the descriptor is built; only
/// the live relation set held by the cluster manager changes at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnitDescriptor {
    name: String,
    related: Vec<RelationSpec>,
    deploy_priority: u32,
    display_priority: DisplayPriority,
    isolate: bool,
    constraints: Option<Constraints>,
}

impl ServiceUnitDescriptor {
    pub fn new(name: &str) -> Result<Self, SchemaError> {
        validate_unit_name(name)?;
        Ok(Self {
            name: name.to_owned(),
            related: Vec::new(),
            deploy_priority: u32::MAX,
            display_priority: DisplayPriority::default(),
            isolate: false,
            constraints: None,
        })
    }

    /// Append a relation target. Duplicate peers are ignored so the list
    /// stays an ordered set.
    pub fn relate(mut self, peer: &str, interface: &str) -> Result<Self, SchemaError> {
        if peer == self.name {
            return Err(SchemaError::SelfRelation(self.name));
        }
        validate_unit_name(peer)?;
        if interface.is_empty() || interface.contains(':') {
            return Err(SchemaError::InvalidRelation {
                unit: self.name,
                spec: format!("{peer}:{interface}"),
            });
        }
        if !self.related.iter().any(|r| r.peer == peer) {
            self.related.push(RelationSpec::new(peer, interface));
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_deploy_priority(mut self, priority: u32) -> Self {
        self.deploy_priority = priority;
        self
    }

    #[must_use]
    pub fn with_display_priority(mut self, priority: DisplayPriority) -> Self {
        self.display_priority = priority;
        self
    }

    /// Request a dedicated machine, optionally constrained.
    #[must_use]
    pub fn isolated(mut self, constraints: Option<Constraints>) -> Self {
        self.isolate = true;
        self.constraints = constraints.filter(|c| !c.is_empty());
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn related(&self) -> &[RelationSpec] {
        &self.related
    }

    #[inline]
    pub fn deploy_priority(&self) -> u32 {
        self.deploy_priority
    }

    #[inline]
    pub fn display_priority(&self) -> DisplayPriority {
        self.display_priority
    }

    #[inline]
    pub fn isolate(&self) -> bool {
        self.isolate
    }

    /// Constraints only apply to isolated units.
    pub fn constraints(&self) -> Option<&Constraints> {
        if self.isolate {
            self.constraints.as_ref()
        } else {
            None
        }
    }

    pub fn relates_to(&self, peer: &str) -> bool {
        self.related.iter().any(|r| r.peer == peer)
    }
}

impl fmt::Display for ServiceUnitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub(crate) fn validate_unit_name(name: &str) -> Result<(), SchemaError> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidUnitName(name.to_owned()))
    }
}
