use crate::unit::{Constraints, DisplayPriority, RelationSpec, ServiceUnitDescriptor};
use crate::SchemaError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTopology {
    #[serde(default, rename = "unit")]
    units: Vec<UnitDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitDecl {
    name: String,
    #[serde(default)]
    relations: Vec<String>,
    #[serde(default)]
    deploy_priority: Option<u32>,
    #[serde(default)]
    display_priority: DisplayPriority,
    #[serde(default)]
    isolate: bool,
    #[serde(default)]
    constraints: Option<Constraints>,
}

/// A validated set of service units, kept in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyFile {
    units: Vec<ServiceUnitDescriptor>,
}

impl TopologyFile {
    /// Build a topology from already-constructed descriptors, applying the
    /// same cross-unit validation as the file parser.
    pub fn from_units(units: Vec<ServiceUnitDescriptor>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.name()) {
                return Err(SchemaError::DuplicateUnit(unit.name().to_owned()));
            }
        }
        for unit in &units {
            for rel in unit.related() {
                if !seen.contains(rel.peer.as_str()) {
                    return Err(SchemaError::UnknownPeer {
                        unit: unit.name().to_owned(),
                        peer: rel.peer.clone(),
                    });
                }
            }
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> &[ServiceUnitDescriptor] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&ServiceUnitDescriptor> {
        self.units.iter().find(|u| u.name() == name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units ordered by deploy priority, ties broken by declaration order.
    pub fn deploy_order(&self) -> Vec<&ServiceUnitDescriptor> {
        let mut ordered: Vec<_> = self.units.iter().collect();
        // stable sort keeps declaration order on ties
        ordered.sort_by_key(|u| u.deploy_priority());
        ordered
    }

    /// Units ordered for presentation: display category, then name.
    pub fn display_order(&self) -> Vec<&ServiceUnitDescriptor> {
        let mut ordered: Vec<_> = self.units.iter().collect();
        ordered.sort_by(|a, b| {
            a.display_priority()
                .cmp(&b.display_priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        ordered
    }

    /// Keep only the named units and everything they relate to, transitively.
    pub fn select(&self, names: &[String]) -> Result<Self, SchemaError> {
        let mut wanted: Vec<String> = Vec::new();
        let mut stack: Vec<String> = names.to_vec();
        while let Some(name) = stack.pop() {
            if wanted.contains(&name) {
                continue;
            }
            let unit = self.get(&name).ok_or_else(|| SchemaError::UnknownPeer {
                unit: "<selection>".to_owned(),
                peer: name.clone(),
            })?;
            stack.extend(unit.related().iter().map(|r| r.peer.clone()));
            wanted.push(name);
        }
        let units = self
            .units
            .iter()
            .filter(|u| wanted.iter().any(|w| w == u.name()))
            .cloned()
            .collect();
        Ok(Self { units })
    }
}

fn build_unit(decl: UnitDecl) -> Result<ServiceUnitDescriptor, SchemaError> {
    let mut unit = ServiceUnitDescriptor::new(&decl.name)?
        .with_display_priority(decl.display_priority);
    if let Some(prio) = decl.deploy_priority {
        unit = unit.with_deploy_priority(prio);
    }
    for spec in &decl.relations {
        let rel: RelationSpec = spec.parse().map_err(|_| SchemaError::InvalidRelation {
            unit: decl.name.clone(),
            spec: spec.clone(),
        })?;
        unit = unit.relate(&rel.peer, &rel.interface)?;
    }
    if decl.isolate {
        unit = unit.isolated(decl.constraints);
    } else if decl.constraints.is_some_and(|c| !c.is_empty()) {
        return Err(SchemaError::ConstraintsWithoutIsolation(decl.name));
    }
    Ok(unit)
}

pub fn parse_topology_str(content: &str) -> Result<TopologyFile, SchemaError> {
    let raw: RawTopology = toml::from_str(content)?;
    let units = raw
        .units
        .into_iter()
        .map(build_unit)
        .collect::<Result<Vec<_>, _>>()?;
    TopologyFile::from_units(units)
}

pub fn parse_topology_file(path: &Path) -> Result<TopologyFile, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_topology_str(&content)
}
