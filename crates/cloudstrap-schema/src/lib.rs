//! Declarative data model for cloudstrap.
//!
//! This crate defines the schema layer: service unit descriptors
//! (`ServiceUnitDescriptor`) with their declared relations and placement,
//! TOML topology files (`TopologyFile`), per-operator unit overrides
//! (`UnitOverrides`), installer settings (`InstallSettings`) including the
//! queue retry policy, and the built-in private-cloud unit catalog.

pub mod catalog;
pub mod overrides;
pub mod settings;
pub mod topology;
pub mod unit;

pub use catalog::{builtin_topology, BUILTIN_TOPOLOGY};
pub use overrides::{UnitOptions, UnitOverrides};
pub use settings::{Backoff, InstallSettings, RetryPolicy};
pub use topology::{parse_topology_file, parse_topology_str, TopologyFile};
pub use unit::{Constraints, DisplayPriority, RelationSpec, ServiceUnitDescriptor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("invalid unit name '{0}': expected lowercase letters, digits and '-'")]
    InvalidUnitName(String),
    #[error("duplicate unit name '{0}' in topology")]
    DuplicateUnit(String),
    #[error("invalid relation '{spec}' on unit '{unit}': expected '<peer>:<interface>'")]
    InvalidRelation { unit: String, spec: String },
    #[error("unit '{unit}' relates to unknown unit '{peer}'")]
    UnknownPeer { unit: String, peer: String },
    #[error("unit '{0}' cannot relate to itself")]
    SelfRelation(String),
    #[error("unit '{0}' declares constraints but is not isolated")]
    ConstraintsWithoutIsolation(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}
