use crate::status::ServiceStatus;
use crate::ManagerError;
use cloudstrap_schema::{Constraints, UnitOptions};

/// Where a unit is placed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    /// Shares the default machine pool.
    #[default]
    Shared,
    /// Gets one dedicated machine, optionally constrained.
    Dedicated { constraints: Option<Constraints> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeployOptions {
    pub placement: Placement,
    /// Operator overrides for this unit, if any.
    pub config: Option<UnitOptions>,
}

/// Canonical relation endpoint, `<unit>:<interface>`.
pub fn endpoint(unit: &str, interface: &str) -> String {
    format!("{unit}:{interface}")
}

pub trait ClusterManager: Send + Sync {
    fn deploy(&self, unit: &str, options: &DeployOptions) -> Result<(), ManagerError>;

    fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> Result<(), ManagerError>;

    fn query_service(&self, unit: &str) -> Result<ServiceStatus, ManagerError>;
}
