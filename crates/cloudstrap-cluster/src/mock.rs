use crate::manager::{ClusterManager, DeployOptions};
use crate::status::{Relation, ServiceStatus};
use crate::ManagerError;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A request observed by [`MockManager`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerCall {
    Deploy {
        unit: String,
        options: DeployOptions,
        ok: bool,
    },
    AddRelation {
        endpoint_a: String,
        endpoint_b: String,
        ok: bool,
    },
    Query {
        unit: String,
    },
}

#[derive(Default)]
struct MockState {
    deployed: Vec<String>,
    // (unit_a, unit_b, interface)
    relations: Vec<(String, String, String)>,
    calls: Vec<ManagerCall>,
    deploy_failures: HashMap<String, u32>,
    relation_failures: HashMap<String, u32>,
    rejected_interfaces: HashSet<String>,
}

/// In-memory cluster manager.
///
/// Relations can only be added between deployed services; transient failures
/// can be injected per unit and interfaces can be marked as permanently
/// rejected.
#[derive(Default)]
pub struct MockManager {
    state: Mutex<MockState>,
}

fn split_endpoint(endpoint: &str) -> Result<(&str, &str), ManagerError> {
    match endpoint.split_once(':') {
        Some((unit, iface)) if !unit.is_empty() && !iface.is_empty() => Ok((unit, iface)),
        _ => Err(ManagerError::Rejected(format!(
            "invalid endpoint '{endpoint}'"
        ))),
    }
}

impl MockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` deploys of `unit` with a transient error.
    pub fn fail_deploy(&self, unit: &str, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.deploy_failures.insert(unit.to_owned(), times);
        }
    }

    /// Fail the next `times` relations requested from `unit` with a
    /// transient error, even when the peer is deployed.
    pub fn fail_relation(&self, unit: &str, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.relation_failures.insert(unit.to_owned(), times);
        }
    }

    pub fn reject_interface(&self, interface: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected_interfaces.insert(interface.to_owned());
        }
    }

    /// Mark a unit as deployed without recording a call.
    pub fn preload(&self, unit: &str) {
        if let Ok(mut state) = self.state.lock() {
            if !state.deployed.iter().any(|d| d == unit) {
                state.deployed.push(unit.to_owned());
            }
        }
    }

    pub fn calls(&self) -> Vec<ManagerCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn deployed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.deployed.clone())
            .unwrap_or_default()
    }

    /// Established relations as `(unit_a, unit_b, interface)`.
    pub fn relations(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .map(|s| s.relations.clone())
            .unwrap_or_default()
    }

    pub fn has_relation(&self, a: &str, b: &str) -> bool {
        self.relations()
            .iter()
            .any(|(x, y, _)| (x == a && y == b) || (x == b && y == a))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, ManagerError> {
        self.state
            .lock()
            .map_err(|e| ManagerError::NotReady(format!("mutex poisoned: {e}")))
    }
}

fn take_failure(failures: &mut HashMap<String, u32>, key: &str) -> bool {
    match failures.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl ClusterManager for MockManager {
    fn deploy(&self, unit: &str, options: &DeployOptions) -> Result<(), ManagerError> {
        let mut state = self.lock()?;
        let failed = take_failure(&mut state.deploy_failures, unit);
        state.calls.push(ManagerCall::Deploy {
            unit: unit.to_owned(),
            options: options.clone(),
            ok: !failed,
        });
        if failed {
            return Err(ManagerError::NotReady(format!(
                "environment busy, cannot deploy {unit}"
            )));
        }
        if !state.deployed.iter().any(|d| d == unit) {
            state.deployed.push(unit.to_owned());
        }
        Ok(())
    }

    fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> Result<(), ManagerError> {
        let mut state = self.lock()?;
        let result = (|| {
            let (unit_a, iface_a) = split_endpoint(endpoint_a)?;
            let (unit_b, iface_b) = split_endpoint(endpoint_b)?;
            if iface_a != iface_b || state.rejected_interfaces.contains(iface_a) {
                return Err(ManagerError::Rejected(format!(
                    "no relations found between {endpoint_a} and {endpoint_b}"
                )));
            }
            for unit in [unit_a, unit_b] {
                if !state.deployed.iter().any(|d| d == unit) {
                    return Err(ManagerError::NotReady(format!("service \"{unit}\" not found")));
                }
            }
            if take_failure(&mut state.relation_failures, unit_a) {
                return Err(ManagerError::NotReady(format!(
                    "{unit_a} hooks still running"
                )));
            }
            let exists = state.relations.iter().any(|(x, y, i)| {
                i == iface_a && ((x == unit_a && y == unit_b) || (x == unit_b && y == unit_a))
            });
            if !exists {
                state
                    .relations
                    .push((unit_a.to_owned(), unit_b.to_owned(), iface_a.to_owned()));
            }
            Ok(())
        })();
        state.calls.push(ManagerCall::AddRelation {
            endpoint_a: endpoint_a.to_owned(),
            endpoint_b: endpoint_b.to_owned(),
            ok: result.is_ok(),
        });
        result
    }

    fn query_service(&self, unit: &str) -> Result<ServiceStatus, ManagerError> {
        let mut state = self.lock()?;
        state.calls.push(ManagerCall::Query {
            unit: unit.to_owned(),
        });
        if !state.deployed.iter().any(|d| d == unit) {
            return Ok(ServiceStatus::absent(unit));
        }
        let mut relations: Vec<Relation> = Vec::new();
        for (a, b, iface) in &state.relations {
            let peer = if a == unit {
                b
            } else if b == unit {
                a
            } else {
                continue;
            };
            match relations.iter_mut().find(|r| &r.interface == iface) {
                Some(r) => r.peers.push(peer.clone()),
                None => relations.push(Relation {
                    interface: iface.clone(),
                    peers: vec![peer.clone()],
                }),
            }
        }
        Ok(ServiceStatus {
            name: unit.to_owned(),
            deployed: true,
            relations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_requires_both_deployed() {
        let mgr = MockManager::new();
        mgr.deploy("keystone", &DeployOptions::default()).unwrap();

        let err = mgr
            .add_relation("keystone:shared-db", "mysql:shared-db")
            .unwrap_err();
        assert!(err.is_transient());

        mgr.deploy("mysql", &DeployOptions::default()).unwrap();
        mgr.add_relation("keystone:shared-db", "mysql:shared-db")
            .unwrap();
        assert!(mgr.has_relation("mysql", "keystone"));

        let status = mgr.query_service("mysql").unwrap();
        assert!(status.is_related("keystone"));
    }

    #[test]
    fn injected_deploy_failures_are_transient() {
        let mgr = MockManager::new();
        mgr.fail_deploy("glance", 2);
        assert!(mgr.deploy("glance", &DeployOptions::default()).is_err());
        assert!(mgr.deploy("glance", &DeployOptions::default()).is_err());
        assert!(mgr.deploy("glance", &DeployOptions::default()).is_ok());
        assert_eq!(mgr.deployed(), vec!["glance".to_owned()]);
    }

    #[test]
    fn rejected_interface_is_permanent() {
        let mgr = MockManager::new();
        mgr.preload("a");
        mgr.preload("b");
        mgr.reject_interface("bogus");
        let err = mgr.add_relation("a:bogus", "b:bogus").unwrap_err();
        assert!(matches!(err, ManagerError::Rejected(_)));
        assert!(matches!(
            mgr.add_relation("a", "b:db"),
            Err(ManagerError::Rejected(_))
        ));
    }

    #[test]
    fn undeployed_query_is_absent() {
        let mgr = MockManager::new();
        assert!(!mgr.query_service("nova-compute").unwrap().deployed);
    }

    #[test]
    fn duplicate_relation_is_idempotent() {
        let mgr = MockManager::new();
        mgr.preload("a");
        mgr.preload("b");
        mgr.add_relation("a:db", "b:db").unwrap();
        mgr.add_relation("b:db", "a:db").unwrap();
        assert_eq!(mgr.relations().len(), 1);
    }
}
