use crate::progress::ProgressDisplay;
use crate::CoreError;
use cloudstrap_cluster::{endpoint, ClusterManager, DeployOptions, Placement};
use cloudstrap_schema::{ServiceUnitDescriptor, TopologyFile, UnitOptions, UnitOverrides};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Collaborators shared by every unit operation.
#[derive(Clone)]
pub struct UnitContext {
    pub manager: Arc<dyn ClusterManager>,
    pub overrides: Arc<UnitOverrides>,
    pub progress: Arc<dyn ProgressDisplay>,
}

/// Result of one `setup` or `set_relations` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Not possible yet; requeue.
    Retry(String),
    /// Will never succeed; do not requeue.
    Failed(String),
}

impl Outcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::Retry(_))
    }
}

/// Capability set of a deployable unit.
///
/// The default methods implement the descriptor-driven behaviour; units with
/// extra needs override `post_process` (or the others) and are registered
/// under their name in a [`UnitRegistry`].
pub trait ServiceUnit: Send + Sync {
    fn descriptor(&self) -> &ServiceUnitDescriptor;

    fn name(&self) -> &str {
        self.descriptor().name()
    }

    fn setup(&self, ctx: &UnitContext) -> Outcome {
        deploy_unit(self.descriptor(), ctx)
    }

    fn set_relations(&self, ctx: &UnitContext) -> Outcome {
        wire_relations(self.descriptor(), ctx)
    }

    /// One-shot finalization once every relation is established.
    fn post_process(&self, _ctx: &UnitContext) -> Result<(), CoreError> {
        Ok(())
    }
}

pub fn deploy_options(unit: &ServiceUnitDescriptor, overrides: &UnitOverrides) -> DeployOptions {
    let placement = if unit.isolate() {
        Placement::Dedicated {
            constraints: unit.constraints().cloned(),
        }
    } else {
        Placement::Shared
    };
    DeployOptions {
        placement,
        config: overrides.get(unit.name()).cloned(),
    }
}

/// Deploy a unit unless the manager already has it.
pub fn deploy_unit(unit: &ServiceUnitDescriptor, ctx: &UnitContext) -> Outcome {
    let name = unit.name();
    match ctx.manager.query_service(name) {
        Ok(status) if status.deployed => {
            debug!("{name} already deployed, skipping");
            return Outcome::Done;
        }
        Ok(_) => {}
        Err(e) if e.is_transient() => return Outcome::Retry(e.to_string()),
        Err(e) => return Outcome::Failed(e.to_string()),
    }

    let options = deploy_options(unit, &ctx.overrides);
    match ctx.manager.deploy(name, &options) {
        Ok(()) => {
            info!("deployed {name}");
            Outcome::Done
        }
        Err(e) if e.is_transient() => {
            debug!("deploy of {name} not ready: {e}");
            Outcome::Retry(e.to_string())
        }
        Err(e) => {
            error!("deploy of {name} rejected: {e}");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Establish a unit's declared relations, strictly in declaration order.
///
/// Stops at the first relation that cannot be added yet. Relations already
/// present in the live topology are skipped, so re-running on a fully wired
/// unit issues no mutations.
pub fn wire_relations(unit: &ServiceUnitDescriptor, ctx: &UnitContext) -> Outcome {
    let name = unit.name();
    for rel in unit.related() {
        let status = match ctx.manager.query_service(name) {
            Ok(status) => status,
            Err(e) if e.is_transient() => return Outcome::Retry(e.to_string()),
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        if status.is_related(&rel.peer) {
            continue;
        }

        let this = endpoint(name, &rel.interface);
        let other = endpoint(&rel.peer, &rel.interface);
        debug!("add_relation({this}, {other})");
        match ctx.manager.add_relation(&this, &other) {
            Ok(()) => info!("related {this} <-> {other}"),
            Err(e) if e.is_transient() => {
                let msg = format!("Relation {this}<->{other} not ready, requeueing.");
                debug!("{msg} ({e})");
                ctx.progress.status_info_message(&msg);
                return Outcome::Retry(e.to_string());
            }
            Err(e) => {
                error!("relation {this} <-> {other} rejected: {e}");
                return Outcome::Failed(e.to_string());
            }
        }
    }
    Outcome::Done
}

pub type PostProcessHook =
    Box<dyn Fn(&ServiceUnitDescriptor, &UnitContext) -> Result<(), CoreError> + Send + Sync>;

/// Directory under the config dir holding one wiring record per service.
pub const WIRING_RECORD_DIR: &str = "services";

#[derive(Serialize)]
struct WiringRecord<'a> {
    service: &'a str,
    relations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a UnitOptions>,
}

fn write_wiring_record(
    dir: &Path,
    unit: &ServiceUnitDescriptor,
    ctx: &UnitContext,
) -> Result<PathBuf, CoreError> {
    let record = WiringRecord {
        service: unit.name(),
        relations: unit
            .related()
            .iter()
            .map(|rel| endpoint(&rel.peer, &rel.interface))
            .collect(),
        options: ctx.overrides.get(unit.name()),
    };
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.yaml", unit.name()));
    fs::write(&path, serde_yaml::to_string(&record)?)?;
    Ok(path)
}

/// Writes `<dir>/<unit>.yaml` with the unit's relations and effective options
/// once the unit is fully related.
pub fn wiring_record_hook(dir: PathBuf) -> PostProcessHook {
    Box::new(move |unit: &ServiceUnitDescriptor, ctx: &UnitContext| {
        match write_wiring_record(&dir, unit, ctx) {
            Ok(path) => {
                debug!("wrote wiring record {}", path.display());
                Ok(())
            }
            Err(e) => Err(CoreError::PostProcess {
                unit: unit.name().to_owned(),
                reason: e.to_string(),
            }),
        }
    })
}

/// Descriptor-driven unit with an optional post-process hook.
pub struct Unit {
    descriptor: ServiceUnitDescriptor,
    post_process: Option<PostProcessHook>,
}

impl Unit {
    pub fn new(descriptor: ServiceUnitDescriptor) -> Self {
        Self {
            descriptor,
            post_process: None,
        }
    }

    #[must_use]
    pub fn with_post_process(mut self, hook: PostProcessHook) -> Self {
        self.post_process = Some(hook);
        self
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("descriptor", &self.descriptor)
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

impl ServiceUnit for Unit {
    fn descriptor(&self) -> &ServiceUnitDescriptor {
        &self.descriptor
    }

    fn post_process(&self, ctx: &UnitContext) -> Result<(), CoreError> {
        match &self.post_process {
            Some(hook) => hook(&self.descriptor, ctx),
            None => Ok(()),
        }
    }
}

/// Unit implementations keyed by their stable name.
#[derive(Default)]
pub struct UnitRegistry {
    units: BTreeMap<String, Arc<dyn ServiceUnit>>,
    // deploy order: priority, then registration order
    order: Vec<String>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One descriptor-driven unit per topology entry.
    pub fn from_topology(topology: &TopologyFile) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for descriptor in topology.units() {
            registry.register(Arc::new(Unit::new(descriptor.clone())))?;
        }
        Ok(registry)
    }

    /// Like [`UnitRegistry::from_topology`], with every unit writing its
    /// wiring record into `records_dir` after its relations are established.
    pub fn from_topology_with_records(
        topology: &TopologyFile,
        records_dir: &Path,
    ) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for descriptor in topology.units() {
            let unit = Unit::new(descriptor.clone())
                .with_post_process(wiring_record_hook(records_dir.to_path_buf()));
            registry.register(Arc::new(unit))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, unit: Arc<dyn ServiceUnit>) -> Result<(), CoreError> {
        let name = unit.name().to_owned();
        if self.units.contains_key(&name) {
            return Err(CoreError::DuplicateUnit(name));
        }
        self.units.insert(name.clone(), unit);
        self.order.push(name);
        Ok(())
    }

    /// Swap the implementation registered under `unit.name()`.
    pub fn replace(&mut self, unit: Arc<dyn ServiceUnit>) -> Result<(), CoreError> {
        let name = unit.name().to_owned();
        match self.units.get_mut(&name) {
            Some(slot) => {
                *slot = unit;
                Ok(())
            }
            None => Err(CoreError::UnknownUnit(name)),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ServiceUnit>, CoreError> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownUnit(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Units sorted by deploy priority, ties kept in registration order.
    pub fn deploy_order(&self) -> Vec<Arc<dyn ServiceUnit>> {
        let mut units: Vec<_> = self
            .order
            .iter()
            .filter_map(|n| self.units.get(n).cloned())
            .collect();
        units.sort_by_key(|u| u.descriptor().deploy_priority());
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressEvent, RecordingProgress};
    use cloudstrap_cluster::{ManagerCall, MockManager};
    use cloudstrap_schema::Constraints;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_with(manager: Arc<MockManager>, progress: Arc<RecordingProgress>) -> UnitContext {
        UnitContext {
            manager,
            overrides: Arc::new(UnitOverrides::new()),
            progress,
        }
    }

    fn add_relation_calls(mgr: &MockManager) -> Vec<(String, String, bool)> {
        mgr.calls()
            .into_iter()
            .filter_map(|c| match c {
                ManagerCall::AddRelation {
                    endpoint_a,
                    endpoint_b,
                    ok,
                } => Some((endpoint_a, endpoint_b, ok)),
                _ => None,
            })
            .collect()
    }

    fn neutron() -> ServiceUnitDescriptor {
        ServiceUnitDescriptor::new("neutron-api")
            .unwrap()
            .relate("rabbitmq-server", "amqp")
            .unwrap()
            .relate("mysql", "shared-db")
            .unwrap()
            .relate("keystone", "identity-service")
            .unwrap()
    }

    #[test]
    fn relations_stop_at_first_unready_peer() {
        let mgr = Arc::new(MockManager::new());
        let progress = Arc::new(RecordingProgress::new());
        mgr.preload("neutron-api");
        mgr.preload("rabbitmq-server");
        // mysql missing, keystone deployed: keystone must not be attempted yet
        mgr.preload("keystone");
        let ctx = ctx_with(mgr.clone(), progress.clone());

        let outcome = wire_relations(&neutron(), &ctx);
        assert!(outcome.is_retry());

        let adds = add_relation_calls(&mgr);
        assert_eq!(
            adds,
            vec![
                (
                    "neutron-api:amqp".to_owned(),
                    "rabbitmq-server:amqp".to_owned(),
                    true
                ),
                (
                    "neutron-api:shared-db".to_owned(),
                    "mysql:shared-db".to_owned(),
                    false
                ),
            ]
        );
        assert!(progress
            .events()
            .iter()
            .any(|e| matches!(e, ProgressEvent::Status(m) if m.contains("requeueing"))));
    }

    #[test]
    fn retry_rescans_and_skips_established() {
        let mgr = Arc::new(MockManager::new());
        for u in ["neutron-api", "rabbitmq-server", "keystone"] {
            mgr.preload(u);
        }
        let ctx = ctx_with(mgr.clone(), Arc::new(RecordingProgress::new()));
        assert!(wire_relations(&neutron(), &ctx).is_retry());

        mgr.preload("mysql");
        assert_eq!(wire_relations(&neutron(), &ctx), Outcome::Done);

        let adds = add_relation_calls(&mgr);
        // amqp once, shared-db twice (fail then ok), identity once
        assert_eq!(adds.len(), 4);
        assert_eq!(
            adds.iter()
                .filter(|(a, _, _)| a == "neutron-api:amqp")
                .count(),
            1
        );
        assert!(mgr.has_relation("neutron-api", "keystone"));
    }

    #[test]
    fn wiring_is_idempotent() {
        let mgr = Arc::new(MockManager::new());
        for u in ["neutron-api", "rabbitmq-server", "mysql", "keystone"] {
            mgr.preload(u);
        }
        let ctx = ctx_with(mgr.clone(), Arc::new(RecordingProgress::new()));
        assert_eq!(wire_relations(&neutron(), &ctx), Outcome::Done);
        let before = add_relation_calls(&mgr).len();

        assert_eq!(wire_relations(&neutron(), &ctx), Outcome::Done);
        assert_eq!(wire_relations(&neutron(), &ctx), Outcome::Done);
        assert_eq!(add_relation_calls(&mgr).len(), before);
    }

    #[test]
    fn rejected_relation_fails_without_retry() {
        let mgr = Arc::new(MockManager::new());
        for u in ["neutron-api", "rabbitmq-server"] {
            mgr.preload(u);
        }
        mgr.reject_interface("amqp");
        let ctx = ctx_with(mgr, Arc::new(RecordingProgress::new()));
        assert!(matches!(wire_relations(&neutron(), &ctx), Outcome::Failed(_)));
    }

    #[test]
    fn no_relations_is_done() {
        let mgr = Arc::new(MockManager::new());
        let ctx = ctx_with(mgr.clone(), Arc::new(RecordingProgress::new()));
        let unit = ServiceUnitDescriptor::new("mysql").unwrap();
        assert_eq!(wire_relations(&unit, &ctx), Outcome::Done);
        assert!(mgr.calls().is_empty());
    }

    #[test]
    fn deploy_uses_overrides_and_isolation() {
        let mgr = Arc::new(MockManager::new());
        let mut overrides = UnitOverrides::new();
        overrides.set("nova-compute", "virt-type", "lxc");
        let ctx = UnitContext {
            manager: mgr.clone(),
            overrides: Arc::new(overrides),
            progress: Arc::new(RecordingProgress::new()),
        };
        let unit = ServiceUnitDescriptor::new("nova-compute")
            .unwrap()
            .isolated(Some(Constraints {
                mem: Some("4G".to_owned()),
                ..Constraints::default()
            }));

        assert_eq!(deploy_unit(&unit, &ctx), Outcome::Done);
        let deploy = mgr
            .calls()
            .into_iter()
            .find_map(|c| match c {
                ManagerCall::Deploy { options, .. } => Some(options),
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            deploy.placement,
            Placement::Dedicated {
                constraints: Some(_)
            }
        ));
        assert!(deploy.config.unwrap().contains_key("virt-type"));
    }

    #[test]
    fn deploy_skips_already_deployed_and_retries_busy() {
        let mgr = Arc::new(MockManager::new());
        let ctx = ctx_with(mgr.clone(), Arc::new(RecordingProgress::new()));
        let unit = ServiceUnitDescriptor::new("glance").unwrap();

        mgr.fail_deploy("glance", 1);
        assert!(deploy_unit(&unit, &ctx).is_retry());
        assert_eq!(deploy_unit(&unit, &ctx), Outcome::Done);
        assert_eq!(deploy_unit(&unit, &ctx), Outcome::Done);

        let deploys = mgr
            .calls()
            .iter()
            .filter(|c| matches!(c, ManagerCall::Deploy { .. }))
            .count();
        assert_eq!(deploys, 2);
    }

    #[test]
    fn registry_lookup_and_hooks() {
        let topo = cloudstrap_schema::builtin_topology().unwrap();
        let mut registry = UnitRegistry::from_topology(&topo).unwrap();
        assert_eq!(registry.len(), topo.len());
        assert!(matches!(
            registry.get("swift"),
            Err(CoreError::UnknownUnit(_))
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hooked = Unit::new(topo.get("keystone").unwrap().clone()).with_post_process(Box::new(
            move |_: &ServiceUnitDescriptor, _: &UnitContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));
        registry.replace(Arc::new(hooked)).unwrap();

        let ctx = ctx_with(Arc::new(MockManager::new()), Arc::new(RecordingProgress::new()));
        registry.get("keystone").unwrap().post_process(&ctx).unwrap();
        registry.get("mysql").unwrap().post_process(&ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let dup = Arc::new(Unit::new(topo.get("mysql").unwrap().clone()));
        assert!(matches!(
            registry.register(dup),
            Err(CoreError::DuplicateUnit(_))
        ));
    }

    #[test]
    fn wiring_record_written_after_post_process() {
        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join(WIRING_RECORD_DIR);
        let topo = cloudstrap_schema::builtin_topology().unwrap();
        let registry = UnitRegistry::from_topology_with_records(&topo, &records).unwrap();
        let mut overrides = UnitOverrides::new();
        overrides.set("keystone", "admin-password", "pw");
        let ctx = UnitContext {
            manager: Arc::new(MockManager::new()),
            overrides: Arc::new(overrides),
            progress: Arc::new(RecordingProgress::new()),
        };

        registry.get("keystone").unwrap().post_process(&ctx).unwrap();

        let content = std::fs::read_to_string(records.join("keystone.yaml")).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();
        assert_eq!(doc["service"].as_str(), Some("keystone"));
        assert_eq!(doc["options"]["admin-password"].as_str(), Some("pw"));
        let relations: Vec<_> = doc["relations"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(serde_yaml::Value::as_str)
            .collect();
        let expected: Vec<_> = topo
            .get("keystone")
            .unwrap()
            .related()
            .iter()
            .map(|r| endpoint(&r.peer, &r.interface))
            .collect();
        assert_eq!(relations, expected);
        assert!(!records.join("mysql.yaml").exists());
    }

    #[test]
    fn unwritable_record_dir_fails_post_process() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("services");
        std::fs::write(&blocker, "not a directory").unwrap();
        let unit = Unit::new(ServiceUnitDescriptor::new("glance").unwrap())
            .with_post_process(wiring_record_hook(blocker));
        let ctx = ctx_with(Arc::new(MockManager::new()), Arc::new(RecordingProgress::new()));

        let err = unit.post_process(&ctx).unwrap_err();
        assert!(matches!(err, CoreError::PostProcess { unit: ref name, .. } if name == "glance"));
    }

    #[test]
    fn registry_deploy_order_follows_priority() {
        let topo = cloudstrap_schema::builtin_topology().unwrap();
        let registry = UnitRegistry::from_topology(&topo).unwrap();
        let names: Vec<_> = registry
            .deploy_order()
            .iter()
            .map(|u| u.name().to_owned())
            .collect();
        let expected: Vec<_> = topo
            .deploy_order()
            .iter()
            .map(|u| u.name().to_owned())
            .collect();
        assert_eq!(names, expected);
    }
}
