use crate::topology::{parse_topology_str, TopologyFile};
use crate::SchemaError;

/// Default single-host private-cloud topology.
pub const BUILTIN_TOPOLOGY: &str = r#"
[[unit]]
name = "mysql"
deploy_priority = 1

[[unit]]
name = "rabbitmq-server"
deploy_priority = 1

[[unit]]
name = "keystone"
deploy_priority = 2
relations = ["mysql:shared-db"]

[[unit]]
name = "glance"
deploy_priority = 3
display_priority = "storage"
relations = ["mysql:shared-db", "keystone:identity-service"]

[[unit]]
name = "nova-cloud-controller"
deploy_priority = 3
relations = [
  "mysql:shared-db",
  "rabbitmq-server:amqp",
  "keystone:identity-service",
  "glance:image-service",
]

[[unit]]
name = "neutron-api"
deploy_priority = 4
relations = [
  "rabbitmq-server:amqp",
  "mysql:shared-db",
  "nova-cloud-controller:neutron-api",
  "keystone:identity-service",
]

[[unit]]
name = "nova-compute"
deploy_priority = 5
display_priority = "compute"
isolate = true
relations = [
  "nova-cloud-controller:cloud-compute",
  "rabbitmq-server:amqp",
  "glance:image-service",
]

[unit.constraints]
mem = "4G"
root_disk = "40G"

[[unit]]
name = "openstack-dashboard"
deploy_priority = 6
display_priority = "other"
relations = ["keystone:identity-service"]
"#;

pub fn builtin_topology() -> Result<TopologyFile, SchemaError> {
    parse_topology_str(BUILTIN_TOPOLOGY)
}
