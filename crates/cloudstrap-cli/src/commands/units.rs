use super::{json_pretty, load_topology, EXIT_SUCCESS};
use cloudstrap_schema::ServiceUnitDescriptor;
use std::path::Path;

fn relations(unit: &ServiceUnitDescriptor) -> Vec<String> {
    unit.related().iter().map(ToString::to_string).collect()
}

pub fn run(topology: Option<&Path>, json: bool) -> Result<u8, String> {
    let topology = load_topology(topology)?;
    let units = topology.display_order();

    if json {
        let payload: Vec<_> = units
            .iter()
            .map(|u| {
                serde_json::json!({
                    "name": u.name(),
                    "display_priority": u.display_priority(),
                    "deploy_priority": u.deploy_priority(),
                    "isolate": u.isolate(),
                    "constraints": u.constraints().map(ToString::to_string),
                    "relations": relations(u),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if units.is_empty() {
        println!("no service units defined.");
    } else {
        println!("{:<24} {:<8} {:<8} RELATIONS", "UNIT", "GROUP", "ORDER");
        for u in units {
            let order = if u.deploy_priority() == u32::MAX {
                "-".to_owned()
            } else {
                u.deploy_priority().to_string()
            };
            println!(
                "{:<24} {:<8} {:<8} {}",
                u.name(),
                u.display_priority().to_string(),
                order,
                relations(u).join(", ")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
