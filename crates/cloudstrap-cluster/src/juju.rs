use crate::manager::{ClusterManager, DeployOptions, Placement};
use crate::status::{Relation, ServiceStatus};
use crate::ManagerError;
use cloudstrap_schema::UnitOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// `juju` command line client.
pub struct JujuClient {
    binary: String,
    juju_home: Option<PathBuf>,
}

impl Default for JujuClient {
    fn default() -> Self {
        Self {
            binary: "juju".to_owned(),
            juju_home: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusDoc {
    // juju 1.x calls them services, 2.x applications
    #[serde(default, alias = "applications")]
    services: BTreeMap<String, ServiceDoc>,
}

#[derive(Debug, Deserialize)]
struct ServiceDoc {
    #[serde(default)]
    relations: BTreeMap<String, Vec<String>>,
}

impl JujuClient {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_home(mut self, juju_home: impl Into<PathBuf>) -> Self {
        self.juju_home = Some(juju_home.into());
        self
    }

    #[must_use]
    pub fn with_binary(mut self, binary: &str) -> Self {
        binary.clone_into(&mut self.binary);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(home) = &self.juju_home {
            cmd.env("JUJU_HOME", home);
        }
        cmd
    }

    fn run(&self, args: &[String]) -> Result<String, ManagerError> {
        let mut cmd = self.command();
        cmd.args(args);
        debug!("running {} {}", self.binary, args.join(" "));
        let output = cmd
            .output()
            .map_err(|e| ManagerError::NotReady(format!("cannot run {}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

/// Sort a failed juju invocation into transient or permanent.
pub(crate) fn classify_failure(stderr: &str) -> ManagerError {
    let msg = stderr.trim().to_owned();
    let lower = msg.to_lowercase();
    const PERMANENT: &[&str] = &[
        "ambiguous relation",
        "no relations found",
        "invalid endpoint",
        "invalid relation",
        "invalid service name",
        "charm not found",
        "unknown option",
    ];
    if PERMANENT.iter().any(|p| lower.contains(p)) {
        ManagerError::Rejected(msg)
    } else {
        ManagerError::NotReady(msg)
    }
}

/// `--config` document: options keyed by service name.
pub(crate) fn render_config(unit: &str, options: &UnitOptions) -> Result<String, ManagerError> {
    let mut doc = BTreeMap::new();
    doc.insert(unit, options);
    Ok(serde_yaml::to_string(&doc)?)
}

pub(crate) fn parse_status(unit: &str, json: &str) -> Result<ServiceStatus, ManagerError> {
    let doc: StatusDoc = serde_json::from_str(json)?;
    Ok(match doc.services.get(unit) {
        Some(service) => ServiceStatus {
            name: unit.to_owned(),
            deployed: true,
            relations: service
                .relations
                .iter()
                .map(|(interface, peers)| Relation {
                    interface: interface.clone(),
                    peers: peers.clone(),
                })
                .collect(),
        },
        None => ServiceStatus::absent(unit),
    })
}

impl ClusterManager for JujuClient {
    fn deploy(&self, unit: &str, options: &DeployOptions) -> Result<(), ManagerError> {
        let mut args = vec!["deploy".to_owned()];

        // keep the file alive until juju has read it
        let mut config_file = None;
        if let Some(config) = &options.config {
            let rendered = render_config(unit, config)?;
            let mut file = tempfile::Builder::new()
                .prefix("cloudstrap-")
                .suffix(".yaml")
                .tempfile()?;
            file.write_all(rendered.as_bytes())?;
            args.push("--config".to_owned());
            args.push(file.path().to_string_lossy().into_owned());
            config_file = Some(file);
        }

        if let Placement::Dedicated { constraints } = &options.placement {
            args.push("-n".to_owned());
            args.push("1".to_owned());
            if let Some(c) = constraints {
                args.push("--constraints".to_owned());
                args.push(c.to_string());
            }
        }

        args.push(unit.to_owned());
        let result = self.run(&args).map(|_| ());
        drop(config_file);
        result
    }

    fn add_relation(&self, endpoint_a: &str, endpoint_b: &str) -> Result<(), ManagerError> {
        let args = [
            "add-relation".to_owned(),
            endpoint_a.to_owned(),
            endpoint_b.to_owned(),
        ];
        match self.run(&args) {
            Err(ManagerError::NotReady(msg)) if msg.contains("already exists") => {
                debug!("relation {endpoint_a} <-> {endpoint_b} already exists");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    fn query_service(&self, unit: &str) -> Result<ServiceStatus, ManagerError> {
        let args = [
            "status".to_owned(),
            "--format=json".to_owned(),
            unit.to_owned(),
        ];
        let json = self.run(&args)?;
        parse_status(unit, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_juju1_services() {
        let json = r#"{
  "environment": "local",
  "services": {
    "keystone": {
      "charm": "cs:trusty/keystone-5",
      "relations": {
        "shared-db": ["mysql"],
        "identity-service": ["glance", "nova-cloud-controller"]
      }
    }
  }
}"#;
        let status = parse_status("keystone", json).unwrap();
        assert!(status.deployed);
        assert!(status.is_related("mysql"));
        assert!(status.is_related("glance"));
        assert!(!status.is_related("rabbitmq-server"));
    }

    #[test]
    fn parse_juju2_applications() {
        let json = r#"{"applications": {"mysql": {"relations": {}}}}"#;
        let status = parse_status("mysql", json).unwrap();
        assert!(status.deployed);
        assert!(status.relations.is_empty());
    }

    #[test]
    fn missing_service_is_absent() {
        let status = parse_status("glance", r#"{"services": {}}"#).unwrap();
        assert_eq!(status, ServiceStatus::absent("glance"));
    }

    #[test]
    fn malformed_status_is_parse_error() {
        assert!(matches!(
            parse_status("glance", "not json"),
            Err(ManagerError::Parse(_))
        ));
    }

    #[test]
    fn config_rendered_as_yaml_under_service() {
        let mut options = UnitOptions::new();
        options.insert("virt-type".to_owned(), toml::Value::from("lxc"));
        options.insert("workers".to_owned(), toml::Value::from(4));
        let rendered = render_config("nova-compute", &options).unwrap();
        assert!(rendered.starts_with("nova-compute:\n"));

        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(doc["nova-compute"]["virt-type"].as_str(), Some("lxc"));
        assert_eq!(doc["nova-compute"]["workers"].as_i64(), Some(4));
    }

    #[test]
    fn classify_peer_missing_as_transient() {
        let err = classify_failure("ERROR service \"mysql\" not found\n");
        assert!(err.is_transient());
    }

    #[test]
    fn classify_bad_endpoint_as_permanent() {
        let err = classify_failure("ERROR ambiguous relation: \"a b\" could refer to ...");
        assert!(matches!(err, ManagerError::Rejected(_)));
        let err = classify_failure("ERROR no relations found");
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_binary_is_transient() {
        let client = JujuClient::new().with_binary("/nonexistent/juju-binary");
        let err = client.query_service("mysql").unwrap_err();
        assert!(err.is_transient());
    }
}
