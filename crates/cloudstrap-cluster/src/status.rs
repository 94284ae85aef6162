use serde::{Deserialize, Serialize};

/// One relation of a service as seen by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub interface: String,
    pub peers: Vec<String>,
}

/// Live view of a single service, valid only for the decision it was read for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub deployed: bool,
    pub relations: Vec<Relation>,
}

impl ServiceStatus {
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            deployed: false,
            relations: Vec::new(),
        }
    }

    /// Whether any established relation involves `peer`.
    pub fn is_related(&self, peer: &str) -> bool {
        self.relations
            .iter()
            .any(|r| r.peers.iter().any(|p| p == peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_matches_any_interface() {
        let status = ServiceStatus {
            name: "keystone".to_owned(),
            deployed: true,
            relations: vec![Relation {
                interface: "shared-db".to_owned(),
                peers: vec!["mysql".to_owned()],
            }],
        };
        assert!(status.is_related("mysql"));
        assert!(!status.is_related("glance"));
        assert!(!ServiceStatus::absent("keystone").is_related("mysql"));
    }
}
