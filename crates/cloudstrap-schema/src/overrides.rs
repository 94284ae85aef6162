use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment options for one unit, passed verbatim to the cluster manager.
pub type UnitOptions = BTreeMap<String, toml::Value>;

/// Operator-supplied per-unit deployment overrides, keyed by unit name.
///
/// Loaded once and handed through the orchestrator; a missing file means
/// every unit deploys with its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitOverrides {
    #[serde(flatten)]
    units: BTreeMap<String, UnitOptions>,
}

impl UnitOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, SchemaError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, unit: &str) -> Option<&UnitOptions> {
        self.units.get(unit)
    }

    pub fn set(&mut self, unit: &str, key: &str, value: impl Into<toml::Value>) {
        self.units
            .entry(unit.to_owned())
            .or_default()
            .insert(key.to_owned(), value.into());
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tables_per_unit() {
        let overrides: UnitOverrides = toml::from_str(
            r#"
[keystone]
admin-password = "openstack"

[nova-compute]
virt-type = "lxc"
"#,
        )
        .unwrap();
        assert_eq!(
            overrides
                .get("keystone")
                .and_then(|o| o.get("admin-password"))
                .and_then(toml::Value::as_str),
            Some("openstack")
        );
        assert!(overrides.get("mysql").is_none());
        assert_eq!(overrides.unit_names().count(), 2);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = UnitOverrides::load_or_default(&dir.path().join("units.toml")).unwrap();
        assert!(overrides.is_empty());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/units.toml");

        let mut overrides = UnitOverrides::new();
        overrides.set("glance", "image-size", 20);
        overrides.save(&path).unwrap();

        let loaded = UnitOverrides::load(&path).unwrap();
        assert_eq!(loaded, overrides);
    }
}
