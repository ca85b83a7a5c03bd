//! Observed facts about a running cluster.

use crate::domain::version::EngineVersion;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One consensus member and the address clients reach it on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonInfo {
    pub name: String,
    /// `host:port`
    pub endpoint: String,
}

impl MonInfo {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Discovered facts about a created or connected cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedClusterInfo {
    /// Cluster identifier reported by the engine
    #[serde(default)]
    pub fsid: String,
    /// Admin key used to write the local connection config
    #[serde(default)]
    pub admin_secret: String,
    /// Consensus members keyed by name
    #[serde(default)]
    pub monitors: BTreeMap<String, MonInfo>,
    /// Engine version the cluster was deployed or verified with
    #[serde(default)]
    pub version: Option<EngineVersion>,
}

impl ObservedClusterInfo {
    /// Endpoints of every consensus member, ordered by member name
    pub fn mon_endpoints(&self) -> Vec<String> {
        self.monitors.values().map(|m| m.endpoint.clone()).collect()
    }
}

/// Flatten monitors into `name=endpoint` pairs joined by commas.
pub fn flatten_mon_endpoints(monitors: &BTreeMap<String, MonInfo>) -> String {
    monitors
        .values()
        .map(|m| format!("{}={}", m.name, m.endpoint))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`flatten_mon_endpoints`]; an empty string yields no monitors.
pub fn parse_mon_endpoints(flattened: &str) -> Result<BTreeMap<String, MonInfo>> {
    let mut monitors = BTreeMap::new();
    for pair in flattened.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, endpoint) = pair.split_once('=').ok_or_else(|| {
            Error::Configuration(format!("invalid monitor endpoint entry {:?}", pair))
        })?;
        if name.is_empty() || endpoint.is_empty() {
            return Err(Error::Configuration(format!(
                "invalid monitor endpoint entry {:?}",
                pair
            )));
        }
        monitors.insert(name.to_string(), MonInfo::new(name, endpoint));
    }
    Ok(monitors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_single_monitor() {
        let mut mons = BTreeMap::new();
        mons.insert("foo".to_string(), MonInfo::new("foo", "1.2.3.4:5000"));
        assert_eq!(flatten_mon_endpoints(&mons), "foo=1.2.3.4:5000");
    }

    #[test]
    fn test_parse_flattened_endpoints() {
        let mons = parse_mon_endpoints("foo=1.2.3.4:5000,bar=2.3.4.5:6000").unwrap();
        assert_eq!(mons.len(), 2);
        assert_eq!(mons["foo"].endpoint, "1.2.3.4:5000");
        assert_eq!(mons["bar"].endpoint, "2.3.4.5:6000");

        let round_trip = parse_mon_endpoints(&flatten_mon_endpoints(&mons)).unwrap();
        assert_eq!(round_trip, mons);

        assert!(parse_mon_endpoints("").unwrap().is_empty());
        assert!(parse_mon_endpoints("foo").is_err());
        assert!(parse_mon_endpoints("=1.2.3.4:5000").is_err());
    }
}
