//! Actual state as discovered from a runtime endpoint.
//!
//! Read fresh at the start of every plan build and never cached across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::desired::NetworkSpec;

/// A labeled network as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
  pub name: String,
  #[serde(default)]
  pub driver: String,
  #[serde(default)]
  pub subnet: Option<String>,
  #[serde(default)]
  pub gateway: Option<String>,
  #[serde(default)]
  pub ip_range: Option<String>,
  #[serde(default)]
  pub internal: bool,
  #[serde(default)]
  pub attachable: bool,
  #[serde(default)]
  pub ipv6: bool,
  #[serde(default)]
  pub options: BTreeMap<String, String>,
}

impl NetworkInfo {
  /// Build the view the runtime would report after creating `spec`.
  pub fn from_spec(spec: &NetworkSpec) -> Self {
    Self {
      name: spec.name.clone(),
      driver: spec.driver.clone().unwrap_or_else(|| "bridge".to_string()),
      subnet: spec.subnet.clone(),
      gateway: spec.gateway.clone(),
      ip_range: spec.ip_range.clone(),
      internal: spec.internal,
      attachable: spec.attachable,
      ipv6: spec.ipv6,
      options: spec.options.clone(),
    }
  }

  /// Describe every field where the runtime disagrees with `spec`.
  ///
  /// Unset optional fields in the spec match anything; the driver defaults to `bridge`.
  pub fn differences(&self, spec: &NetworkSpec) -> Vec<String> {
    let mut diffs = Vec::new();

    let want_driver = spec.driver.as_deref().unwrap_or("bridge");
    if self.driver != want_driver {
      diffs.push(format!("driver {} != {}", self.driver, want_driver));
    }

    let optional = [
      ("subnet", &spec.subnet, &self.subnet),
      ("gateway", &spec.gateway, &self.gateway),
      ("ip_range", &spec.ip_range, &self.ip_range),
    ];
    for (field, want, have) in optional {
      if let Some(want) = want
        && have.as_deref() != Some(want.as_str())
      {
        diffs.push(format!("{} {} != {}", field, have.as_deref().unwrap_or("<unset>"), want));
      }
    }

    let flags = [
      ("internal", spec.internal, self.internal),
      ("attachable", spec.attachable, self.attachable),
      ("ipv6", spec.ipv6, self.ipv6),
    ];
    for (field, want, have) in flags {
      if want != have {
        diffs.push(format!("{} {} != {}", field, have, want));
      }
    }

    for (key, want) in &spec.options {
      match self.options.get(key) {
        Some(have) if have == want => {}
        have => diffs.push(format!(
          "option {} {} != {}",
          key,
          have.map(String::as_str).unwrap_or("<unset>"),
          want
        )),
      }
    }

    diffs
  }
}

/// A labeled volume as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
  pub name: String,
  #[serde(default)]
  pub driver: String,
}

/// One owned compose service container, running or stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
  pub project: String,
  pub service: String,
  /// Configuration hash recorded by compose when the container was created.
  pub config_hash: String,
  #[serde(default)]
  pub running: bool,
}

/// Everything discovered for one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualState {
  pub networks: BTreeMap<String, NetworkInfo>,
  pub volumes: BTreeMap<String, VolumeInfo>,
  pub services: Vec<ServiceState>,
}

impl ActualState {
  pub fn new(networks: Vec<NetworkInfo>, volumes: Vec<VolumeInfo>, services: Vec<ServiceState>) -> Self {
    Self {
      networks: networks.into_iter().map(|n| (n.name.clone(), n)).collect(),
      volumes: volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
      services,
    }
  }

  /// Running services of one compose project keyed by service name. Stopped containers
  /// are left out so drift reports them as missing.
  pub fn project_services(&self, project: &str) -> BTreeMap<String, String> {
    self
      .services
      .iter()
      .filter(|s| s.project == project && s.running)
      .map(|s| (s.service.clone(), s.config_hash.clone()))
      .collect()
  }

  /// Service names of one compose project, stopped containers included.
  pub fn project_service_names(&self, project: &str) -> BTreeSet<String> {
    self
      .services
      .iter()
      .filter(|s| s.project == project)
      .map(|s| s.service.clone())
      .collect()
  }

  /// Distinct compose projects with at least one container, running or stopped.
  pub fn projects(&self) -> Vec<String> {
    let mut projects: Vec<String> = self.services.iter().map(|s| s.project.clone()).collect();
    projects.sort();
    projects.dedup();
    projects
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_spec_has_no_differences() {
    let mut spec = NetworkSpec::named("demo-network");
    spec.subnet = Some("10.0.0.0/24".to_string());
    spec.options.insert("com.docker.network.bridge.name".to_string(), "br0".to_string());
    let info = NetworkInfo::from_spec(&spec);
    assert!(info.differences(&spec).is_empty());
  }

  #[test]
  fn unset_subnet_matches_anything() {
    let spec = NetworkSpec::named("n");
    let info = NetworkInfo {
      name: "n".to_string(),
      driver: "bridge".to_string(),
      subnet: Some("172.18.0.0/16".to_string()),
      ..Default::default()
    };
    assert!(info.differences(&spec).is_empty());
  }

  #[test]
  fn reports_driver_and_subnet_mismatch() {
    let mut spec = NetworkSpec::named("n");
    spec.driver = Some("overlay".to_string());
    spec.subnet = Some("10.1.0.0/24".to_string());
    let info = NetworkInfo {
      name: "n".to_string(),
      driver: "bridge".to_string(),
      ..Default::default()
    };
    let diffs = info.differences(&spec);
    assert_eq!(diffs.len(), 2);
    assert!(diffs[0].starts_with("driver"));
    assert!(diffs[1].starts_with("subnet"));
  }

  #[test]
  fn project_services_filters_by_project() {
    let actual = ActualState::new(
      vec![],
      vec![],
      vec![
        ServiceState {
          project: "web".to_string(),
          service: "app".to_string(),
          config_hash: "h1".to_string(),
          running: true,
        },
        ServiceState {
          project: "db".to_string(),
          service: "postgres".to_string(),
          config_hash: "h2".to_string(),
          running: true,
        },
      ],
    );
    let web = actual.project_services("web");
    assert_eq!(web.len(), 1);
    assert_eq!(web["app"], "h1");
    assert_eq!(actual.projects(), vec!["db".to_string(), "web".to_string()]);
  }

  #[test]
  fn stopped_containers_count_as_projects_but_not_as_running() {
    let actual = ActualState::new(
      vec![],
      vec![],
      vec![ServiceState {
        project: "web".to_string(),
        service: "app".to_string(),
        config_hash: "h1".to_string(),
        running: false,
      }],
    );
    assert!(actual.project_services("web").is_empty());
    assert_eq!(actual.project_service_names("web"), BTreeSet::from(["app".to_string()]));
    assert_eq!(actual.projects(), vec!["web".to_string()]);
  }
}
