//! Prune and destroy against the in-memory runtime.

use std::sync::Arc;

use dockform_lib::ErrorKind;
use dockform_lib::execute::{CleanupOptions, CleanupReport, ExecuteConfig, destroy, prune};
use dockform_lib::progress::NoProgress;
use dockform_lib::state::{NetworkInfo, NetworkSpec, ServiceState};
use tokio_util::sync::CancellationToken;

use super::common::{CTX, Fixture};

const DECLARED: &str = r#"
identifier: demo
contexts:
  default:
    networks: { kept: {} }
    volumes: { data: {} }
"#;

/// Declared resources plus owned leftovers and a foreign volume on the same daemon.
fn seeded() -> Fixture {
  let fixture = Fixture::new(DECLARED);
  let rt = &fixture.rt;
  rt.insert_network(CTX, Some("demo"), NetworkInfo::from_spec(&NetworkSpec::named("kept")));
  rt.insert_network(CTX, Some("demo"), NetworkInfo::from_spec(&NetworkSpec::named("stale-net")));
  rt.insert_volume(CTX, Some("demo"), "data");
  rt.insert_volume(CTX, Some("demo"), "stale-a");
  rt.insert_volume(CTX, Some("demo"), "stale-b");
  rt.insert_volume(CTX, Some("someone-else"), "foreign");
  rt.insert_volume(CTX, None, "unlabeled");
  fixture
}

async fn run_prune(fixture: &Fixture, options: CleanupOptions) -> dockform_lib::Result<CleanupReport> {
  prune(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::default(),
    options,
    Arc::new(NoProgress),
    &CancellationToken::new(),
  )
  .await
}

#[tokio::test]
async fn prune_removes_only_undeclared_owned_resources() {
  let fixture = seeded();
  let report = run_prune(&fixture, CleanupOptions::default()).await.unwrap();

  assert!(report.is_clean());
  let mut deleted = report.deleted.clone();
  deleted.sort();
  assert_eq!(
    deleted,
    vec![
      "- network default/stale-net",
      "- volume default/stale-a",
      "- volume default/stale-b",
    ]
  );
  assert_eq!(fixture.rt.network_names(CTX), vec!["kept".to_string()]);
  assert_eq!(
    fixture.rt.volume_names(CTX),
    vec!["data".to_string(), "foreign".to_string(), "unlabeled".to_string()]
  );
}

#[tokio::test]
async fn non_strict_prune_attempts_everything_and_warns() {
  let fixture = seeded();
  fixture.rt.fail_on("delete_volume", "stale-a");

  let report = run_prune(&fixture, CleanupOptions::default()).await.unwrap();
  assert_eq!(report.warnings, vec!["1 of 3 deletions failed".to_string()]);
  assert_eq!(report.deleted.len(), 2);
  assert!(!fixture.rt.volume_names(CTX).contains(&"stale-b".to_string()));
}

#[tokio::test]
async fn verbose_non_strict_prune_lists_each_failure() {
  let fixture = seeded();
  fixture.rt.fail_on("delete_volume", "stale-a");
  fixture.rt.fail_on("delete_volume", "stale-b");
  let options = CleanupOptions {
    strict: false,
    verbose_errors: true,
  };

  let report = run_prune(&fixture, options).await.unwrap();
  assert_eq!(report.warnings.len(), 2);
  assert!(report.warnings.iter().any(|w| w.contains("- volume default/stale-b")));
}

#[tokio::test]
async fn strict_prune_fails_after_attempting_everything() {
  let fixture = seeded();
  fixture.rt.fail_on("delete_volume", "stale-a");
  let options = CleanupOptions {
    strict: true,
    verbose_errors: false,
  };

  let err = run_prune(&fixture, options).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::External);
  assert!(err.to_string().contains("1 of 3 deletions failed"));
  assert!(fixture.rt.calls().contains(&"delete_volume default/stale-b".to_string()));
  assert!(fixture.rt.calls().contains(&"delete_network default/stale-net".to_string()));
}

#[tokio::test]
async fn destroy_removes_everything_owned_after_apply() {
  let fixture = Fixture::scenario().await;
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  let report = destroy(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::sequential(),
    CleanupOptions {
      strict: true,
      verbose_errors: true,
    },
    Arc::new(NoProgress),
    &CancellationToken::new(),
  )
  .await
  .unwrap();

  assert_eq!(report.deleted.len(), 4);
  assert!(fixture.rt.running(CTX).is_empty());
  assert!(fixture.rt.volume_names(CTX).is_empty());
  assert!(fixture.rt.network_names(CTX).is_empty());

  let again = fixture.plan().await.unwrap();
  assert_eq!(again.count_actions(), (4, 1, 0));
}

#[tokio::test]
async fn destroy_with_nothing_owned_is_a_no_op() {
  let fixture = Fixture::new(DECLARED);
  fixture.rt.insert_volume(CTX, None, "unlabeled");

  let report = destroy(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::default(),
    CleanupOptions::default(),
    Arc::new(NoProgress),
    &CancellationToken::new(),
  )
  .await
  .unwrap();
  assert!(report.deleted.is_empty());
  assert_eq!(fixture.rt.volume_names(CTX), vec!["unlabeled".to_string()]);
}

#[tokio::test]
async fn destroy_takes_down_stopped_stacks_before_their_volumes() {
  let fixture = Fixture::new(DECLARED);
  fixture.rt.insert_volume(CTX, Some("demo"), "data");
  let stopped = ServiceState {
    project: "web".to_string(),
    service: "app".to_string(),
    config_hash: "h".to_string(),
    running: false,
  };
  fixture.rt.insert_container(CTX, "demo", stopped, &["data"]);

  let report = destroy(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::sequential(),
    CleanupOptions {
      strict: true,
      verbose_errors: true,
    },
    Arc::new(NoProgress),
    &CancellationToken::new(),
  )
  .await
  .unwrap();

  assert_eq!(report.deleted, vec!["- stack default/web", "- volume default/data"]);
  assert!(fixture.rt.volume_names(CTX).is_empty());
}
