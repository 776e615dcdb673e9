//! Apply execution against the in-memory runtime.

use std::sync::{Arc, Mutex};

use dockform_lib::ErrorKind;
use dockform_lib::execute::{ExecuteConfig, apply};
use dockform_lib::fileset::{FileManifest, SENTINEL_FILENAME};
use dockform_lib::progress::NoProgress;
use dockform_lib::runtime::StagingOp;
use dockform_lib::state::ServiceState;
use tokio_util::sync::CancellationToken;

use super::common::{CTX, Fixture, labels};

#[tokio::test]
async fn scenario_apply_converges_volume_contents() {
  let fixture = Fixture::scenario().await;
  let report = fixture.apply(fixture.plan().await.unwrap()).await.unwrap();
  assert_eq!(report.applied.len(), 3);

  let rt = &fixture.rt;
  assert_eq!(rt.network_names(CTX), vec!["demo-network".to_string()]);
  assert_eq!(
    rt.volume_names(CTX),
    vec!["assets-data".to_string(), "demo-data".to_string()]
  );
  assert_eq!(
    rt.volume_paths(CTX, "assets-data"),
    vec![
      format!("/srv/assets/{}", SENTINEL_FILENAME),
      "/srv/assets/a.txt".to_string(),
      "/srv/assets/sub/b.txt".to_string(),
    ]
  );
  assert_eq!(
    rt.volume_file(CTX, "assets-data", "/srv/assets/a.txt"),
    Some(b"new contents".to_vec())
  );

  let sentinel = rt
    .volume_file(CTX, "assets-data", &format!("/srv/assets/{}", SENTINEL_FILENAME))
    .unwrap();
  let manifest = FileManifest::from_json(&String::from_utf8(sentinel).unwrap()).unwrap();
  let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
  assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
  assert_eq!(manifest.exclude, vec!["*.tmp".to_string()]);

  assert!(rt.calls().contains(&"restart_services default/nginx".to_string()));
}

#[tokio::test]
async fn actions_run_in_dependency_order_within_a_context() {
  let fixture = Fixture::scenario().await;
  let plan = fixture.plan().await.unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();

  apply(
    fixture.rt.clone(),
    Arc::new(plan.clone()),
    &ExecuteConfig::sequential(),
    Arc::new(move |label: &str| sink.lock().unwrap().push(label.to_string())),
    &CancellationToken::new(),
  )
  .await
  .unwrap();

  assert_eq!(*seen.lock().unwrap(), labels(&plan));
}

#[tokio::test]
async fn failed_volume_skips_its_fileset() {
  let fixture = Fixture::new(
    r#"
identifier: demo
contexts:
  default:
    networks: { net: {} }
    filesets:
      assets: { source: assets, target_volume: assets-data, target_path: / }
"#,
  );
  fixture.write_source("assets/a.txt", "a");
  fixture.rt.fail_on("create_volume", "assets-data");

  let plan = fixture.plan().await.unwrap();
  assert_eq!(
    labels(&plan),
    vec![
      "+ network default/net",
      "+ volume default/assets-data",
      "~ fileset default/assets",
    ]
  );

  let err = fixture.apply(plan).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::External);
  assert!(err.to_string().contains("+ volume default/assets-data"));
  assert_eq!(fixture.rt.network_names(CTX), vec!["net".to_string()]);
  assert!(!fixture.rt.calls().iter().any(|c| c.starts_with("extract_archive")));
}

#[tokio::test]
async fn failures_in_one_context_do_not_stop_another() {
  let fixture = Fixture::new(
    r#"
identifier: demo
contexts:
  alpha:
    volumes: { data: {} }
  beta:
    volumes: { broken: {}, ok: {} }
"#,
  );
  fixture.rt.fail_on("create_volume", "broken");

  let err = fixture.apply(fixture.plan().await.unwrap()).await.unwrap_err();
  assert_eq!(err.into_errors().len(), 1);
  assert_eq!(fixture.rt.volume_names("alpha"), vec!["data".to_string()]);
  assert_eq!(fixture.rt.volume_names("beta"), vec!["ok".to_string()]);

  fixture.rt.clear_failures();
  let retry = fixture.plan().await.unwrap();
  assert_eq!(labels(&retry), vec!["+ volume beta/broken"]);
  fixture.apply(retry).await.unwrap();
}

#[tokio::test]
async fn cancellation_reports_actions_not_run() {
  let fixture = Fixture::scenario().await;
  let plan = fixture.plan().await.unwrap();
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();

  let err = apply(
    fixture.rt.clone(),
    Arc::new(plan),
    &ExecuteConfig::sequential(),
    Arc::new(move |_: &str| trigger.cancel()),
    &cancel,
  )
  .await
  .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Cancelled);
  let message = err.to_string();
  assert!(message.contains("3 actions not run"), "{}", message);
  assert!(message.contains("~ fileset default/assets"));
  assert!(fixture.rt.network_names(CTX).is_empty());
}

#[tokio::test]
async fn cold_mode_stops_and_starts_attached_services() {
  let fixture = Fixture::new(
    r#"
identifier: demo
contexts:
  default:
    stacks:
      web: { root: web }
    filesets:
      assets:
        source: assets
        target_volume: assets-data
        target_path: /srv
        restart_services: [nginx]
        apply_mode: cold
"#,
  );
  fixture.write_source("assets/index.html", "<h1>hi</h1>");
  fixture.rt.declare_service(CTX, "web", "nginx", &["assets-data"]);
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  let calls = fixture.rt.calls();
  let stop = calls.iter().position(|c| c == "stop_services default/nginx").unwrap();
  let extract = calls.iter().position(|c| c == "extract_archive default/assets-data").unwrap();
  let start = calls.iter().position(|c| c == "start_services default/nginx").unwrap();
  assert!(stop < extract && extract < start);
  assert_eq!(
    fixture.rt.running(CTX),
    vec![("web".to_string(), "nginx".to_string())]
  );
}

#[tokio::test]
async fn malformed_plan_is_rejected_before_execution() {
  let fixture = Fixture::scenario().await;
  let plan = fixture.plan().await.unwrap();
  let reversed: Vec<_> = plan.actions().iter().rev().cloned().collect();
  let endpoints = [(CTX.to_string(), fixture.endpoint())].into_iter().collect();
  let bad = dockform_lib::plan::Plan::from_actions(reversed, endpoints);
  let before = fixture.rt.calls().len();

  let err = apply(
    fixture.rt.clone(),
    Arc::new(bad),
    &ExecuteConfig::default(),
    Arc::new(NoProgress),
    &CancellationToken::new(),
  )
  .await
  .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  assert_eq!(fixture.rt.calls().len(), before);
}

#[tokio::test]
async fn owner_change_reaches_preserved_files() {
  let mut fixture = Fixture::new(
    r#"
identifier: demo
contexts:
  default:
    filesets:
      assets:
        source: assets
        target_volume: assets-data
        target_path: /srv
        ownership: { user: "1000", preserve_existing: true }
"#,
  );
  fixture.write_source("assets/a.txt", "a");
  fixture.write_source("assets/sub/b.txt", "b");
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  let spec = fixture
    .desired
    .contexts
    .get_mut(CTX)
    .and_then(|ctx| ctx.filesets.get_mut("assets"))
    .unwrap();
  spec.ownership.uid = Some(2000);

  let plan = fixture.plan().await.unwrap();
  assert_eq!(labels(&plan), vec!["~ fileset default/assets"]);
  assert_eq!(plan.actions()[0].reason, "ownership changed");
  fixture.apply(plan).await.unwrap();

  let ops = fixture.rt.ownership_ops(CTX, "assets-data");
  assert_eq!(ops.len(), 2);
  match &ops[1] {
    StagingOp::ApplyOwnership { uid, paths, .. } => {
      assert_eq!(*uid, Some(2000));
      assert_eq!(paths, &vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }
    other => panic!("unexpected staging op {:?}", other),
  }
  assert!(fixture.plan().await.unwrap().is_empty());
}

const WEB_ONLY: &str = r#"
identifier: demo
contexts:
  default:
    stacks:
      web: { root: web }
"#;

/// `web` declaring `app`, already applied.
async fn running_web() -> Fixture {
  let fixture = Fixture::new(WEB_ONLY);
  fixture.rt.declare_service(CTX, "web", "app", &[]);
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();
  fixture
}

#[tokio::test]
async fn undeclared_service_is_removed_from_its_stack() {
  let fixture = running_web().await;
  let legacy = ServiceState {
    project: "web".to_string(),
    service: "legacy".to_string(),
    config_hash: "old".to_string(),
    running: true,
  };
  fixture.rt.insert_container(CTX, "demo", legacy, &[]);

  let plan = fixture.plan().await.unwrap();
  assert_eq!(labels(&plan), vec!["~ stack default/web"]);
  assert_eq!(plan.actions()[0].reason, "orphaned: legacy");
  fixture.apply(plan).await.unwrap();

  assert_eq!(fixture.rt.running(CTX), vec![("web".to_string(), "app".to_string())]);
  assert!(fixture.plan().await.unwrap().is_empty());
}

#[tokio::test]
async fn stack_declaring_no_services_is_taken_down() {
  let fixture = running_web().await;
  fixture.rt.clear_services(CTX, "web");

  let plan = fixture.plan().await.unwrap();
  assert_eq!(labels(&plan), vec!["- stack default/web"]);
  assert_eq!(plan.actions()[0].reason, "no services declared");
  fixture.apply(plan).await.unwrap();

  assert!(fixture.rt.running(CTX).is_empty());
  assert!(fixture.plan().await.unwrap().is_empty());
}
