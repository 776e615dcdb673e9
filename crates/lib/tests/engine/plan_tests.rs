//! Plan building against seeded runtime state.

use std::sync::{Arc, Mutex};

use dockform_lib::ErrorKind;
use dockform_lib::execute::{ExecuteConfig, apply};
use dockform_lib::plan::{ActionKind, Payload, ResourceType, build_destroy_plan, build_plan};
use dockform_lib::runtime::Runtime as _;
use dockform_lib::secrets::StaticSecrets;
use tokio_util::sync::CancellationToken;

use super::common::{CTX, Fixture, labels};

#[tokio::test]
async fn scenario_plans_creates_and_a_fileset_diff() {
  let fixture = Fixture::scenario().await;
  let plan = fixture.plan().await.unwrap();

  assert_eq!(
    labels(&plan),
    vec![
      "+ network default/demo-network",
      "+ volume default/demo-data",
      "~ fileset default/assets",
    ]
  );
  assert_eq!(plan.count_actions(), (2, 1, 0));

  let Payload::Fileset(payload) = &plan.actions()[2].payload else {
    panic!("fileset action without fileset payload");
  };
  let created: Vec<&str> = payload.diff.to_create.iter().map(|f| f.path.as_str()).collect();
  let updated: Vec<&str> = payload.diff.to_update.iter().map(|f| f.path.as_str()).collect();
  assert_eq!(created, vec!["sub/b.txt"]);
  assert_eq!(updated, vec!["a.txt"]);
  assert_eq!(payload.diff.to_delete, vec!["old.txt".to_string()]);
  assert_eq!(plan.actions()[2].reason, "1 to create, 1 to update, 1 to delete");
}

#[tokio::test]
async fn scenario_renders_grouped_by_context() {
  let fixture = Fixture::scenario().await;
  let rendered = fixture.plan().await.unwrap().to_string();

  assert!(rendered.starts_with("default\n"));
  assert!(rendered.contains("    + demo-network"));
  assert!(rendered.contains("    ~ assets (1 to create, 1 to update, 1 to delete)"));
  assert!(rendered.ends_with("Plan: 2 to create, 1 to update, 0 to delete.\n"));
}

#[tokio::test]
async fn plan_is_empty_after_apply() {
  let fixture = Fixture::scenario().await;
  let plan = fixture.plan().await.unwrap();
  fixture.apply(plan).await.unwrap();

  let again = fixture.plan().await.unwrap();
  assert!(again.is_empty(), "unexpected actions: {:?}", labels(&again));
  assert_eq!(again.count_actions(), (0, 0, 0));
  assert_eq!(again.to_string(), "No changes.\n");
}

#[tokio::test]
async fn editing_compose_files_updates_the_stack() {
  let fixture = Fixture::scenario().await;
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  fixture.rt.bump_revision(CTX, "web");
  let plan = fixture.plan().await.unwrap();
  assert_eq!(labels(&plan), vec!["~ stack default/web"]);
  assert_eq!(plan.actions()[0].kind, ActionKind::Update);
  assert_eq!(plan.actions()[0].reason, "changed: nginx");
}

#[tokio::test]
async fn destroy_plan_reverses_dependency_order() {
  let fixture = Fixture::scenario().await;
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  let plan = build_destroy_plan(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::default(),
    &CancellationToken::new(),
  )
  .await
  .unwrap();
  assert_eq!(
    labels(&plan),
    vec![
      "- stack default/web",
      "- volume default/assets-data",
      "- volume default/demo-data",
      "- network default/demo-network",
    ]
  );
  plan.validate().unwrap();
}

#[tokio::test]
async fn missing_secrets_fail_the_plan() {
  let fixture = Fixture::new(
    r#"
identifier: demo
contexts:
  default:
    stacks:
      web: { root: web, secrets: { sops: [secrets.env] } }
"#,
  );
  fixture.rt.declare_service(CTX, "web", "nginx", &[]);

  let err = build_plan(
    fixture.rt.clone(),
    Arc::new(StaticSecrets::default()),
    &fixture.desired,
    &ExecuteConfig::sequential(),
    &CancellationToken::new(),
  )
  .await
  .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// One context where every resource kind is planned at once.
const FRESH: &str = r#"
identifier: demo
contexts:
  default:
    networks: { front: {} }
    volumes: { db-data: {} }
    stacks:
      web: { root: web }
    filesets:
      assets: { source: assets, target_volume: assets-data, target_path: /srv }
"#;

#[tokio::test]
async fn every_resource_kind_is_ordered_by_dependency() {
  let fixture = Fixture::new(FRESH);
  fixture.write_source("assets/index.html", "<h1>hi</h1>");
  fixture.rt.declare_service(CTX, "web", "nginx", &["assets-data"]);

  let plan = fixture.plan().await.unwrap();
  assert_eq!(
    labels(&plan),
    vec![
      "+ network default/front",
      "+ volume default/assets-data",
      "+ volume default/db-data",
      "+ stack default/web",
      "~ fileset default/assets",
    ]
  );
  let ranks: Vec<u8> = plan.actions().iter().map(|a| a.resource.rank()).collect();
  assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{:?}", ranks);
  plan.validate().unwrap();

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

  let destroy = build_destroy_plan(
    fixture.rt.clone(),
    &fixture.desired,
    &ExecuteConfig::default(),
    &CancellationToken::new(),
  )
  .await
  .unwrap();
  destroy.validate().unwrap();
  assert!(destroy.actions().iter().all(|a| a.kind == ActionKind::Delete));

  let created: Vec<ResourceType> = plan
    .actions()
    .iter()
    .rev()
    .map(|a| a.resource)
    .filter(|r| *r != ResourceType::Fileset)
    .collect();
  let deleted: Vec<ResourceType> = destroy.actions().iter().map(|a| a.resource).collect();
  assert_eq!(deleted, created);
}

#[tokio::test]
async fn stopped_stack_is_planned_as_missing() {
  let fixture = Fixture::scenario().await;
  fixture.apply(fixture.plan().await.unwrap()).await.unwrap();

  fixture
    .rt
    .stop_services(&fixture.endpoint(), &["nginx".to_string()])
    .await
    .unwrap();
  let plan = fixture.plan().await.unwrap();
  assert_eq!(labels(&plan), vec!["+ stack default/web"]);
}
