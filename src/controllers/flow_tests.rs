//! End-to-end scenarios driving the full orchestrator over the in-memory
//! cluster, with scripted deployers fulfilling the deployer contract.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::controllers::MonitorConfig;
use crate::jobs;
use crate::store::{Cluster, RetryConfig};
use crate::test_utils::{
    start_engine, start_engine_with, wait_for, wait_for_installation_gone,
    wait_for_installation_phase, DeployBehavior, ScriptedDeployer, WAIT_TIMEOUT,
};
use crate::types::{
    ContextId, DeployItemSpec, ErrorReason, ExecutionId, ExecutionSpec, ExportDecl, ImportDecl,
    Installation, InstallationId, InstallationSpec, JobId, Phase, SourceKind,
    SubInstallationTemplate, Target, TargetId, TargetSpec,
};

const RETRY: RetryConfig = RetryConfig::DEFAULT;

async fn create_and_request(cluster: &Cluster, inst: Installation) -> JobId {
    let id = inst.id.clone();
    cluster.installations.create(inst).await.unwrap();
    jobs::request_installation(cluster, &id, false, &RETRY)
        .await
        .unwrap()
        .expect("installation exists")
}

async fn wait_for_cycle_finished(cluster: &Cluster, id: &InstallationId, job: &JobId) -> bool {
    wait_for(WAIT_TIMEOUT, || async {
        match cluster.installations.get(id).await {
            Ok(Some(inst)) => inst.status.work.job_id_finished.as_ref() == Some(job),
            _ => false,
        }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_unit_with_execution_succeeds() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(cluster.clone(), "echo", DeployBehavior::Echo);
    deployer.spawn(_engine.shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "web", "echo",
        )])),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);

    // Terminal phase implies finished token, all the way down.
    let inst = cluster
        .installations
        .get(&InstallationId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inst.status.work.job_id, inst.status.work.job_id_finished);

    let exec = cluster
        .executions
        .get(&ExecutionId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status.work.phase, Phase::Succeeded);
    assert_eq!(exec.status.work.job_id, exec.status.work.job_id_finished);

    let items = cluster.items_of(&ExecutionId::new("root")).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status.work.phase, Phase::Succeeded);
    assert!(items[0].status.deployer.is_some());
}

/// A root unit with two declared exports and one sub-unit: after both units
/// succeed, exactly two root-visible data objects exist with the expected
/// payloads.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn data_exports_flow_to_root_scope() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(
        cluster.clone(),
        "mapper",
        DeployBehavior::MapImport {
            import_key: "value".to_string(),
            export_key: "mapping-value".to_string(),
            prefix: "mapping-".to_string(),
        },
    );
    deployer.spawn(_engine.shutdown.clone());

    let sub = InstallationSpec::new()
        .with_imports(vec![ImportDecl::data("value")])
        .with_exports(vec![ExportDecl::data("mapping-value", "mapping-value")])
        .with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "map", "mapper",
        )]));
    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new()
            .with_imports(vec![ImportDecl::data_value("value", json!("importedValue"))])
            .with_exports(vec![
                ExportDecl::data("value", "value"),
                ExportDecl::data("mapping-value", "mapping-value"),
            ])
            .with_subs(vec![SubInstallationTemplate::new("sub", sub)]),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);
    assert!(
        wait_for_installation_phase(&cluster, &InstallationId::new("root/sub"), Phase::Succeeded)
            .await
    );

    // Exactly two root-visible data objects, with the two expected payloads.
    let root_visible: Vec<_> = cluster
        .data_objects
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.labels.context.is_none())
        .collect();
    assert_eq!(root_visible.len(), 2);
    for object in &root_visible {
        assert_eq!(object.labels.source_kind, SourceKind::Export);
        assert_eq!(object.labels.source.as_str(), "Inst.root");
    }

    let by_key = |key: &str| {
        root_visible
            .iter()
            .find(|o| o.labels.key == key)
            .unwrap_or_else(|| panic!("missing root export {:?}", key))
            .data
            .clone()
    };
    assert_eq!(by_key("value"), json!("importedValue"));
    assert_eq!(by_key("mapping-value"), json!("mapping-importedValue"));
}

/// A root unit re-exports an imported target: after success exactly one
/// root-visible target exists under the export key, its spec equal to the
/// source target's spec.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_export_preserves_source_spec() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);

    let source_spec = TargetSpec::new("cluster", json!({"kubeconfig": "apiserver-a"}));
    cluster
        .targets
        .create(Target::new(TargetId::new("src-target"), source_spec.clone()))
        .await
        .unwrap();

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new()
            .with_imports(vec![ImportDecl::target_ref(
                "targetImp",
                TargetId::new("src-target"),
            )])
            .with_exports(vec![ExportDecl::target("targetExp", "targetImp")]),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);

    let exported: Vec<_> = cluster
        .targets
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| {
            t.labels
                .as_ref()
                .is_some_and(|l| l.context.is_none() && l.key == "targetExp")
        })
        .collect();
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].spec, source_spec);
    assert_eq!(
        exported[0].labels.as_ref().unwrap().source_kind,
        SourceKind::Export
    );
}

/// A sub-unit's target-list import aggregates all candidates in its scope:
/// three matches resolve to a sequence of three (each spec equal to the
/// shared source spec), zero matches resolve to an empty sequence, not an
/// error.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_list_imports_aggregate_candidates() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);

    let shared_spec = TargetSpec::new("cluster", json!({"kubeconfig": "shared"}));
    let mut refs = Vec::new();
    for n in 0..3 {
        let id = TargetId::new(format!("t{}", n));
        refs.push(id.clone());
        cluster
            .targets
            .create(Target::new(id, shared_spec.clone()))
            .await
            .unwrap();
    }

    let sub = InstallationSpec::new().with_imports(vec![
        ImportDecl::target_list("subTargetListImp"),
        ImportDecl::target_list("subEmptyTargetListImp"),
    ]);
    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new()
            .with_imports(vec![ImportDecl::target_list_refs("subTargetListImp", refs)])
            .with_subs(vec![SubInstallationTemplate::new("sub", sub)]),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);

    let sub_scope = Some(ContextId::of_installation(&InstallationId::new("root/sub")));
    let resolved = cluster
        .targets_in_scope(&sub_scope, "subTargetListImp")
        .await
        .unwrap();
    assert_eq!(resolved.len(), 3);
    for target in &resolved {
        assert_eq!(target.spec, shared_spec);
        let labels = target.labels.as_ref().unwrap();
        assert_eq!(labels.source_kind, SourceKind::Import);
        assert_eq!(labels.source.as_str(), "Inst.root/sub");
    }

    let empty = cluster
        .targets_in_scope(&sub_scope, "subEmptyTargetListImp")
        .await
        .unwrap();
    assert!(empty.is_empty());
}

/// Deletion only completes after every item, the execution and the child
/// report deleted; a blocked descendant blocks the whole unit rather than
/// being skipped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_completes_bottom_up() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);

    let deployer_shutdown = CancellationToken::new();
    let deployer = ScriptedDeployer::new(cluster.clone(), "echo", DeployBehavior::Echo);
    deployer.spawn(deployer_shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new()
            .with_subs(vec![SubInstallationTemplate::new(
                "child",
                InstallationSpec::new(),
            )])
            .with_execution(ExecutionSpec::new(vec![
                DeployItemSpec::new("a", "echo"),
                DeployItemSpec::new("b", "echo"),
            ])),
    );
    create_and_request(&cluster, root).await;
    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);

    // Take the deployer away so item teardown cannot proceed.
    deployer_shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    jobs::request_installation_delete(&cluster, &InstallationId::new("root"), &RETRY)
        .await
        .unwrap()
        .expect("installation exists");

    // With no deployer the items stay on the deletion path, and nothing
    // above them is allowed to disappear.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let root_obj = cluster
        .installations
        .get(&InstallationId::new("root"))
        .await
        .unwrap()
        .expect("root must not be deleted while descendants exist");
    assert!(root_obj.status.work.phase.is_deletion());
    assert!(cluster
        .executions
        .get(&ExecutionId::new("root"))
        .await
        .unwrap()
        .is_some());
    assert_eq!(cluster.items_of(&ExecutionId::new("root")).await.unwrap().len(), 2);

    // Bring a deployer back; deletion drains bottom-up.
    let deployer = ScriptedDeployer::new(cluster.clone(), "echo", DeployBehavior::Echo);
    deployer.spawn(_engine.shutdown.clone());

    assert!(wait_for_installation_gone(&cluster, &InstallationId::new("root")).await);
    assert!(wait_for_installation_gone(&cluster, &InstallationId::new("root/child")).await);
    assert!(cluster
        .executions
        .get(&ExecutionId::new("root"))
        .await
        .unwrap()
        .is_none());
    assert!(cluster.items_of(&ExecutionId::new("root")).await.unwrap().is_empty());
}

/// If no deployer claims an item before the pickup deadline, the item is
/// force-failed with a pickup-timeout error and the failure aggregates
/// upward.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unclaimed_item_fails_with_pickup_timeout() {
    let cluster = Cluster::in_memory();
    let monitor = MonitorConfig::new()
        .with_scan_interval(Duration::from_millis(50))
        .with_pickup_timeout(Duration::from_millis(200));
    let _engine = start_engine_with(&cluster, monitor);
    // No deployer for this item type.

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "web", "nobody-home",
        )])),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Failed).await);

    let items = cluster.items_of(&ExecutionId::new("root")).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status.work.phase, Phase::Failed);
    assert_eq!(
        items[0].status.work.last_error.as_ref().unwrap().reason,
        ErrorReason::PickupTimeout
    );
    assert!(items[0].status.work.first_error.is_some());

    let exec = cluster
        .executions
        .get(&ExecutionId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status.work.phase, Phase::Failed);
    assert_eq!(
        exec.status.work.last_error.as_ref().unwrap().reason,
        ErrorReason::ChildFailed
    );
}

/// A failed item with retries left is re-dispatched under a derived token
/// and can still bring the cycle to success.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_item_is_retried_with_derived_token() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(cluster.clone(), "flaky", DeployBehavior::FailTimes(1));
    let claims = deployer.claims.clone();
    deployer.spawn(_engine.shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "web", "flaky",
        )
        .with_retries(1)])),
    );
    let job = create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);
    assert_eq!(claims.load(Ordering::SeqCst), 2);

    let items = cluster.items_of(&ExecutionId::new("root")).await.unwrap();
    let item_job = items[0].status.work.job_id.clone().unwrap();
    assert_eq!(item_job.derivation_attempt(&job), Some(1));
}

/// With `update_on_change_only`, an unchanged succeeded item is re-confirmed
/// without re-dispatching the deployer; a forced cycle takes precedence and
/// re-dispatches.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_item_short_circuits_unless_forced() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(cluster.clone(), "echo", DeployBehavior::Echo);
    let claims = deployer.claims.clone();
    deployer.spawn(_engine.shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "web", "echo",
        )
        .with_update_on_change_only()])),
    );
    create_and_request(&cluster, root).await;
    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);
    assert_eq!(claims.load(Ordering::SeqCst), 1);

    // Unforced re-reconcile: the unchanged item is re-confirmed in place.
    let second = jobs::request_installation(&cluster, &InstallationId::new("root"), false, &RETRY)
        .await
        .unwrap()
        .unwrap();
    assert!(wait_for_cycle_finished(&cluster, &InstallationId::new("root"), &second).await);
    assert_eq!(claims.load(Ordering::SeqCst), 1, "no re-dispatch");

    let items = cluster.items_of(&ExecutionId::new("root")).await.unwrap();
    assert_eq!(items[0].status.work.phase, Phase::Succeeded);
    assert!(items[0].status.work.job_id.as_ref().unwrap().is_derived_from(&second));

    // Forced re-reconcile takes precedence over the short circuit.
    let third = jobs::request_installation(&cluster, &InstallationId::new("root"), true, &RETRY)
        .await
        .unwrap()
        .unwrap();
    assert!(wait_for_cycle_finished(&cluster, &InstallationId::new("root"), &third).await);
    assert_eq!(claims.load(Ordering::SeqCst), 2, "forced cycle re-dispatches");
}

/// A cyclic sibling dependency is a permanent configuration error, reported
/// once on the owning unit.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_cycle_fails_the_unit() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);

    let a = InstallationSpec::new()
        .with_imports(vec![ImportDecl::data("y")])
        .with_exports(vec![ExportDecl::data("x", "x")]);
    let b = InstallationSpec::new()
        .with_imports(vec![ImportDecl::data("x")])
        .with_exports(vec![ExportDecl::data("y", "y")]);
    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_subs(vec![
            SubInstallationTemplate::new("a", a),
            SubInstallationTemplate::new("b", b),
        ]),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Failed).await);

    let inst = cluster
        .installations
        .get(&InstallationId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        inst.status.work.last_error.as_ref().unwrap().reason,
        ErrorReason::DependencyCycle
    );
    // The cycle is detected before expansion; no children were created.
    assert!(cluster.children_of(&InstallationId::new("root")).await.unwrap().is_empty());
}

/// Items with `depends_on` are claimed in dependency order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn item_dependencies_order_claims() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(cluster.clone(), "echo", DeployBehavior::Echo);
    let claim_log = deployer.claim_log.clone();
    deployer.spawn(_engine.shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![
            DeployItemSpec::new("second", "echo").with_depends_on(vec!["first".to_string()]),
            DeployItemSpec::new("first", "echo"),
        ])),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Succeeded).await);

    let log = claim_log.lock().unwrap().clone();
    assert_eq!(log, vec!["first".to_string(), "second".to_string()]);
}

/// A terminally failed item fails the execution, which fails the owning
/// unit, with the deployer's error passed through unchanged.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deployer_failure_propagates_upward() {
    let cluster = Cluster::in_memory();
    let _engine = start_engine(&cluster);
    let deployer = ScriptedDeployer::new(
        cluster.clone(),
        "boom",
        DeployBehavior::Fail("disk on fire".to_string()),
    );
    deployer.spawn(_engine.shutdown.clone());

    let root = Installation::root(
        InstallationId::new("root"),
        InstallationSpec::new().with_execution(ExecutionSpec::new(vec![DeployItemSpec::new(
            "web", "boom",
        )])),
    );
    create_and_request(&cluster, root).await;

    assert!(wait_for_installation_phase(&cluster, &InstallationId::new("root"), Phase::Failed).await);

    let items = cluster.items_of(&ExecutionId::new("root")).await.unwrap();
    let item_error = items[0].status.work.last_error.as_ref().unwrap();
    assert_eq!(item_error.reason, ErrorReason::DeployerFailure);
    assert_eq!(item_error.message, "disk on fire");

    let exec = cluster
        .executions
        .get(&ExecutionId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status.work.phase, Phase::Failed);
    assert!(exec
        .status
        .work
        .last_error
        .as_ref()
        .unwrap()
        .message
        .contains("disk on fire"));

    let inst = cluster
        .installations
        .get(&InstallationId::new("root"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        inst.status.work.last_error.as_ref().unwrap().reason,
        ErrorReason::ChildFailed
    );
}
