mod common;

use common::*;
use serde_json::json;
use svckit::{
    AppContext, BindingDecl, ConfigurationError, Object, ServiceDecl, ServiceHandle, ServiceState,
    SvcError,
};

use std::sync::Arc;

async fn build(app: &Arc<AppContext>, uid: &str, type_name: &str, bindings: Vec<BindingDecl>) -> Arc<ServiceHandle> {
    let mut decl = ServiceDecl::new(uid, type_name);
    decl.bindings = bindings;
    ServiceHandle::build(app, &decl, None).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn state_machine_rejects_out_of_order_calls() {
    let j = journal();
    let app = app(&j);
    let s = build(&app, "s", "test::Recorder", Vec::new()).await;
    assert_eq!(s.state(), ServiceState::Configured);

    match s.update().await.unwrap_err() {
        SvcError::LifecycleViolation { service, op, state } => {
            assert_eq!(service, "s");
            assert_eq!(op, "update");
            assert_eq!(state, ServiceState::Configured);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    s.start().await.unwrap();
    assert!(matches!(
        s.start().await.unwrap_err(),
        SvcError::LifecycleViolation { op: "start", .. }
    ));
    assert!(matches!(
        s.destroy().await.unwrap_err(),
        SvcError::LifecycleViolation { op: "destroy", .. }
    ));

    s.update().await.unwrap();
    s.stop().await.unwrap();
    assert_eq!(s.state(), ServiceState::Stopped);

    // Stopped behaves like configured: it can start again.
    s.start().await.unwrap();
    s.stop().await.unwrap();
    s.destroy().await.unwrap();
    assert_eq!(s.state(), ServiceState::Destroyed);
    assert!(!app.services.contains("s"));

    // The uid is free again.
    let again = build(&app, "s", "test::Recorder", Vec::new()).await;
    assert_eq!(again.state(), ServiceState::Configured);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_without_mandatory_object_is_unresolved() {
    let j = journal();
    let app = app(&j);
    let s = build(&app, "s", "test::Recorder", vec![BindingDecl::input("src", "ghost")]).await;

    match s.start().await.unwrap_err() {
        SvcError::UnresolvedDependency { service, missing } => {
            assert_eq!(service, "s");
            assert_eq!(missing, vec!["ghost"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(s.state(), ServiceState::Configured);
    assert_eq!(count(&j, "s:start"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_are_held_while_started() {
    let j = journal();
    let app = app(&j);
    app.objects
        .publish("v", Object::new("Data", json!(1)), "host")
        .await
        .unwrap();
    let s = build(&app, "s", "test::Recorder", vec![BindingDecl::inout("value", "v")]).await;

    s.start().await.unwrap();
    assert_eq!(app.objects.holders("v"), vec!["host", "s"]);

    s.update().await.unwrap();
    assert_eq!(app.objects.get("v").unwrap().get(), json!(2));

    s.stop().await.unwrap();
    assert_eq!(app.objects.holders("v"), vec!["host"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_start_keeps_the_last_valid_state() {
    let j = journal();
    let app = app(&j);
    let s = build(&app, "f", "test::Failing", Vec::new()).await;

    match s.start().await.unwrap_err() {
        SvcError::Hook { service, op, source } => {
            assert_eq!(service, "f");
            assert_eq!(op, "start");
            assert!(source.to_string().contains("refusing to start"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(s.state(), ServiceState::Configured);
}

#[tokio::test(flavor = "multi_thread")]
async fn binding_shape_is_checked_on_configure() {
    let j = journal();
    let app = app(&j);

    let mut decl = ServiceDecl::new("strict", "test::Strict");
    match ServiceHandle::build(&app, &decl, None).await.unwrap_err() {
        SvcError::Configuration(ConfigurationError::MissingKey { service, key }) => {
            assert_eq!(service, "strict");
            assert_eq!(key, "in");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!app.services.contains("strict"));

    decl.bindings = vec![BindingDecl::output("in", "x")];
    assert!(matches!(
        ServiceHandle::build(&app, &decl, None).await.unwrap_err(),
        SvcError::Configuration(ConfigurationError::AccessMismatch { .. })
    ));

    decl.bindings = vec![BindingDecl::input("in", "x"), BindingDecl::input("extra", "y")];
    assert!(matches!(
        ServiceHandle::build(&app, &decl, None).await.unwrap_err(),
        SvcError::Configuration(ConfigurationError::UnexpectedKey { .. })
    ));

    decl.bindings = vec![BindingDecl::input("in", "x").at(0), BindingDecl::input("in", "y").at(1)];
    assert!(matches!(
        ServiceHandle::build(&app, &decl, None).await.unwrap_err(),
        SvcError::Configuration(ConfigurationError::GroupSize { count: 2, .. })
    ));

    decl.bindings = vec![BindingDecl::input("in", "x")];
    ServiceHandle::build(&app, &decl, None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_services_follow_their_owner() {
    let j = journal();
    let app = app(&j);
    let parent = build(&app, "p", "test::Parent", Vec::new()).await;

    parent.start().await.unwrap();
    let subs = parent.sub_services();
    assert_eq!(subs.len(), 2);
    assert!(subs.iter().all(|s| s.state() == ServiceState::Started));
    assert_eq!(subs[0].owner(), Some("p"));

    parent.stop().await.unwrap();
    assert!(position(&j, "p.sub2:stop").unwrap() < position(&j, "p.sub1:stop").unwrap());

    parent.destroy().await.unwrap();
    assert!(!app.services.contains("p.sub1"));
    assert!(!app.services.contains("p.sub2"));
    assert!(app.services.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn services_sharing_a_worker_are_serialized() {
    let j = journal();
    let app = app(&j);
    let mut handles = Vec::new();
    for uid in ["s1", "s2"] {
        let mut decl = ServiceDecl::new(uid, "test::Sleepy");
        decl.worker = Some("shared".into());
        decl.config = svckit::ConfigNode::new("config").attr("delay_ms", "30");
        let h = ServiceHandle::build(&app, &decl, None).await.unwrap();
        h.start().await.unwrap();
        handles.push(h);
    }
    assert!(Arc::ptr_eq(handles[0].worker(), handles[1].worker()));

    let (a, b) = tokio::join!(handles[0].update(), handles[1].update());
    a.unwrap();
    b.unwrap();

    let log = entries(&j);
    let begins: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, e)| e.ends_with(":begin"))
        .map(|(i, _)| i)
        .collect();
    // Each begin is directly followed by its own end.
    for i in begins {
        let uid = log[i].trim_end_matches(":begin");
        assert_eq!(log[i + 1], format!("{uid}:end"));
    }
}
