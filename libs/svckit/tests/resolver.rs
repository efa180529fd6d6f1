mod common;

use std::time::{Duration, Instant};

use common::*;
use serde_json::json;
use svckit::{AppConfigManager, ConfigNode, ConfigurationError, Object, ServiceState, SignalRef, SvcError};

/// `a` produces `x`, `b` consumes it; `b` is declared first.
fn producer_consumer() -> ConfigNode {
    ConfigNode::new("config")
        .child(deferred("x"))
        .child(service("b", "test::Recorder").child(binding("in", "src", "x")))
        .child(service("a", "test::Producer").child(binding("out", "out", "x")))
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_waits_for_its_producer() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));

    let report = manager.create(&producer_consumer()).await.unwrap();
    assert_eq!(report.built, vec!["a"]);
    assert_eq!(report.deferred, vec![("b".to_string(), vec!["x".to_string()])]);
    assert!(report.failures.is_empty());

    match manager.service("b") {
        Err(SvcError::UnresolvedDependency { service, missing }) => {
            assert_eq!(service, "b");
            assert_eq!(missing, vec!["x"]);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    manager.start().await.unwrap();

    let b = manager.service("b").unwrap();
    assert_eq!(b.state(), ServiceState::Started);
    assert!(position(&j, "a:start").unwrap() < position(&j, "b:start").unwrap());
    assert!(manager.deferred_services().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_producer_tears_down_consumer_first() {
    let j = journal();
    let app = app(&j);
    let manager = AppConfigManager::new(app.clone());
    manager.launch(&producer_consumer()).await.unwrap();

    manager.stop_service("a").await.unwrap();

    // `b` is gone before `a`'s stop returned.
    assert!(!app.services.contains("b"));
    assert!(!app.objects.contains("x"));
    assert_eq!(count(&j, "b:stop"), 1);
    assert!(matches!(
        manager.service("b"),
        Err(SvcError::UnresolvedDependency { .. })
    ));

    // Producing again re-creates the consumer.
    manager.start_service("a").await.unwrap();
    assert_eq!(manager.service("b").unwrap().state(), ServiceState::Started);
    assert_eq!(count(&j, "b:start"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn externally_provided_object_resolves_deferred_service() {
    let j = journal();
    let app = app(&j);
    let manager = AppConfigManager::new(app.clone());
    let tree = ConfigNode::new("config")
        .child(deferred("ext"))
        .child(service("c", "test::Recorder").child(binding("inout", "value", "ext")))
        .child(ConfigNode::new("update").attr("uid", "c"));

    let report = manager.launch(&tree).await.unwrap();
    assert!(report.built.is_empty());
    assert_eq!(count(&j, "c:start"), 0);

    let ext = Object::new("Data", json!(41));
    manager
        .add_existing_deferred_object("ext", ext.clone())
        .await
        .unwrap();

    // Built, started and updated once because it is on the update list.
    assert_eq!(count(&j, "c:start"), 1);
    assert_eq!(count(&j, "c:update"), 1);
    assert_eq!(ext.get(), json!(42));

    assert!(manager.remove_existing_deferred_object("ext").await.unwrap());
    assert_eq!(count(&j, "c:stop"), 1);
    assert_eq!(
        manager.deferred_services(),
        vec![("c".to_string(), vec!["ext".to_string()])]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn optional_binding_is_swapped_in_and_out() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(deferred("ext"))
        .child(
            service("d", "test::Recorder")
                .child(binding("in", "extra", "ext").attr("optional", "true")),
        );

    manager.launch(&tree).await.unwrap();
    assert_eq!(manager.service("d").unwrap().state(), ServiceState::Started);

    manager
        .add_existing_deferred_object("ext", Object::new("Data", json!(null)))
        .await
        .unwrap();
    assert_eq!(count(&j, "d:swap:extra:true"), 1);

    manager.remove_existing_deferred_object("ext").await.unwrap();
    assert_eq!(count(&j, "d:swap:extra:false"), 1);
    assert_eq!(manager.service("d").unwrap().state(), ServiceState::Started);
}

#[tokio::test(flavor = "multi_thread")]
async fn producer_cycle_fails_the_build() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(deferred("x"))
        .child(deferred("y"))
        .child(
            service("a", "test::Recorder")
                .child(binding("in", "src", "y"))
                .child(binding("out", "dst", "x")),
        )
        .child(
            service("b", "test::Recorder")
                .child(binding("in", "src", "x"))
                .child(binding("out", "dst", "y")),
        );

    match manager.create(&tree).await.unwrap_err() {
        SvcError::Configuration(ConfigurationError::DependencyCycle { remaining, path }) => {
            assert_eq!(remaining, 2);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(manager.phase(), ServiceState::Unconfigured);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_service_does_not_stop_its_siblings() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(object("cfg"))
        .child(service("broken", "test::Missing"))
        .child(service("eager", "test::EagerReader").child(binding("in", "in", "cfg")))
        .child(service("fine", "test::Recorder").child(binding("in", "in", "cfg")));

    let report = manager.create(&tree).await.unwrap();
    assert_eq!(report.built, vec!["fine"]);
    assert_eq!(report.failures.len(), 2);

    match &report.failures[0] {
        (uid, SvcError::Configuration(ConfigurationError::UnknownServiceType(t))) => {
            assert_eq!(uid, "broken");
            assert_eq!(t, "test::Missing");
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    match &report.failures[1] {
        (uid, SvcError::Hook { op, source, .. }) => {
            assert_eq!(uid, "eager");
            assert_eq!(*op, "configure");
            assert!(matches!(
                source.downcast_ref::<SvcError>(),
                Some(SvcError::LifecycleViolation { op: "read input", .. })
            ));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(manager.failed_services().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_list_runs_first_and_stop_reverses_it() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(service("one", "test::Recorder"))
        .child(service("two", "test::Recorder"))
        .child(service("three", "test::Recorder"))
        .child(ConfigNode::new("start").attr("uid", "three"));

    manager.launch(&tree).await.unwrap();
    manager.stop().await.unwrap();

    let order: Vec<String> = entries(&j)
        .into_iter()
        .filter(|e| e.ends_with(":start") || e.ends_with(":stop"))
        .collect();
    assert_eq!(
        order,
        vec![
            "three:start",
            "one:start",
            "two:start",
            "two:stop",
            "one:stop",
            "three:stop"
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_leaves_nothing_behind() {
    let j = journal();
    let app = app(&j);
    let manager = AppConfigManager::new(app.clone());
    let tree = producer_consumer().child(object("cfg"));

    manager.launch(&tree).await.unwrap();
    assert_eq!(app.services.len(), 2);

    manager.stop_and_destroy().await.unwrap();
    assert!(app.services.is_empty());
    assert!(app.objects.is_empty());
    assert_eq!(app.bus.channel_count(), 0);
    assert_eq!(manager.phase(), ServiceState::Destroyed);

    match manager.start().await.unwrap_err() {
        SvcError::LifecycleViolation { op, .. } => assert_eq!(op, "start"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_producer_is_rejected_at_create() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(deferred("x"))
        .child(service("p1", "test::Producer").child(binding("out", "out", "x")))
        .child(service("p2", "test::Producer").child(binding("out", "out", "x")));

    assert!(matches!(
        manager.create(&tree).await.unwrap_err(),
        SvcError::Configuration(ConfigurationError::DuplicateProducer { .. })
    ));
}

async fn wait_for(j: &Journal, entry: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while count(j, entry) == 0 {
        assert!(Instant::now() < deadline, "never saw {entry}: {:?}", entries(j));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_published_from_concurrent_slots_resolve_without_stalling() {
    let j = journal();
    let app = app(&j);
    let manager = AppConfigManager::new(app.clone());
    let tree = ConfigNode::new("config")
        .child(object("trig"))
        .child(deferred("x"))
        .child(deferred("y"))
        .child(service("p1", "test::Publisher").child(binding("out", "out", "x")))
        .child(
            service("c", "test::SlowStart")
                .child(binding("in", "src", "x"))
                .child(ConfigNode::new("config").attr("delay_ms", "150")),
        )
        .child(
            service("p2", "test::Publisher")
                .child(binding("out", "out", "y"))
                .child(binding("in", "src", "x").attr("optional", "true"))
                .child(ConfigNode::new("config").attr("delay_ms", "30")),
        )
        .child(connect("go", &["trig/modified"], &["p1/go", "p2/go"]));
    manager.launch(&tree).await.unwrap();
    assert_eq!(manager.deferred_services(), vec![("c".to_string(), vec!["x".to_string()])]);

    let pending = app
        .bus
        .async_emit(&SignalRef::modified("trig"), Vec::new())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), pending.join())
        .await
        .expect("slots finished")
        .unwrap();
    assert_eq!(count(&j, "p1:published"), 1);
    assert_eq!(count(&j, "p2:published"), 1);

    // Resolution catches up once the slots returned.
    wait_for(&j, "c:start").await;
    wait_for(&j, "p2:swap:src:true").await;
    assert_eq!(manager.service("c").unwrap().state(), ServiceState::Started);
    assert!(app.objects.contains("y"));

    tokio::time::timeout(Duration::from_secs(3), manager.stop_and_destroy())
        .await
        .expect("teardown finished")
        .unwrap();
    assert!(app.services.is_empty());
}

/// `a` produces `x`, `b` turns it into `y`, `c` consumes `y`.
fn relay(reversed: bool) -> ConfigNode {
    let mut services = vec![
        service("a", "test::Producer").child(binding("out", "out", "x")),
        service("b", "test::Producer")
            .child(binding("in", "src", "x"))
            .child(binding("out", "out", "y")),
        service("c", "test::Recorder").child(binding("in", "src", "y")),
    ];
    if reversed {
        services.reverse();
    }
    services
        .into_iter()
        .fold(ConfigNode::new("config").child(deferred("x")).child(deferred("y")), |tree, s| {
            tree.child(s)
        })
}

#[tokio::test(flavor = "multi_thread")]
async fn declaration_order_does_not_change_the_result() {
    let mut outcomes = Vec::new();
    for reversed in [false, true] {
        let j = journal();
        let app = app(&j);
        let manager = AppConfigManager::new(app.clone());
        manager.launch(&relay(reversed)).await.unwrap();

        assert!(manager.deferred_services().is_empty());
        for uid in ["a", "b", "c"] {
            assert_eq!(manager.service(uid).unwrap().state(), ServiceState::Started);
        }
        let starts: Vec<String> = entries(&j)
            .into_iter()
            .filter(|e| e.ends_with(":start"))
            .collect();
        let producers = (app.objects.producer_of("x"), app.objects.producer_of("y"));
        outcomes.push((starts, producers));

        manager.stop().await.unwrap();
        let stops: Vec<String> = entries(&j)
            .into_iter()
            .filter(|e| e.ends_with(":stop"))
            .collect();
        assert_eq!(stops, vec!["c:stop", "b:stop", "a:stop"]);
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, vec!["a:start", "b:start", "c:start"]);
    assert_eq!(
        outcomes[0].1,
        (Some("a".to_string()), Some("b".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_start_does_not_abort_the_composition() {
    let j = journal();
    let manager = AppConfigManager::new(app(&j));
    let tree = ConfigNode::new("config")
        .child(service("first", "test::Recorder"))
        .child(service("refuser", "test::Failing"))
        .child(service("last", "test::Recorder"));

    manager.launch(&tree).await.unwrap();

    assert_eq!(manager.phase(), ServiceState::Started);
    assert_eq!(manager.service("first").unwrap().state(), ServiceState::Started);
    assert_eq!(manager.service("last").unwrap().state(), ServiceState::Started);
    assert_eq!(manager.service("refuser").unwrap().state(), ServiceState::Configured);

    // Stopping skips the service that never ran.
    manager.stop().await.unwrap();
    assert_eq!(count(&j, "first:stop"), 1);
    assert_eq!(count(&j, "last:stop"), 1);
}
