//! Session teardown ordering.

use std::sync::Arc;

use throwaway::config::Config;
use throwaway::lifecycle::NetworkRequest;
use throwaway::testing::FakeEngine;
use throwaway::wait::WaitContext;
use throwaway::{Provider, ResourceRequest, Session};

fn provider(engine: &Arc<FakeEngine>) -> Provider {
    let mut config = Config::default();
    config.reaper.disabled = true;
    Provider::with_session(engine.clone(), config, Arc::new(Session::new()))
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}

#[tokio::test]
async fn test_containers_are_removed_before_their_network() {
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(&engine);
    let ctx = WaitContext::default();

    let network = provider
        .create_network(NetworkRequest::new("backend"))
        .await
        .unwrap();
    let db = provider
        .run(&ctx, ResourceRequest::new("postgres").with_network("backend", &["db"]))
        .await
        .unwrap();
    let api = provider
        .run(&ctx, ResourceRequest::new("api").with_network("backend", &["api"]))
        .await
        .unwrap();
    assert_eq!(db.network_aliases().await.unwrap()["backend"], vec!["db"]);

    let failures = provider.teardown().await;
    assert!(failures.is_empty(), "{failures:?}");

    let calls = engine.calls();
    let remove_network = position(&calls, &format!("remove_network:{}", network.id));
    assert!(position(&calls, &format!("remove:{}", api.id())) < position(&calls, &format!("remove:{}", db.id())));
    assert!(position(&calls, &format!("remove:{}", db.id())) < remove_network);
    assert!(engine.container_ids().is_empty());
    assert!(engine.network_ids().is_empty());
    assert!(provider.session().tracked().is_empty());
}

#[tokio::test]
async fn test_teardown_reports_failures_and_keeps_going() {
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(&engine);
    let ctx = WaitContext::default();

    provider
        .create_network(NetworkRequest::new("backend"))
        .await
        .unwrap();
    let stuck = provider
        .run(&ctx, ResourceRequest::new("postgres").with_network("backend", &[]))
        .await
        .unwrap();
    let loose = provider.run(&ctx, ResourceRequest::new("redis")).await.unwrap();

    engine.fail("remove_container", "device busy");
    let failures = provider.teardown().await;
    engine.clear_failure("remove_container");

    let ids: Vec<&str> = failures.iter().map(|f| f.resource_id.as_str()).collect();
    assert!(ids.contains(&stuck.id()));
    assert!(ids.contains(&loose.id()));
    // The network is still attached to the stuck container.
    assert_eq!(failures.len(), 3);
    assert_eq!(engine.network_ids().len(), 1);
}

#[tokio::test]
async fn test_terminated_resources_are_not_torn_down_twice() {
    let engine = Arc::new(FakeEngine::new());
    let provider = provider(&engine);
    let ctx = WaitContext::default();

    let handle = provider.run(&ctx, ResourceRequest::new("redis")).await.unwrap();
    handle.terminate().await.unwrap();

    assert!(provider.teardown().await.is_empty());
    let removals = engine
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("remove:"))
        .count();
    assert_eq!(removals, 1);
}
