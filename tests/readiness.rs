//! Readiness scenarios against real sockets and the in-memory engine.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::time::Instant;

use throwaway::config::{Config, WaitDefaults};
use throwaway::engine::ContainerPort;
use throwaway::lifecycle::{LifecycleHooks, resource_hook};
use throwaway::testing::FakeEngine;
use throwaway::wait::{HttpStrategy, LogStrategy, Target, WaitContext, WaitError, WaitSpec};
use throwaway::{Provider, ResourceRequest, Session, wait_until_ready};

async fn health(State(started): State<Instant>) -> StatusCode {
    if started.elapsed() < Duration::from_secs(2) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Serve `/health`, answering 503 for the first two seconds.
async fn slow_service() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/health", get(health))
        .with_state(Instant::now());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn provider(engine: &Arc<FakeEngine>) -> Provider {
    let mut config = Config::default();
    config.reaper.disabled = true;
    Provider::with_session(engine.clone(), config, Arc::new(Session::new()))
}

#[tokio::test]
async fn test_http_ready_once_service_answers_200() {
    let port = slow_service().await;
    let engine = Arc::new(FakeEngine::new());
    let id = engine.add_running("web");
    engine.map_port(&id, ContainerPort::tcp(80), port);

    let spec: WaitSpec = HttpStrategy::new("/health")
        .with_port(ContainerPort::tcp(80))
        .with_poll_interval(Duration::from_millis(200))
        .with_startup_timeout(Duration::from_secs(10))
        .into();

    let start = Instant::now();
    wait_until_ready(
        &WaitContext::default(),
        &Target::new(engine.clone(), id),
        &spec,
        &WaitDefaults::default(),
    )
    .await
    .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1800), "ready too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "ready too late: {elapsed:?}");
}

#[tokio::test]
async fn test_http_times_out_with_last_status() {
    let port = slow_service().await;
    let engine = Arc::new(FakeEngine::new());
    let id = engine.add_running("web");
    engine.map_port(&id, ContainerPort::tcp(80), port);

    let spec: WaitSpec = HttpStrategy::new("/health")
        .with_port(ContainerPort::tcp(80))
        .with_poll_interval(Duration::from_millis(100))
        .with_startup_timeout(Duration::from_millis(500))
        .into();

    let err = wait_until_ready(
        &WaitContext::default(),
        &Target::new(engine.clone(), id),
        &spec,
        &WaitDefaults::default(),
    )
    .await
    .unwrap_err();

    match err {
        WaitError::Timeout { last_error, .. } => {
            let last_error = last_error.unwrap();
            assert!(last_error.contains("503"), "{last_error}");
        }
        other => panic!("expected timeout, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_waits_for_second_log_occurrence() {
    let engine = Arc::new(FakeEngine::new());
    let emitter = engine.clone();
    // Output starts once the container is started.
    let hooks = LifecycleHooks::builder()
        .post_start(resource_hook(move |_, handle| {
            let engine = emitter.clone();
            let id = handle.id().to_string();
            Box::pin(async move {
                engine.emit_log_after(&id, Duration::from_secs(1), "database system is ready\n");
                engine.emit_log_after(&id, Duration::from_secs(2), "restarting\n");
                engine.emit_log_after(&id, Duration::from_secs(4), "database system is ready\n");
                Ok(())
            })
        }))
        .build();

    let request = ResourceRequest::new("postgres:16")
        .with_hooks(hooks)
        .with_wait(LogStrategy::new("database system is ready").with_occurrence(2));

    let start = Instant::now();
    let handle = provider(&engine)
        .run(&WaitContext::default(), request)
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(4));
    assert!(handle.logs().await.unwrap().contains("restarting"));
    handle.terminate().await.unwrap();
    assert!(engine.container_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_all_names_the_leaf_that_never_became_ready() {
    let engine = Arc::new(FakeEngine::new());
    let id = engine.add_running("app");
    engine.emit_log(&id, "listening\n");

    let spec = WaitSpec::all([
        WaitSpec::for_log("listening"),
        LogStrategy::new("never printed")
            .with_startup_timeout(Duration::from_secs(3))
            .into(),
    ]);

    let err = wait_until_ready(
        &WaitContext::default(),
        &Target::new(engine.clone(), id),
        &spec,
        &WaitDefaults::default(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.failed_strategies().len(), 1);
    assert!(err.failed_strategies()[0].contains("never printed"));
}

#[cfg(feature = "postgres")]
#[tokio::test]
async fn test_sql_refused_connection_is_retried_until_timeout() {
    use throwaway::wait::SqlStrategy;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed_port = listener.local_addr().unwrap().port();
    drop(listener);

    let engine = Arc::new(FakeEngine::new());
    let id = engine.add_running("db");
    engine.map_port(&id, ContainerPort::tcp(5432), closed_port);

    let spec: WaitSpec = SqlStrategy::new(ContainerPort::tcp(5432), |host, port| {
        format!("host={host} port={port} user=postgres connect_timeout=1")
    })
    .with_poll_interval(Duration::from_millis(100))
    .with_startup_timeout(Duration::from_secs(1))
    .into();

    let err = wait_until_ready(
        &WaitContext::default(),
        &Target::new(engine.clone(), id),
        &spec,
        &WaitDefaults::default(),
    )
    .await
    .unwrap_err();

    match err {
        WaitError::Timeout { last_error, .. } => assert!(last_error.is_some()),
        other => panic!("refused connection must not be fatal, got {other}"),
    }
}
