//! Backend routing and hot-swapping.

mod common;

use std::{sync::Arc, time::Duration};

use common::mocks::{kinds, recorder, wait_for, MockResponse, MockServer, ScriptedRuntime};
use ember_core::{
    collab::{self, MemorySettings, SettingsStore, StaticCredentials},
    BackendKind, BackendRouter, EngineError, EngineEvent, EngineFactory, EngineStatus,
    GenerateOptions, ModelRef, Turn,
};
use serde_json::json;

fn turns() -> Vec<Turn> {
    vec![Turn::user("Hello?")]
}

fn router(runtime: &Arc<ScriptedRuntime>, server: Option<&MockServer>) -> BackendRouter {
    let settings = MemorySettings::new();
    if let Some(server) = server {
        settings.set(collab::LOCAL_SERVER_URL, &server.url()).unwrap();
    }
    let factory = EngineFactory::new(Arc::new(StaticCredentials::new()), Arc::new(settings))
        .with_accelerator(runtime.clone());
    BackendRouter::new(factory)
}

async fn local_server() -> MockServer {
    MockServer::start(vec![
        (
            "GET",
            "/v1/models",
            MockResponse::Json(200, json!({ "data": [{ "id": "qwen3" }] })),
        ),
        (
            "POST",
            "/v1/chat/completions",
            MockResponse::Sse(vec![
                json!({ "choices": [{ "delta": { "content": "<think>ok</think>From the server" } }] })
                    .to_string(),
                "[DONE]".into(),
            ]),
        ),
    ])
    .await
}

#[tokio::test]
async fn test_no_active_backend() {
    let runtime = Arc::new(ScriptedRuntime::new(["Hi"]));
    let router = router(&runtime, None);

    assert!(router.active().is_none());
    assert_eq!(
        router.generate(turns(), GenerateOptions::default()),
        Err(EngineError::NoActiveBackend)
    );
    assert_eq!(
        router.generate_full(turns(), GenerateOptions::default()).await,
        Err(EngineError::NoActiveBackend)
    );
    assert_eq!(router.interrupt(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.reset(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.check(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.status(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.is_ready(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.model_id(), Err(EngineError::NoActiveBackend));
    assert_eq!(router.backend(), Err(EngineError::NoActiveBackend));

    // terminating with nothing active is harmless
    router.terminate().await;
}

#[tokio::test]
async fn test_swap_keeps_subscribers() {
    let runtime = Arc::new(ScriptedRuntime::new(["<think>", "</think>", "On", " device"]));
    let server = local_server().await;
    let router = router(&runtime, Some(&server));

    let (listener, seen) = recorder();
    let id = router.on_message(listener);

    router
        .load_model(&ModelRef::accelerator("rwkv7-g1"))
        .await
        .unwrap();
    assert_eq!(router.backend(), Ok(BackendKind::Accelerator));
    let result = router
        .generate_full(turns(), GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(result.text, "On device");

    router
        .load_model(&ModelRef::local_server("qwen3"))
        .await
        .unwrap();
    assert_eq!(router.backend(), Ok(BackendKind::LocalServer));
    assert_eq!(router.model_id(), Ok(Some("qwen3".into())));
    // the accelerator was torn down and its model released
    assert_eq!(runtime.releases(), 1);

    seen.lock().unwrap().clear();
    router.generate(turns(), GenerateOptions::default()).unwrap();
    let events = wait_for(&seen, "complete").await;
    assert_eq!(
        kinds(&events),
        vec!["start", "phase", "thinkingDone", "phase", "update", "complete"]
    );
    assert!(matches!(
        &events[4],
        EngineEvent::Update { output, .. } if output == "From the server"
    ));

    // the same id unsubscribes from the new engine
    assert!(router.off_message(id));
    assert_eq!(router.listener_count(), 0);
    assert!(router.active().unwrap().listeners().is_empty());

    router.terminate().await;
}

#[tokio::test]
async fn test_same_backend_reuses_engine() {
    let runtime = Arc::new(ScriptedRuntime::new(["Hi"]));
    let router = router(&runtime, None);

    router.load_model(&ModelRef::accelerator("first")).await.unwrap();
    let engine = router.active().unwrap();
    router.load_model(&ModelRef::accelerator("second")).await.unwrap();

    assert!(Arc::ptr_eq(&engine, &router.active().unwrap()));
    assert_eq!(runtime.loads(), vec!["first", "second"]);
    assert_eq!(runtime.releases(), 1);
    assert_eq!(router.status(), Ok(EngineStatus::Ready));

    router.terminate().await;
    assert!(router.active().is_none());
    assert_eq!(runtime.releases(), 2);
}

#[tokio::test]
async fn test_generate_full_leaves_no_listeners() {
    let runtime = Arc::new(ScriptedRuntime::new(["Hi", " there", "!", " Bye"]));
    let router = router(&runtime, None);
    let (listener, _seen) = recorder();
    router.on_message(listener);
    router.load_model(&ModelRef::accelerator("rwkv7-g1")).await.unwrap();

    let engine = router.active().unwrap();
    let baseline = engine.listeners().len();
    assert_eq!(baseline, 1);

    for round in 0..6 {
        let failing = round % 2 == 1;
        runtime.set_failing(failing);
        let result = router.generate_full(turns(), GenerateOptions::default()).await;
        match failing {
            true => assert!(matches!(result, Err(EngineError::Generation(_)))),
            false => assert_eq!(result.unwrap().text, "Hi there! Bye"),
        }
        assert_eq!(router.status(), Ok(EngineStatus::Ready));
    }

    // rejected before any event arrives
    router.generate(turns(), GenerateOptions::default()).unwrap();
    assert_eq!(
        router.generate_full(turns(), GenerateOptions::default()).await,
        Err(EngineError::NotReady(EngineStatus::Generating))
    );

    assert_eq!(engine.listeners().len(), baseline);
    assert_eq!(router.listener_count(), 1);

    router.terminate().await;
}

#[tokio::test]
async fn test_swap_mid_session_ends_it_once() {
    let pieces: Vec<String> = (0..500).map(|n| format!("w{n} ")).collect();
    let runtime = Arc::new(ScriptedRuntime::new(pieces).with_delay(Duration::from_millis(5)));
    let server = local_server().await;
    let router = router(&runtime, Some(&server));
    let (listener, seen) = recorder();
    router.on_message(listener);

    router.load_model(&ModelRef::accelerator("rwkv7-g1")).await.unwrap();
    router.generate(turns(), GenerateOptions::default()).unwrap();
    wait_for(&seen, "update").await;

    router
        .load_model(&ModelRef::local_server("qwen3"))
        .await
        .unwrap();

    let events = seen.lock().unwrap().clone();
    let start = events.iter().position(|event| event.kind() == "start").unwrap();
    let session: Vec<_> = events[start..]
        .iter()
        .take_while(|event| !matches!(event, EngineEvent::Loading { .. } | EngineEvent::Ready))
        .collect();
    let terminal = session
        .iter()
        .filter(|event| matches!(event, EngineEvent::Complete { .. } | EngineEvent::Error { .. }))
        .count();
    assert_eq!(terminal, 1);
    assert!(matches!(
        session.last(),
        Some(EngineEvent::Complete { .. } | EngineEvent::Error { .. })
    ));
    assert_eq!(router.status(), Ok(EngineStatus::Ready));

    router.terminate().await;
    router.terminate().await;
}

#[tokio::test]
async fn test_unavailable_backend() {
    let factory = EngineFactory::new(
        Arc::new(StaticCredentials::new()),
        Arc::new(MemorySettings::new()),
    );
    let router = BackendRouter::new(factory);
    assert!(matches!(
        router.load_model(&ModelRef::accelerator("rwkv7-g1")).await,
        Err(EngineError::Capability(_))
    ));
    assert!(router.active().is_none());
}
