#![cfg(feature = "http")]

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use infernum_client::{
    Callbacks, ClientConfig, ClientError, HttpBackend, ImageFormat, InferenceBackend,
    InferenceEvent, QueryInput, RawImage, SlotKind, SlotState,
};
use serde_json::{Value, json};
use std::{
    sync::{Arc, Mutex, OnceLock, Weak, mpsc},
    thread,
    time::Duration,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn post_query(Json(payload): Json<Value>) -> (StatusCode, Json<Value>) {
    if payload.get("fail").is_some() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "model crashed"})),
        );
    }
    // echo back which keys arrived and the decoded size of any image
    let image_bytes = payload
        .get("img")
        .and_then(Value::as_str)
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .map(|bytes| bytes.len());
    (
        StatusCode::OK,
        Json(json!({
            "class": "cat",
            "confidence": 0.97,
            "keys": payload.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()),
            "image_bytes": image_bytes,
        })),
    )
}

/// Starts a mock inference service on an ephemeral port and returns the port.
fn spawn_service() -> u16 {
    let (port_tx, port_rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let app = Router::new()
                .route("/info", get(|| async { Json(json!({"model": "mock"})) }))
                .route("/query", post(post_query));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            port_tx.send(listener.local_addr().unwrap().port()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    port_rx.recv_timeout(TIMEOUT).unwrap()
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn event_channel() -> (Callbacks, mpsc::Receiver<InferenceEvent>) {
    let (tx, rx) = mpsc::channel();
    let (info_tx, data_tx, error_tx) = (tx.clone(), tx.clone(), tx);
    let callbacks = Callbacks::new()
        .on_info(move |info| {
            let _ = info_tx.send(InferenceEvent::Info(info.clone()));
            Ok(())
        })
        .on_data(move |data| {
            let _ = data_tx.send(InferenceEvent::Data(data.clone()));
            Ok(())
        })
        .on_error(move |message| {
            let _ = error_tx.send(InferenceEvent::Error(message.to_string()));
            Ok(())
        });
    (callbacks, rx)
}

#[test]
fn info_then_data_are_dispatched() {
    init_logger();
    let port = spawn_service();
    let (callbacks, events) = event_channel();
    let backend = HttpBackend::new(&ClientConfig::new(port), callbacks).unwrap();

    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap(),
        InferenceEvent::Info(json!({"model": "mock"}))
    );

    backend.query_json(&json!({"caption": "a cat"}));
    let InferenceEvent::Data(data) = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected a data event");
    };
    assert_eq!(data["class"], "cat");
    assert_eq!(data["keys"], json!(["caption"]));
}

#[test]
fn png_image_is_sent_under_requested_key() {
    init_logger();
    let port = spawn_service();
    let (callbacks, events) = event_channel();
    let config = ClientConfig::new(port).with_fetch_info(false);
    let backend = HttpBackend::new(&config, callbacks).unwrap();

    let pixels = vec![128u8; 8 * 8 * 3];
    backend.query(QueryInput::ImageWithEncoding {
        image: RawImage::rgb(&pixels, 8, 8),
        format: ImageFormat::Png,
        key: "img",
    });

    let InferenceEvent::Data(data) = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected a data event");
    };
    assert_eq!(data["keys"], json!(["img"]));
    assert!(data["image_bytes"].as_u64().unwrap() > 0);
}

#[test]
fn service_failure_becomes_error_event() {
    init_logger();
    let port = spawn_service();
    let (callbacks, events) = event_channel();
    let config = ClientConfig::new(port).with_fetch_info(false);
    let backend = HttpBackend::new(&config, callbacks).unwrap();

    backend.query_json(&json!({"fail": true}));
    let InferenceEvent::Error(message) = events.recv_timeout(TIMEOUT).unwrap() else {
        panic!("expected an error event");
    };
    assert!(message.contains("500"), "{message}");
}

#[test]
fn bad_pixel_buffer_becomes_error_event() {
    init_logger();
    let port = spawn_service();
    let (callbacks, events) = event_channel();
    let config = ClientConfig::new(port).with_fetch_info(false);
    let backend = HttpBackend::new(&config, callbacks).unwrap();

    let pixels = vec![0u8; 5];
    backend.query_image(&RawImage::rgb(&pixels, 8, 8));
    assert!(matches!(
        events.recv_timeout(TIMEOUT).unwrap(),
        InferenceEvent::Error(_)
    ));
}

#[test]
fn unreachable_service_reports_through_error_callback() {
    init_logger();
    let (callbacks, events) = event_channel();
    let _backend = HttpBackend::new(&ClientConfig::new(refused_port()), callbacks).unwrap();

    assert!(matches!(
        events.recv_timeout(TIMEOUT).unwrap(),
        InferenceEvent::Error(_)
    ));
}

#[test]
fn failing_data_callback_is_disabled_once() {
    init_logger();
    let port = spawn_service();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let callbacks = Callbacks::new().on_data(move |_| {
        *counter.lock().unwrap() += 1;
        Err("sketch is not ready".into())
    });
    let config = ClientConfig::new(port).with_fetch_info(false);
    let mut backend = HttpBackend::new(&config, callbacks).unwrap();

    backend.query_json(&json!({"n": 1}));
    backend.query_json(&json!({"n": 2}));
    let bridge = backend.bridge().clone();
    // stop joins the worker, so both responses have been dispatched
    backend.stop();

    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(bridge.registry().state(SlotKind::Data), SlotState::Disabled);
}

#[test]
fn blocking_query_returns_the_response() {
    init_logger();
    let port = spawn_service();
    let config = ClientConfig::new(port).with_fetch_info(false);
    let mut backend = HttpBackend::new(&config, Callbacks::new()).unwrap();

    let data = backend.query_blocking(&json!({"caption": "a dog"})).unwrap();
    assert_eq!(data["confidence"], json!(0.97));

    let err = backend.query_blocking(&json!({"fail": true})).unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 500, .. }));

    backend.stop();
    assert!(matches!(
        backend.query_blocking(&json!({})),
        Err(ClientError::Stopped)
    ));
}

fn refused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn blocking_query_from_callback_fails_instead_of_hanging() {
    init_logger();
    let handle: Arc<OnceLock<Weak<HttpBackend>>> = Arc::new(OnceLock::new());
    let (outcome_tx, outcomes) = mpsc::channel();

    let callbacks = Callbacks::new().on_error({
        let handle = handle.clone();
        move |_| {
            if let Some(backend) = handle.get().and_then(Weak::upgrade) {
                let _ = outcome_tx.send(backend.query_blocking(&json!({})));
            }
            Ok(())
        }
    });
    let config = ClientConfig::new(refused_port()).with_fetch_info(false);
    let backend = Arc::new(HttpBackend::new(&config, callbacks).unwrap());
    let _ = handle.set(Arc::downgrade(&backend));

    backend.query_json(&json!({"n": 1}));
    assert!(matches!(
        outcomes.recv_timeout(TIMEOUT).unwrap(),
        Err(ClientError::Reentrant)
    ));

    // the worker is still serving queries afterwards
    backend.query_json(&json!({"n": 2}));
    assert!(matches!(
        outcomes.recv_timeout(TIMEOUT).unwrap(),
        Err(ClientError::Reentrant)
    ));
    assert_eq!(
        backend.bridge().registry().state(SlotKind::Error),
        SlotState::Active
    );
}

#[test]
fn dropping_backend_from_callback_does_not_hang() {
    init_logger();
    let slot: Arc<Mutex<Option<HttpBackend>>> = Arc::new(Mutex::new(None));
    let (done_tx, done) = mpsc::channel();

    let callbacks = Callbacks::new().on_error({
        let slot = slot.clone();
        move |_| {
            let backend = slot.lock().unwrap().take();
            drop(backend);
            let _ = done_tx.send(());
            Ok(())
        }
    });
    let config = ClientConfig::new(refused_port()).with_fetch_info(false);
    *slot.lock().unwrap() = Some(HttpBackend::new(&config, callbacks).unwrap());

    if let Some(backend) = slot.lock().unwrap().as_ref() {
        backend.query_json(&json!({}));
    }
    done.recv_timeout(TIMEOUT).unwrap();
    assert!(slot.lock().unwrap().is_none());
}
