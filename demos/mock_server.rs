use argh::FromArgs;
use axum::{
    Json, Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};

mod messages;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Stand-in inference service answering every query with a fixed classification.
struct MockServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,
}

async fn get_info() -> impl IntoResponse {
    Json(messages::InfoResponse {
        model: "mock-classifier".to_string(),
        inputs: vec!["image".to_string()],
        outputs: vec!["class".to_string(), "confidence".to_string()],
    })
}

async fn post_query(Json(payload): Json<Value>) -> impl IntoResponse {
    let Some(object) = payload.as_object() else {
        log::debug!("Rejecting a query that is not a JSON object");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "query must be a JSON object" })),
        );
    };

    log::info!("Answering a query with keys {:?}", object.keys());

    let response = messages::QueryResponse {
        class: "cat".to_string(),
        confidence: 0.97,
        received_keys: object.keys().cloned().collect(),
    };
    (StatusCode::OK, Json(json!(response)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: MockServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let app = Router::new()
        .route("/info", get(get_info))
        .route("/query", post(post_query));

    log::info!("Starting the mock inference service");
    log::info!("Listening on: {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
