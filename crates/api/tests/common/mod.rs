#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use folio_api::config::ServerConfig;
use folio_api::fanout::EventForwarder;
use folio_api::router::build_app_router;
use folio_api::state::AppState;
use folio_api::ws::WsManager;
use folio_core::backoff::BackoffPolicy;
use folio_core::job::EnqueueOptions;
use folio_db::{MemoryJobQueue, MemoryProgressStore, ProgressTracker, QueueConfig};
use folio_events::EventBus;
use folio_pipeline::{GenerationError, GenerationOutput, Generator, ProgressReporter};
use folio_worker::{JobService, PoolConfig, QueueSettings, WorkerPool};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Progress entries written by the test app live this long.
pub const TEST_PROGRESS_TTL: Duration = Duration::from_secs(60);

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        database_url: String::new(),
        queue: QueueSettings::default(),
    }
}

// ---------------------------------------------------------------------------
// App assembly
// ---------------------------------------------------------------------------

/// The job service, its bus and the WebSocket manager, all in memory.
pub struct TestApp {
    pub jobs: Arc<JobService>,
    pub bus: Arc<EventBus>,
    pub ws_manager: Arc<WsManager>,
}

impl TestApp {
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::default());
        let queue = Arc::new(MemoryJobQueue::new(QueueConfig {
            backoff: BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(40)),
            max_stalls: 1,
        }));
        let jobs = Arc::new(JobService::new(
            queue,
            ProgressTracker::new(Arc::new(MemoryProgressStore::new()), TEST_PROGRESS_TTL),
            bus.clone(),
            EnqueueOptions::default(),
        ));
        Self {
            jobs,
            bus,
            ws_manager: Arc::new(WsManager::new()),
        }
    }

    pub fn router(&self) -> Router {
        let config = test_config();
        let state = AppState {
            config: Arc::new(config.clone()),
            ws_manager: self.ws_manager.clone(),
            jobs: self.jobs.clone(),
        };
        build_app_router(state, &config)
    }

    /// Serve on an ephemeral port with the event forwarder attached.
    pub async fn serve(&self, cancel: CancellationToken) -> SocketAddr {
        tokio::spawn(
            EventForwarder::new(self.ws_manager.clone()).run(self.bus.subscribe(), cancel.clone()),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .unwrap();
        });
        addr
    }

    /// Start a worker pool over the same service.
    pub fn start_pool(&self, generator: Arc<dyn Generator>, cancel: CancellationToken) {
        let pool = WorkerPool::new(
            self.jobs.clone(),
            generator,
            PoolConfig {
                concurrency: 1,
                poll_interval: Duration::from_millis(20),
                heartbeat_interval: Duration::from_secs(5),
                worker_name: "api-test".into(),
            },
        );
        tokio::spawn(async move { pool.run(cancel).await });
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Reports a fixed sequence of percents, then succeeds with `img://<name>`.
pub struct ScriptedGenerator {
    pub steps: Vec<i64>,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<GenerationOutput, GenerationError> {
        for &p in &self.steps {
            progress.report(p, format!("step {p}"));
            tokio::task::yield_now().await;
        }
        let name = payload["name"].as_str().unwrap_or("unknown");
        Ok(GenerationOutput::new(format!("img://{name}")))
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// WebSocket helpers
// ---------------------------------------------------------------------------

pub async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/ws"))
        .await
        .unwrap();
    ws
}

pub async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping pings. Panics after 5 s of silence.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame should arrive")
            .expect("stream should stay open")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Connect, consume `connection_confirmed`, and join `job_id` with an ack.
pub async fn subscribed_client(addr: SocketAddr, job_id: &str) -> WsClient {
    let mut ws = connect(addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "connection_confirmed");
    send_json(
        &mut ws,
        serde_json::json!({ "type": "subscribe", "job_id": job_id, "ack": true }),
    )
    .await;
    assert_eq!(next_json(&mut ws).await["type"], "subscribed");
    ws
}
