//! HTTP surface: router, shared state and the inference/crypto handlers.

pub mod completion;
pub mod crypto;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod health;
pub mod secure;
pub mod types;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;

use kvserve_core::scheduler::Scheduler;

use crate::crypto::keystore::KeyStore;
use error::ApiError;

/// Lifecycle of the model behind the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Ready,
    LoadingModel,
    Error,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Ready => "ok",
            ServerStatus::LoadingModel => "loading model",
            ServerStatus::Error => "server error",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ServerStatus::Ready,
            1 => ServerStatus::LoadingModel,
            _ => ServerStatus::Error,
        }
    }
}

/// Status and load progress shared between the loader thread and
/// `/health`.
pub struct HealthState {
    status: AtomicU8,
    progress: AtomicU32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(ServerStatus::LoadingModel as u8),
            progress: AtomicU32::new(0),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::SeqCst))
    }

    pub fn set_progress(&self, progress: f32) {
        self.progress.store(progress.to_bits(), Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct AppState {
    runner: watch::Receiver<Option<Arc<Scheduler>>>,
    pub health: Arc<HealthState>,
    pub keys: Arc<KeyStore>,
    pub model_name: String,
}

impl AppState {
    pub fn new(
        runner: watch::Receiver<Option<Arc<Scheduler>>>,
        health: Arc<HealthState>,
        keys: Arc<KeyStore>,
        model_name: String,
    ) -> Self {
        Self {
            runner,
            health,
            keys,
            model_name,
        }
    }

    /// The scheduler, once the model has finished loading. Requests that
    /// arrive during loading wait here instead of failing.
    pub async fn runner(&self) -> Result<Arc<Scheduler>, ApiError> {
        let mut rx = self.runner.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(runner) = current {
                return Ok(runner);
            }
            if self.health.status() == ServerStatus::Error {
                return Err(ApiError::Internal("model failed to load".into()));
            }
            if rx.changed().await.is_err() {
                return Err(ApiError::Internal("model loading aborted".into()));
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/embedding", post(embedding::embedding))
        .route("/completion", post(completion::completion))
        .route("/secure/completion", post(secure::completion))
        .route("/generate", post(generate::generate))
        .route("/secure/generate", post(secure::generate))
        .route("/aes/key", get(crypto::aes_key))
        .route("/aes/encrypt", post(crypto::aes_encrypt))
        .route("/aes/decrypt", post(crypto::aes_decrypt))
        .route("/rsa/keys", get(crypto::rsa_keys))
        .route("/rsa/encrypt", post(crypto::rsa_encrypt))
        .route("/rsa/decrypt", post(crypto::rsa_decrypt))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use kvserve_core::testing::MockBackend;

    struct TestServer {
        router: Router,
        scheduler: Arc<Scheduler>,
        worker: Option<std::thread::JoinHandle<()>>,
    }

    impl TestServer {
        fn new(backend: MockBackend) -> Self {
            Self::with_keys(backend, Arc::new(KeyStore::new()))
        }

        fn with_keys(backend: MockBackend, keys: Arc<KeyStore>) -> Self {
            let scheduler =
                Arc::new(Scheduler::new(Arc::new(backend), None, 64, 16, 2, false).unwrap());
            let runner = scheduler.clone();
            let worker = std::thread::spawn(move || {
                let _ = runner.run();
            });

            let (tx, rx) = watch::channel(Some(scheduler.clone()));
            // Keep the loader side alive for the lifetime of the test.
            std::mem::forget(tx);

            let health = Arc::new(HealthState::new());
            health.set_status(ServerStatus::Ready);
            health.set_progress(1.0);

            let state = AppState::new(rx, health, keys, "test-model".to_string());
            Self {
                router: create_router(state),
                scheduler,
                worker: Some(worker),
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.scheduler.stop();
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_loading_until_model_arrives() {
        let (tx, rx) = watch::channel(None);
        let state = AppState::new(
            rx,
            Arc::new(HealthState::new()),
            Arc::new(KeyStore::new()),
            "m".to_string(),
        );
        let router = create_router(state);
        drop(tx);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "loading model");
    }

    #[tokio::test]
    async fn completion_streams_pieces_then_final_frame() {
        let server = TestServer::new(MockBackend::new().with_script(&['h' as i32, 'i' as i32]));

        let response = server
            .router
            .clone()
            .oneshot(post_json("/completion", r#"{"prompt": "q"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let frames: Vec<serde_json::Value> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        let content: String = frames
            .iter()
            .filter(|f| f["stop"] == false)
            .map(|f| f["content"].as_str().unwrap())
            .collect();
        assert_eq!(content, "hi");

        let last = frames.last().unwrap();
        assert_eq!(last["stop"], true);
        assert_eq!(last["content"], "");
        assert_eq!(last["timings"]["prompt_n"], 1);
        assert_eq!(last["timings"]["predicted_n"], 3);
    }

    #[tokio::test]
    async fn embedding_returns_vector() {
        let server =
            TestServer::new(MockBackend::new().with_seq_embedding(vec![0.5, 1.5]));

        let response = server
            .router
            .clone()
            .oneshot(post_json("/embedding", r#"{"content": "text"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["embedding"][0], 0.5);
        assert_eq!(json["embedding"][1], 1.5);
    }

    #[tokio::test]
    async fn empty_prompt_is_a_bad_request() {
        let server = TestServer::new(MockBackend::new());

        let response = server
            .router
            .clone()
            .oneshot(post_json("/completion", r#"{"prompt": ""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generate_wraps_prompt_and_returns_single_response() {
        let server = TestServer::new(MockBackend::new().with_script(&['o' as i32, 'k' as i32]));

        let response = server
            .router
            .clone()
            .oneshot(post_json(
                "/generate",
                r#"{"role": "user", "prompt": "ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"]["role"], "assistant");
        assert_eq!(json["message"]["content"], "ok");
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["done"], true);
        assert_eq!(json["done_reason"], "stop");
        assert_eq!(json["prompt_eval_count"], -1);
    }

    #[tokio::test]
    async fn secure_completion_roundtrip() {
        // Provision the server keypair the way startup does.
        let (private_pem, public_pem) = crate::crypto::rsa::generate_keys().unwrap();
        let keys = Arc::new(KeyStore::new());
        keys.set(crate::crypto::keystore::PRIVATE_KEY, &private_pem);

        let server =
            TestServer::with_keys(MockBackend::new().with_script(&['s' as i32]), keys);

        let aes_key = crate::crypto::aes::generate_key();
        let encrypted_key = crate::crypto::rsa::encrypt(&public_pem, &aes_key).unwrap();
        let encrypted_prompt = crate::crypto::aes::encrypt(&aes_key, "hello").unwrap();

        let body = format!(
            r#"{{"role": "user", "EncryptedPrompt": "{encrypted_prompt}", "encryptedSymmetricKey": "{encrypted_key}"}}"#
        );
        let response = server
            .router
            .clone()
            .oneshot(post_json("/secure/completion", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let frames: Vec<serde_json::Value> = std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        // Piece content is AES encrypted; decrypting recovers the piece.
        let piece = frames
            .iter()
            .find(|f| f["stop"] == false)
            .expect("no piece frame");
        let decrypted =
            crate::crypto::aes::decrypt(&aes_key, piece["content"].as_str().unwrap()).unwrap();
        assert_eq!(decrypted, "s");
        assert_eq!(frames.last().unwrap()["stop"], true);
    }

    #[tokio::test]
    async fn aes_utility_endpoints_roundtrip() {
        let server = TestServer::new(MockBackend::new());

        let response = server
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/aes/key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let key = json["aesKey"].as_str().unwrap().to_string();

        let body = format!(r#"{{"aesKey": "{key}", "text": "round trip"}}"#);
        let response = server
            .router
            .clone()
            .oneshot(post_json("/aes/encrypt", &body))
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let encrypted = json["encryptedText"].as_str().unwrap();

        let body = format!(r#"{{"aesKey": "{key}", "encryptedText": "{encrypted}"}}"#);
        let response = server
            .router
            .clone()
            .oneshot(post_json("/aes/decrypt", &body))
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["text"], "round trip");
    }
}
