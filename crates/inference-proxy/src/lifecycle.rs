//! Model warmup and keep-alive.
//!
//! A model is "warm" once a single-token chat has succeeded against it. Warm
//! models that keep being used get a keep-alive ping every
//! [`KEEP_ALIVE_INTERVAL`] so the backend does not unload them; a model idle
//! for longer than [`IDLE_TIMEOUT`] loses its pinger.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BackendError, ChatMessage, ChatRequest, OllamaClient};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Value of the backend's `keep_alive` parameter.
const KEEP_ALIVE_DURATION: &str = "5m";

#[derive(Debug, Clone)]
struct ModelState {
    last_used: Instant,
    warmed_up: bool,
}

/// Point-in-time view of one model, served at `/models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub warmed_up: bool,
    pub idle_secs: u64,
    pub keep_alive: bool,
}

/// Per-model options sent with every request for `model`.
pub fn model_settings(model: &str) -> Map<String, Value> {
    let mut settings = Map::new();
    settings.insert("num_thread".into(), json!(8));
    settings.insert("num_batch".into(), json!(512));
    settings.insert("repeat_penalty".into(), json!(1.1));
    settings.insert("temperature".into(), json!(0.7));

    let overrides = match model {
        "qwen2.5:3b" | "phi3:mini" => json!({"num_ctx": 2048, "num_gpu": 1, "num_thread": 4}),
        "smollm2:135m" => json!({"num_ctx": 1024, "num_thread": 4}),
        "gemma3:270m" => json!({"num_ctx": 1536, "num_thread": 4, "num_gpu": 1}),
        _ => json!({"num_ctx": 4096}),
    };
    if let Value::Object(overrides) = overrides {
        settings.extend(overrides);
    }
    settings
}

fn warmup_request(model: &str) -> ChatRequest {
    let mut options = Map::new();
    options.insert("num_ctx".into(), json!(2048));
    options.insert("num_predict".into(), json!(1));
    options.insert("temperature".into(), json!(0.1));
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user("Hi")],
        stream: false,
        options,
    }
}

pub struct ModelManager {
    client: OllamaClient,
    models: Mutex<HashMap<String, ModelState>>,
    keep_alives: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    keep_alive_interval: Duration,
    idle_timeout: Duration,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("backend", &self.client.base_url())
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    pub fn new(client: OllamaClient) -> Self {
        Self {
            client,
            models: Mutex::new(HashMap::new()),
            keep_alives: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    /// Override the keep-alive cadence and idle cut-off.
    pub fn with_keep_alive(mut self, interval: Duration, idle_timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.idle_timeout = idle_timeout;
        self
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, ModelState>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn keep_alives(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keep_alives.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_warm(&self, model: &str) -> bool {
        self.models().get(model).is_some_and(|s| s.warmed_up)
    }

    pub fn keep_alive_running(&self, model: &str) -> bool {
        self.keep_alives().contains(model)
    }

    /// Load `model` with a one-token chat. A no-op for warm models.
    pub async fn warmup(&self, model: &str) -> Result<(), BackendError> {
        if self.is_warm(model) {
            return Ok(());
        }

        info!(model, "warming up model");
        let started = Instant::now();

        if let Err(err) = self.client.chat_once(&warmup_request(model)).await {
            warn!(model, error = %err, "model warmup failed");
            return Err(err);
        }

        info!(
            model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model warmed up"
        );
        self.models().insert(
            model.to_string(),
            ModelState {
                last_used: Instant::now(),
                warmed_up: true,
            },
        );
        Ok(())
    }

    /// Warm `model` if needed and make sure it has a keep-alive pinger.
    /// Failures are logged and reported as `false`, never raised.
    pub async fn ensure_warm(self: &Arc<Self>, model: &str) -> bool {
        match self.warmup(model).await {
            Ok(()) => {
                self.start_keep_alive(model);
                true
            }
            Err(_) => false,
        }
    }

    /// Record a use of `model`.
    pub fn touch(&self, model: &str) {
        self.models()
            .entry(model.to_string())
            .and_modify(|s| s.last_used = Instant::now())
            .or_insert_with(|| ModelState {
                last_used: Instant::now(),
                warmed_up: false,
            });
    }

    fn used_within(&self, model: &str, window: Duration) -> bool {
        self.models()
            .get(model)
            .is_some_and(|s| s.last_used.elapsed() <= window)
    }

    /// Spawn the keep-alive loop for `model`. Returns `false` when one is
    /// already running.
    pub fn start_keep_alive(self: &Arc<Self>, model: &str) -> bool {
        if !self.keep_alives().insert(model.to_string()) {
            return false;
        }

        let manager = Arc::clone(self);
        let model = model.to_string();
        tokio::spawn(async move {
            debug!(model = %model, "keep-alive started");
            let period = manager.keep_alive_interval;
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !manager.used_within(&model, manager.idle_timeout) {
                    info!(model = %model, "stopping keep-alive for idle model");
                    break;
                }

                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    result = manager.client.keep_alive(&model, KEEP_ALIVE_DURATION) => {
                        if let Err(err) = result {
                            warn!(model = %model, error = %err, "keep-alive request failed");
                        }
                    }
                }
            }

            manager.keep_alives().remove(&model);
            debug!(model = %model, "keep-alive stopped");
        });
        true
    }

    /// Warm every model concurrently in the background and start keep-alive
    /// for each one that succeeds. Returns immediately.
    pub fn warmup_all(self: &Arc<Self>, models: Vec<String>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let results = join_all(models.iter().map(|m| manager.warmup(m))).await;

            let mut ready = 0usize;
            for (model, result) in models.iter().zip(results) {
                if result.is_ok() {
                    manager.start_keep_alive(model);
                    ready += 1;
                }
            }
            info!(ready, total = models.len(), "startup warmup finished");
        })
    }

    /// Every known model, sorted by name.
    pub fn snapshot(&self) -> Vec<ModelSnapshot> {
        let running = self.keep_alives().clone();
        let mut out: Vec<ModelSnapshot> = self
            .models()
            .iter()
            .map(|(name, state)| ModelSnapshot {
                name: name.clone(),
                warmed_up: state.warmed_up,
                idle_secs: state.last_used.elapsed().as_secs(),
                keep_alive: running.contains(name),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stop every keep-alive loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .mount(&server)
            .await;
        server
    }

    async fn mount_chat_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Hello"},
                "done": true
            })))
            .mount(server)
            .await;
    }

    fn manager(server: &MockServer) -> ModelManager {
        ModelManager::new(OllamaClient::new(server.uri()).unwrap())
    }

    async fn generate_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/api/generate")
            .count()
    }

    #[test]
    fn settings_follow_model_table() {
        let tiny = model_settings("smollm2:135m");
        assert_eq!(tiny["num_ctx"], json!(1024));
        assert_eq!(tiny["num_thread"], json!(4));
        assert_eq!(tiny["num_batch"], json!(512));
        assert!(!tiny.contains_key("num_gpu"));

        let gemma = model_settings("gemma3:270m");
        assert_eq!(gemma["num_ctx"], json!(1536));
        assert_eq!(gemma["num_gpu"], json!(1));

        let other = model_settings("qwen3:4b");
        assert_eq!(other["num_ctx"], json!(4096));
        assert_eq!(other["num_thread"], json!(8));
        assert_eq!(other["temperature"], json!(0.7));
    }

    #[tokio::test]
    async fn warmup_sends_one_token_chat_once() {
        let server = backend().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "gemma3:270m",
                "stream": false,
                "options": {"num_predict": 1, "num_ctx": 2048}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        manager.warmup("gemma3:270m").await.unwrap();
        assert!(manager.is_warm("gemma3:270m"));

        // Already warm: no second backend call.
        manager.warmup("gemma3:270m").await.unwrap();
    }

    #[tokio::test]
    async fn failed_warmup_leaves_model_cold() {
        let server = backend().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let manager = Arc::new(manager(&server));
        assert!(manager.warmup("qwen3:4b").await.is_err());
        assert!(!manager.is_warm("qwen3:4b"));
        assert!(!manager.ensure_warm("qwen3:4b").await);
        assert!(!manager.keep_alive_running("qwen3:4b"));
    }

    #[tokio::test]
    async fn keep_alive_pings_while_model_is_used() {
        let server = backend().await;
        mount_chat_ok(&server).await;

        let manager = Arc::new(
            manager(&server).with_keep_alive(Duration::from_millis(40), Duration::from_secs(60)),
        );
        assert!(manager.ensure_warm("qwen3:1.7b").await);
        assert!(manager.keep_alive_running("qwen3:1.7b"));
        assert!(!manager.start_keep_alive("qwen3:1.7b"), "duplicate loop started");

        time::sleep(Duration::from_millis(200)).await;
        assert!(generate_calls(&server).await >= 2);

        manager.shutdown();
        time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.keep_alive_running("qwen3:1.7b"));
    }

    #[tokio::test]
    async fn keep_alive_stops_for_idle_models() {
        let server = backend().await;
        mount_chat_ok(&server).await;

        let manager = Arc::new(
            manager(&server).with_keep_alive(Duration::from_millis(20), Duration::ZERO),
        );
        manager.warmup("smollm2:135m").await.unwrap();
        time::sleep(Duration::from_millis(5)).await;
        assert!(manager.start_keep_alive("smollm2:135m"));

        time::sleep(Duration::from_millis(150)).await;
        assert!(!manager.keep_alive_running("smollm2:135m"));
        assert_eq!(generate_calls(&server).await, 0);
    }

    #[tokio::test]
    async fn warmup_all_runs_in_background() {
        let server = backend().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "broken"})))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;
        mount_chat_ok(&server).await;

        let manager = Arc::new(manager(&server));
        let handle = manager.warmup_all(vec![
            "smollm2:135m".to_string(),
            "broken".to_string(),
            "qwen3:4b".to_string(),
        ]);
        handle.await.unwrap();

        assert!(manager.is_warm("smollm2:135m"));
        assert!(manager.is_warm("qwen3:4b"));
        assert!(!manager.is_warm("broken"));
        assert!(manager.keep_alive_running("qwen3:4b"));
        assert!(!manager.keep_alive_running("broken"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn snapshot_lists_models_by_name() {
        let server = backend().await;
        mount_chat_ok(&server).await;

        let manager = manager(&server);
        manager.touch("zeta");
        manager.warmup("alpha").await.unwrap();
        manager.touch("alpha");

        let snapshot = manager.snapshot();
        let names: Vec<_> = snapshot.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(snapshot[0].warmed_up);
        assert!(!snapshot[1].warmed_up);
        assert!(!snapshot[0].keep_alive);
    }
}
