use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::config::{
    DecodingStrategy, SuggestionSettings, Task, TransformSettings, MAX_LENGTH_RANGE,
    SUGGESTION_COUNT_RANGE, WORDS_PER_SUGGESTION_RANGE,
};
use crate::session::{Accept, SessionView, TransformOutput};
use crate::AssistantError;

/// Error returned to the browser as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    Assistant(AssistantError),
    Internal(String),
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        ApiError::Assistant(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Assistant(err) => {
                let status = match &err {
                    AssistantError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    AssistantError::InvalidSettings(_) | AssistantError::NothingToAccept(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    AssistantError::TransformUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        if status.is_server_error() {
            log::error!("{}", message);
        } else {
            log::debug!("Request rejected ({}): {}", status, message);
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Run a model call on the blocking pool
async fn run_blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Inference task failed: {}", e)))?
        .map_err(ApiError::from)
}

fn session_view(state: &AppState, id: &str) -> ApiResult<SessionView> {
    let transform_available = state.assistant.transform_available();
    let view = state
        .sessions
        .with_session(id, |s| s.view(id, transform_available))?;
    Ok(Json(view))
}

/// Compute suggestions for `revision` and store them if still current
async fn refresh_suggestions(
    state: &AppState,
    id: &str,
    revision: u64,
    text: String,
    settings: SuggestionSettings,
) -> std::result::Result<(), ApiError> {
    let assistant = state.assistant.clone();
    let suggestions = run_blocking(move || assistant.suggest(&text, &settings)).await?;
    state
        .sessions
        .with_session(id, |s| s.store_suggestions(revision, suggestions))?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Slider {
    pub min: usize,
    pub max: usize,
    pub default: usize,
}

/// Everything the UI needs to draw its controls
#[derive(Debug, Serialize, Deserialize)]
pub struct OptionsView {
    pub tasks: Vec<Choice>,
    pub strategies: Vec<Choice>,
    pub suggestion_count: Slider,
    pub words_per_suggestion: Slider,
    pub max_length: Slider,
    pub device: String,
    pub transform_available: bool,
}

pub async fn options(State(state): State<AppState>) -> Json<OptionsView> {
    let suggestion_defaults = SuggestionSettings::default();
    let transform_defaults = TransformSettings::default();

    Json(OptionsView {
        tasks: Task::ALL
            .iter()
            .map(|task| Choice {
                value: task.to_string(),
                label: task.label(),
            })
            .collect(),
        strategies: DecodingStrategy::ALL
            .iter()
            .map(|strategy| Choice {
                value: strategy.to_string(),
                label: strategy.to_string(),
            })
            .collect(),
        suggestion_count: Slider {
            min: *SUGGESTION_COUNT_RANGE.start(),
            max: *SUGGESTION_COUNT_RANGE.end(),
            default: suggestion_defaults.count,
        },
        words_per_suggestion: Slider {
            min: *WORDS_PER_SUGGESTION_RANGE.start(),
            max: *WORDS_PER_SUGGESTION_RANGE.end(),
            default: suggestion_defaults.words_per_suggestion,
        },
        max_length: Slider {
            min: *MAX_LENGTH_RANGE.start(),
            max: *MAX_LENGTH_RANGE.end(),
            default: transform_defaults.max_length,
        },
        device: state.assistant.device_label(),
        transform_available: state.assistant.transform_available(),
    })
}

pub async fn create_session(State(state): State<AppState>) -> Json<SessionView> {
    let (id, session) = state.sessions.create();
    Json(session.view(&id, state.assistant.transform_available()))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    state.sessions.with_session(&id, |s| s.visits += 1)?;
    session_view(&state, &id)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuggestRequest {
    pub text: String,
    #[serde(default)]
    pub settings: SuggestionSettings,
}

pub async fn suggest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SuggestRequest>,
) -> ApiResult<SessionView> {
    req.settings.validate()?;

    let (revision, enabled) = state.sessions.with_session(&id, |s| {
        let revision = s.submit_for_suggestions(&req.text, req.settings);
        (revision, s.suggestions_enabled)
    })?;

    if enabled {
        refresh_suggestions(&state, &id, revision, req.text, req.settings).await?;
    }

    session_view(&state, &id)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransformRequest {
    pub text: String,
    #[serde(default)]
    pub settings: TransformSettings,
}

pub async fn transform(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TransformRequest>,
) -> ApiResult<SessionView> {
    req.settings.validate()?;
    if !state.assistant.transform_available() {
        return Err(AssistantError::TransformUnavailable.into());
    }

    let revision = state
        .sessions
        .with_session(&id, |s| s.submit_for_transform(&req.text))?;

    let assistant = state.assistant.clone();
    let settings = req.settings;
    let text = req.text;
    let rewritten = run_blocking(move || assistant.transform(&text, &settings)).await?;

    state.sessions.with_session(&id, |s| {
        s.store_transform(
            revision,
            TransformOutput {
                task: settings.task,
                text: rewritten,
            },
        )
    })?;

    session_view(&state, &id)
}

pub async fn accept(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(accept): Json<Accept>,
) -> ApiResult<SessionView> {
    let (revision, text, settings) = state.sessions.with_session(&id, |s| {
        s.accept(accept)
            .map(|revision| (revision, s.text.clone(), s.suggestion_settings))
    })??;

    refresh_suggestions(&state, &id, revision, text, settings).await?;
    session_view(&state, &id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::Assistant;
    use crate::config::DEFAULT_TEXT;
    use crate::server::router;
    use crate::session::SessionStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Deterministic stand-in for the real models
    struct FakeAssistant {
        transform_available: bool,
        transform_gate: Option<TransformGate>,
    }

    /// Holds a rewrite in flight until the test releases it
    struct TransformGate {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Assistant for FakeAssistant {
        fn suggest(
            &self,
            _text: &str,
            settings: &SuggestionSettings,
        ) -> crate::Result<Vec<String>> {
            settings.validate()?;
            Ok((0..settings.count)
                .map(|i| format!(" w{}", i).repeat(settings.words_per_suggestion))
                .collect())
        }

        fn transform(&self, text: &str, settings: &TransformSettings) -> crate::Result<String> {
            if !self.transform_available {
                return Err(AssistantError::TransformUnavailable);
            }
            if let Some(gate) = &self.transform_gate {
                gate.started.lock().unwrap().send(()).unwrap();
                gate.release.lock().unwrap().recv().unwrap();
            }
            Ok(format!("[{}] {}", settings.task, text.to_uppercase()))
        }

        fn transform_available(&self) -> bool {
            self.transform_available
        }

        fn device_label(&self) -> String {
            if self.transform_available { "cuda" } else { "cpu" }.to_string()
        }
    }

    fn app_with(assistant: FakeAssistant) -> axum::Router {
        let state = AppState::new(
            Arc::new(assistant),
            SessionStore::new(DEFAULT_TEXT, Duration::from_secs(60)),
        );
        router(state)
    }

    fn app(transform_available: bool) -> axum::Router {
        app_with(FakeAssistant {
            transform_available,
            transform_gate: None,
        })
    }

    async fn call(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn new_session(app: &axum::Router) -> String {
        let (status, body) = call(app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = app(false)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&bytes);
        assert!(page.contains("Writing Assistant"));
        // Busy states while a model call runs
        assert!(page.contains("Generating token suggestions..."));
        assert!(page.contains("Thinking..."));
    }

    #[tokio::test]
    async fn test_options() {
        let (status, body) = call(&app(false), "GET", "/api/options", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transform_available"], false);
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["tasks"][0]["value"], "paraphrase");
        assert_eq!(body["suggestion_count"]["default"], 5);
        assert_eq!(body["max_length"]["min"], 50);
    }

    #[tokio::test]
    async fn test_new_session_state() {
        let app = app(false);
        let (status, body) = call(&app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], DEFAULT_TEXT);
        assert_eq!(body["gpu_notice"], true);
        assert!(body["suggestions"].is_null());

        // Only the first visit shows the notice
        let id = body["id"].as_str().unwrap();
        let (_, body) = call(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(body["gpu_notice"], false);
    }

    #[tokio::test]
    async fn test_suggest_follows_settings() {
        let app = app(false);
        let id = new_session(&app).await;
        let uri = format!("/api/sessions/{}/suggest", id);

        let (status, body) = call(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({
                "text": "Hello",
                "settings": {"count": 3, "words_per_suggestion": 2}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "Hello");
        let suggestions = body["suggestions"].as_array().unwrap();
        assert_eq!(suggestions.len(), 3);
        assert_eq!(suggestions[1]["text"], " w1 w1");

        let (_, body) = call(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"text": "Hello", "settings": {"count": 1}})),
        )
        .await;
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let app = app(false);
        let id = new_session(&app).await;
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/suggest", id),
            Some(serde_json::json!({"text": "Hello", "settings": {"count": 11}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Suggestion count"));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (status, _) = call(&app(false), "GET", "/api/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_transform_unavailable() {
        let app = app(false);
        let id = new_session(&app).await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/transform", id),
            Some(serde_json::json!({"text": "me go"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_transform_then_accept() {
        let app = app(true);
        let id = new_session(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/transform", id),
            Some(serde_json::json!({
                "text": "me go",
                "settings": {"task": "formal", "strategy": "greedy"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transform"]["text"], "[formal] ME GO");
        assert_eq!(body["transform"]["task"], "formal");
        assert_eq!(body["suggestions_enabled"], false);

        // Same text again does not regenerate suggestions while the rewrite is shown
        let (_, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/suggest", id),
            Some(serde_json::json!({"text": "me go"})),
        )
        .await;
        assert!(body["suggestions"].is_null());

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/accept", id),
            Some(serde_json::json!({"kind": "transform"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "[formal] ME GO");
        assert!(body["transform"].is_null());
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_accept_suggestion() {
        let app = app(false);
        let id = new_session(&app).await;

        call(
            &app,
            "POST",
            &format!("/api/sessions/{}/suggest", id),
            Some(serde_json::json!({"text": "Strong", "settings": {"count": 2}})),
        )
        .await;

        let accept_uri = format!("/api/sessions/{}/accept", id);
        let (status, body) = call(
            &app,
            "POST",
            &accept_uri,
            Some(serde_json::json!({"kind": "suggestion", "index": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "Strong w1");
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            &app,
            "POST",
            &accept_uri,
            Some(serde_json::json!({"kind": "suggestion", "index": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rewrite_of_old_text_is_dropped() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let app = app_with(FakeAssistant {
            transform_available: true,
            transform_gate: Some(TransformGate {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            }),
        });
        let id = new_session(&app).await;

        let transform_app = app.clone();
        let transform_uri = format!("/api/sessions/{}/transform", id);
        let pending = tokio::spawn(async move {
            let body = serde_json::json!({"text": "me go"});
            call(&transform_app, "POST", &transform_uri, Some(body)).await
        });
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // The user keeps typing while the rewrite runs
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{}/suggest", id),
            Some(serde_json::json!({"text": "me go now"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 5);

        release_tx.send(()).unwrap();
        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "me go now");
        assert!(body["transform"].is_null());
        assert_eq!(body["suggestions_enabled"], true);
        assert_eq!(body["suggestions"].as_array().unwrap().len(), 5);
    }
}
