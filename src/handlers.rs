use crate::app::AppState;
use crate::error::{AppError, AppResult, ChatError};
use crate::models::{self, ModelMapping};
use crate::relay;
use crate::request::{self, ChatRequest};
use crate::transcript::{PendingChat, RECENT_CHATS_LIMIT};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response, Sse};
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn not_found() -> AppError {
    AppError::not_found("the requested resource does not exist")
}

pub async fn list_models() -> Json<Value> {
    let data: Vec<Value> = models::known_model_ids()
        .into_iter()
        .filter_map(|id| models::resolve(&id).ok())
        .map(|mapping| {
            json!({
                "id": mapping.model_id,
                "object": "model",
                "owned_by": mapping.provider_kind,
                "display_name": mapping.display_name,
                "streams": mapping.streams,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn create_chat(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    let Json(body) = body.map_err(body_rejection)?;
    let req = request::normalize(&body)?;
    let mapping = models::resolve(&req.model_id)?;
    if req.has_images() && !mapping.provider_kind.accepts_images() {
        return Err(ChatError::invalid_param(
            "images_not_supported",
            "images",
            format!("model {} does not accept images", mapping.model_id),
        )
        .into());
    }

    let stream = wants_stream(&mapping, &req);
    let pending = PendingChat::new(&mapping.model_id, &req);
    tracing::info!(
        chat_id = %pending.id,
        model_id = %mapping.model_id,
        requested_model = %req.model_id,
        provider = %mapping.provider_kind,
        stream,
        images = req.images.len(),
        "chat request accepted"
    );

    if stream {
        return forward_stream(&state, &mapping, &req, pending).await;
    }
    let answer = forward_nonstream(&state, &mapping, &req, pending).await?;
    Ok(Json(json!({ "result": answer })).into_response())
}

fn body_rejection(rejection: JsonRejection) -> AppError {
    let status = rejection.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "invalid_body"
    };
    AppError::new(status, code, rejection.body_text())
}

/// Streaming needs both a capable provider and a streaming model family; the client may only
/// opt out.
fn wants_stream(mapping: &ModelMapping, req: &ChatRequest) -> bool {
    mapping.provider_kind.supports_streaming() && req.stream.unwrap_or(mapping.streams)
}

async fn forward_nonstream(
    state: &AppState,
    mapping: &ModelMapping,
    req: &ChatRequest,
    pending: PendingChat,
) -> Result<String, ChatError> {
    // The fingerprint only covers text, so image requests never touch the cache.
    let cacheable = !req.has_images();
    if cacheable {
        if let Some(entry) = state.cache.lookup(&mapping.model_id, &req.text).await {
            tracing::info!(chat_id = %pending.id, model_id = %mapping.model_id, "served from cache");
            return Ok(entry.result);
        }
    }

    let adapter = state.providers.adapter(mapping.provider_kind);
    let metadata = req.metadata(&mapping.display_name);
    let answer = adapter
        .invoke(
            &state.http,
            state.providers.settings(),
            mapping,
            req,
            &metadata,
        )
        .await
        .map_err(|err| upstream_failure(mapping, err))?;
    record_upstream(mapping, "success");

    state.transcripts.spawn_persist(pending.complete(answer.clone()));
    if cacheable {
        state.cache.store(&mapping.model_id, &req.text, &answer).await;
    }
    Ok(answer)
}

async fn forward_stream(
    state: &AppState,
    mapping: &ModelMapping,
    req: &ChatRequest,
    pending: PendingChat,
) -> AppResult<Response> {
    let adapter = state.providers.adapter(mapping.provider_kind);
    let metadata = req.metadata(&mapping.display_name);
    let upstream_resp = adapter
        .invoke_stream(
            &state.http,
            state.providers.settings(),
            mapping,
            req,
            &metadata,
        )
        .await
        .map_err(|err| upstream_failure(mapping, err))?;
    record_upstream(mapping, "success");

    let events = relay::spawn_relay(
        upstream_resp,
        adapter.clone(),
        pending,
        state.transcripts.clone(),
        state.stream_idle_timeout(),
    );
    Ok(Sse::new(events).into_response())
}

fn upstream_failure(mapping: &ModelMapping, err: crate::upstream::UpstreamCallError) -> ChatError {
    let err = ChatError::from_upstream(mapping.provider_kind, err);
    record_upstream(mapping, err.code());
    tracing::error!(
        provider = %mapping.provider_kind,
        upstream_model = %mapping.upstream_model_path,
        code = err.code(),
        "upstream call failed: {err}"
    );
    err
}

fn record_upstream(mapping: &ModelMapping, outcome: &'static str) {
    metrics::counter!(
        "chatrouter_upstream_requests_total",
        "provider" => mapping.provider_kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> AppResult<Response> {
    let Ok(id) = uuid::Uuid::parse_str(&chat_id) else {
        return Err(AppError::not_found("chat not found"));
    };
    match state.transcripts.load(&id).await {
        Ok(Some(record)) => Ok(Json(record).into_response()),
        Ok(None) => Err(AppError::not_found("chat not found")),
        Err(err) => {
            tracing::error!(chat_id = %id, "failed to load chat: {err}");
            Err(AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code(),
                "failed to load chat",
            )
            .with_type("server_error"))
        }
    }
}

pub async fn list_chats(State(state): State<AppState>) -> AppResult<Response> {
    match state.transcripts.recent(RECENT_CHATS_LIMIT).await {
        Ok(chats) => Ok(Json(json!({ "chats": chats })).into_response()),
        Err(err) => {
            tracing::error!("failed to list chats: {err}");
            Err(AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code(),
                "failed to list chats",
            )
            .with_type("server_error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::wants_stream;
    use crate::models::resolve;
    use crate::request::ChatRequest;

    fn req(stream: Option<bool>) -> ChatRequest {
        ChatRequest {
            text: "hi".to_string(),
            images: Vec::new(),
            model_id: String::new(),
            user: None,
            stream,
        }
    }

    #[test]
    fn streaming_follows_model_family_and_client_opt_out() {
        let latest = resolve("hosted-chat-latest").unwrap();
        assert!(wants_stream(&latest, &req(None)));
        assert!(!wants_stream(&latest, &req(Some(false))));

        let legacy = resolve("hosted-chat-legacy").unwrap();
        assert!(!wants_stream(&legacy, &req(None)));
        assert!(wants_stream(&legacy, &req(Some(true))));
    }

    #[test]
    fn non_streaming_providers_never_stream() {
        let local = resolve("local-inference-default").unwrap();
        assert!(!wants_stream(&local, &req(Some(true))));
        let web = resolve("web-augmented-sonar").unwrap();
        assert!(!wants_stream(&web, &req(Some(true))));
    }
}
