// OpenAI Handler
use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::proxy::error::ProxyError;
use crate::proxy::mappers::openai::streaming::{
    await_first_chunk, collect_upstream_text, create_openai_sse_stream, UpstreamByteStream,
};
use crate::proxy::mappers::openai::{
    self, OpenAIContent, OpenAIMessage, OpenAIRequest,
};
use crate::proxy::server::AppState;

/// 核心请求执行结果
enum ExecuteResult {
    /// 成功的流式响应
    Stream(Response),
    /// 成功的非流式响应
    Json(Value),
    /// 需要重试
    Retry { error: ProxyError },
    /// 不可重试的错误
    Fatal(ProxyError),
}

/// 核心请求执行函数
///
/// One attempt: checkout a credential, relay the request, classify the
/// outcome. Auth rejections revoke the credential before retrying so the
/// next attempt checks out a fresh one.
async fn execute_chat_request(state: &AppState, request: &OpenAIRequest) -> ExecuteResult {
    // 1. 获取上游凭证
    let credential = match state.token_manager.checkout().await {
        Ok(c) => c,
        // Acquisition already burned its own retry budget.
        Err(e) => return ExecuteResult::Fatal(e),
    };

    let thinking = openai::thinking_enabled(request);
    let upstream_body = openai::transform_chat_request(request);

    // 2. 转发请求
    let response = match state.upstream.send_chat(&upstream_body, &credential.value).await {
        Ok(r) => r,
        Err(e) => {
            // Transport failures are transient; the credential is not at fault.
            return ExecuteResult::Retry { error: e };
        }
    };

    let status = response.status();

    // 3. 处理成功响应
    if status.is_success() {
        if request.stream {
            let mut upstream_stream: UpstreamByteStream = Box::pin(response.bytes_stream());
            let timeout = Duration::from_secs(state.config.empty_response_timeout_secs);

            // The upstream sometimes opens the stream and goes silent;
            // surface that as a retryable timeout before any SSE bytes
            // reach the client.
            let first = match await_first_chunk(&mut upstream_stream, timeout).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!("Upstream closed the stream without sending data");
                    return ExecuteResult::Retry {
                        error: ProxyError::EmptyResponseTimeout(timeout.as_secs()),
                    };
                }
                Err(e) => return ExecuteResult::Retry { error: e },
            };

            let sse = create_openai_sse_stream(
                first,
                upstream_stream,
                request.model.clone(),
                thinking,
            );

            let response = Response::builder()
                .header("Content-Type", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(sse))
                .unwrap();

            return ExecuteResult::Stream(response);
        }

        // 非流式: 读取完整响应并解析
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                return ExecuteResult::Retry {
                    error: ProxyError::Upstream(format!("body read failed: {}", e)),
                };
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ExecuteResult::Retry {
                error: ProxyError::Upstream("empty upstream response".into()),
            };
        }

        let (content, reasoning) = parse_upstream_body(trimmed, thinking);
        if content.is_empty() && reasoning.is_empty() {
            debug!("Unparseable upstream body: {}", truncate_for_log(trimmed, 200));
            return ExecuteResult::Retry {
                error: ProxyError::Upstream("unparseable upstream response".into()),
            };
        }

        let reasoning_opt = if thinking && !reasoning.is_empty() {
            Some(reasoning.as_str())
        } else {
            None
        };
        return ExecuteResult::Json(openai::build_completion_response(
            &request.model,
            &content,
            reasoning_opt,
        ));
    }

    // 4. 处理错误响应
    let status_code = status.as_u16();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| format!("HTTP {}", status_code));
    error!(
        "Upstream error response {}: {}",
        status_code,
        truncate_for_log(&error_text, 300)
    );

    match status_code {
        // 凭证已被上游拒绝，立即吊销并换新重试
        401 | 403 => {
            state
                .token_manager
                .record_error(&credential.value, status_code)
                .await;
            ExecuteResult::Retry {
                error: ProxyError::Upstream(format!("HTTP {}: credential rejected", status_code)),
            }
        }
        // 限速类错误重试，不归咎于凭证
        429 => ExecuteResult::Retry {
            error: ProxyError::Upstream(format!("HTTP {}: upstream rate limited", status_code)),
        },
        // 服务端错误计入凭证错误次数后重试
        500 | 502 | 503 | 529 => {
            state
                .token_manager
                .record_error(&credential.value, status_code)
                .await;
            ExecuteResult::Retry {
                error: ProxyError::Upstream(format!("HTTP {}: {}", status_code, error_text)),
            }
        }
        _ => ExecuteResult::Fatal(ProxyError::Upstream(format!(
            "HTTP {}: {}",
            status_code, error_text
        ))),
    }
}

/// 解析非流式上游正文 (JSON result/thinking 或特殊行格式)
fn parse_upstream_body(text: &str, thinking: bool) -> (String, String) {
    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            let content = value
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let reasoning = value
                .get("thinking")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if !content.is_empty() || !reasoning.is_empty() {
                return (content, reasoning);
            }
        }
    }
    collect_upstream_text(text, thinking)
}

/// 执行带重试的请求循环
async fn execute_with_retry(
    state: &AppState,
    request: &OpenAIRequest,
) -> Result<Response, ProxyError> {
    let max_attempts = state.config.max_retries.max(1);
    let mut last_error = ProxyError::Upstream("no attempts made".into());

    for attempt in 0..max_attempts {
        if attempt > 0 {
            // brief pause before re-sending; credential rotation already
            // happened in the failed attempt when it was warranted
            tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
        }

        match execute_chat_request(state, request).await {
            ExecuteResult::Stream(response) => return Ok(response),
            ExecuteResult::Json(value) => return Ok(Json(value).into_response()),
            ExecuteResult::Retry { error } => {
                warn!(
                    "Chat relay attempt {}/{} failed: {}",
                    attempt + 1,
                    max_attempts,
                    error
                );
                last_error = error;
            }
            ExecuteResult::Fatal(error) => return Err(error),
        }
    }

    Err(last_error)
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let mut request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return bad_request(format!("Invalid request: {}", e));
        }
    };

    if !openai::is_known_model(&request.model) {
        let supported: Vec<&str> = openai::available_models().iter().map(|(id, _)| *id).collect();
        warn!("Requested unknown model: {}", request.model);
        return bad_request(format!(
            "Model '{}' is not available, supported models: {}",
            request.model,
            supported.join(", ")
        ));
    }

    // Safety: ensure messages is not empty
    if request.messages.is_empty() {
        debug!("Received request with empty messages, injecting fallback...");
        request.messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: OpenAIContent::String(" ".to_string()),
        });
    }

    debug!("Received OpenAI request for model: {}", request.model);
    state.stats.record_request();

    match execute_with_retry(&state, &request).await {
        Ok(response) => {
            state.stats.record_success();
            response
        }
        Err(error) => {
            state.stats.record_failure();
            (error.status_code(), Json(error.error_body())).into_response()
        }
    }
}

pub async fn handle_list_models() -> Json<Value> {
    Json(openai::build_models_response())
}

fn truncate_for_log(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut s: String = text.chars().take(max_len).collect();
    s.push('…');
    s
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
                "param": null,
                "code": "invalid_request",
            }
        })),
    )
        .into_response()
}
