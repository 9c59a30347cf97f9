// Upstream stream → OpenAI SSE transformation

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

use crate::proxy::error::ProxyError;

pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// One demultiplexed delta from the upstream stream.
///
/// Content and reasoning are independent channels: arrival order within a
/// channel is preserved, interleaving across channels carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Content(String),
    Reasoning(String),
}

/// 等待上游的第一个数据块
///
/// The stream relay must fail with a distinct timeout error when the
/// connection opens but produces nothing, so the caller can retry with a
/// fresh credential before any SSE bytes reach the client. `Ok(None)`
/// means the upstream closed without sending anything.
pub async fn await_first_chunk(
    stream: &mut UpstreamByteStream,
    timeout: Duration,
) -> Result<Option<Bytes>, ProxyError> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Err(_) => Err(ProxyError::EmptyResponseTimeout(timeout.as_secs())),
        Ok(None) => Ok(None),
        Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
        Ok(Some(Err(e))) => Err(ProxyError::Upstream(e.to_string())),
    }
}

/// 将上游流转换为 OpenAI 兼容的 SSE 流
///
/// Lazy and single-pass: dropping the returned stream drops the upstream
/// connection, so a client disconnect cancels the upstream call without
/// draining it. Mid-stream upstream failures yield a terminal error event
/// followed by `[DONE]`, never a silent close.
pub fn create_openai_sse_stream(
    first_chunk: Bytes,
    mut upstream: UpstreamByteStream,
    model: String,
    thinking: bool,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    let stream_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();

    let stream = async_stream::stream! {
        // Role preamble before any delta
        yield Ok::<Bytes, String>(sse_data(&delta_chunk(
            &stream_id,
            created,
            &model,
            json!({"role": "assistant"}),
            None,
        )));

        let mut buffer = BytesMut::new();
        let mut pending = Some(first_chunk);

        loop {
            let item = match pending.take() {
                Some(bytes) => Some(Ok(bytes)),
                None => upstream.next().await,
            };
            let Some(item) = item else { break };

            match item {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    // Process complete lines from the buffer
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        if let Ok(line_str) = std::str::from_utf8(&line_raw) {
                            let line = line_str.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match parse_stream_line(line, thinking) {
                                Some(StreamDelta::Content(text)) => {
                                    yield Ok(sse_data(&delta_chunk(
                                        &stream_id,
                                        created,
                                        &model,
                                        json!({"content": text}),
                                        None,
                                    )));
                                }
                                Some(StreamDelta::Reasoning(text)) => {
                                    yield Ok(sse_data(&delta_chunk(
                                        &stream_id,
                                        created,
                                        &model,
                                        json!({"reasoning": text}),
                                        None,
                                    )));
                                }
                                None => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Upstream stream failed mid-response: {}", e);
                    let error = ProxyError::Upstream(e.to_string());
                    yield Ok(sse_data(&error.error_body()));
                    yield Ok(Bytes::from("data: [DONE]\n\n"));
                    return;
                }
            }
        }

        // Trailing partial line without a newline terminator
        if !buffer.is_empty() {
            if let Ok(line_str) = std::str::from_utf8(&buffer) {
                let line = line_str.trim();
                if !line.is_empty() {
                    match parse_stream_line(line, thinking) {
                        Some(StreamDelta::Content(text)) => {
                            yield Ok(sse_data(&delta_chunk(
                                &stream_id,
                                created,
                                &model,
                                json!({"content": text}),
                                None,
                            )));
                        }
                        Some(StreamDelta::Reasoning(text)) => {
                            yield Ok(sse_data(&delta_chunk(
                                &stream_id,
                                created,
                                &model,
                                json!({"reasoning": text}),
                                None,
                            )));
                        }
                        None => {}
                    }
                }
            }
        }

        // Completion marker and end-of-stream signal
        yield Ok(sse_data(&delta_chunk(
            &stream_id,
            created,
            &model,
            json!({}),
            Some("stop"),
        )));
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Box::pin(stream)
}

/// 解析上游响应中的单行数据
///
/// Upstream grammar:
///   `0:"..."`     ordinary content delta
///   `g:"..."`     reasoning delta (only surfaced in thinking mode)
///   `f:{json}`    message metadata
///   `data: {...}` JSON event carrying `content` / `thinking` fields
///   `data: [DONE]` end marker
pub fn parse_stream_line(line: &str, thinking: bool) -> Option<StreamDelta> {
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            if let Some(content) = value.get("content").and_then(|v| v.as_str()) {
                if !content.is_empty() {
                    return Some(StreamDelta::Content(content.to_string()));
                }
            }
            if thinking {
                if let Some(thought) = value.get("thinking").and_then(|v| v.as_str()) {
                    if !thought.is_empty() {
                        return Some(StreamDelta::Reasoning(thought.to_string()));
                    }
                }
            }
            return None;
        }
        // Non-JSON payloads pass through as content
        return Some(StreamDelta::Content(data.replace("\\n", "\n")));
    }

    if let Some(raw) = line.strip_prefix("0:") {
        let text = decode_quoted(raw);
        if text.is_empty() {
            return None;
        }
        return Some(StreamDelta::Content(text));
    }

    if let Some(raw) = line.strip_prefix("g:") {
        if !thinking {
            return None;
        }
        let text = decode_quoted(raw);
        if text.is_empty() {
            return None;
        }
        return Some(StreamDelta::Reasoning(format!("{}\n", text)));
    }

    if let Some(raw) = line.strip_prefix("f:") {
        if let Ok(meta) = serde_json::from_str::<Value>(raw.trim()) {
            if let Some(message_id) = meta.get("messageId").and_then(|v| v.as_str()) {
                tracing::debug!("Upstream message id: {}", message_id);
            }
        }
        return None;
    }

    None
}

/// 去除引号并解码转义字符
fn decode_quoted(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    match serde_json::from_str::<String>(&format!("\"{}\"", inner)) {
        Ok(decoded) => decoded,
        Err(_) => inner.replace("\\n", "\n"),
    }
}

/// 收集非流式响应的特殊格式正文
///
/// Returns accumulated (content, reasoning) from the `0:`/`g:`/`data:`
/// line grammar.
pub fn collect_upstream_text(text: &str, thinking: bool) -> (String, String) {
    let mut content = String::new();
    let mut reasoning = String::new();

    for line in text.lines() {
        match parse_stream_line(line.trim(), thinking) {
            Some(StreamDelta::Content(part)) => content.push_str(&part),
            Some(StreamDelta::Reasoning(part)) => reasoning.push_str(&part),
            None => {}
        }
    }

    (content, reasoning)
}

fn delta_chunk(id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

fn sse_data(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    fn upstream_from(chunks: Vec<&str>) -> UpstreamByteStream {
        let items: Vec<Result<Bytes, reqwest::Error>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn collect_events(
        stream: Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>,
    ) -> Vec<String> {
        stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_content_deltas_preserve_order() {
        let mut upstream = upstream_from(vec!["0:\"Hello\"\n0:\" world\"\n"]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning".into(),
            false,
        ))
        .await;

        // role preamble, two content deltas, stop chunk, [DONE]
        assert_eq!(events.len(), 5);
        assert!(events[0].contains("\"role\":\"assistant\""));
        assert!(events[1].contains("\"content\":\"Hello\""));
        assert!(events[2].contains("\"content\":\" world\""));
        assert!(events[3].contains("\"finish_reason\":\"stop\""));
        assert_eq!(events[4], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_reasoning_channel_demultiplexed() {
        let mut upstream =
            upstream_from(vec!["g:\"step one\"\n0:\"answer\"\ng:\"step two\"\n"]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning-thinking".into(),
            true,
        ))
        .await;

        let reasoning: Vec<&String> = events
            .iter()
            .filter(|e| e.contains("\"reasoning\""))
            .collect();
        assert_eq!(reasoning.len(), 2);
        assert!(reasoning[0].contains("step one"));
        assert!(reasoning[1].contains("step two"));
        assert!(events.iter().any(|e| e.contains("\"content\":\"answer\"")));
    }

    #[tokio::test]
    async fn test_reasoning_suppressed_when_disabled() {
        let mut upstream = upstream_from(vec!["g:\"secret\"\n0:\"answer\"\n"]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning".into(),
            false,
        ))
        .await;

        assert!(!events.iter().any(|e| e.contains("secret")));
        assert!(events.iter().any(|e| e.contains("\"content\":\"answer\"")));
    }

    #[tokio::test]
    async fn test_chunks_split_across_network_reads() {
        // one logical line arriving in three pieces
        let mut upstream = upstream_from(vec!["0:\"Hel", "lo\"", "\n0:\"!\"\n"]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning".into(),
            false,
        ))
        .await;

        assert!(events.iter().any(|e| e.contains("\"content\":\"Hello\"")));
        assert!(events.iter().any(|e| e.contains("\"content\":\"!\"")));
    }

    #[tokio::test]
    async fn test_data_json_lines_and_done_marker() {
        let mut upstream = upstream_from(vec![
            "data: {\"content\": \"from json\"}\ndata: {\"thinking\": \"hmm\"}\ndata: [DONE]\n",
        ]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning-thinking".into(),
            true,
        ))
        .await;

        assert!(events.iter().any(|e| e.contains("from json")));
        assert!(events.iter().any(|e| e.contains("\"reasoning\":\"hmm\"")));
        // exactly one [DONE], appended by the translator
        let done_count = events.iter().filter(|e| e.contains("[DONE]")).count();
        assert_eq!(done_count, 1);
    }

    #[tokio::test]
    async fn test_escaped_content_decodes() {
        let mut upstream = upstream_from(vec!["0:\"line one\\nline two\"\n"]);
        let first = upstream.next().await.unwrap().unwrap();
        let events = collect_events(create_openai_sse_stream(
            first,
            upstream,
            "chat-model-reasoning".into(),
            false,
        ))
        .await;

        assert!(events.iter().any(|e| e.contains("line one\\nline two")));
    }

    #[tokio::test]
    async fn test_await_first_chunk_times_out() {
        let mut upstream: UpstreamByteStream = Box::pin(futures::stream::pending());
        let result = await_first_chunk(&mut upstream, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::EmptyResponseTimeout(_))));
    }

    #[tokio::test]
    async fn test_await_first_chunk_detects_closed_stream() {
        let mut upstream = upstream_from(vec![]);
        let result = await_first_chunk(&mut upstream, Duration::from_millis(50)).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_await_first_chunk_returns_data() {
        let mut upstream = upstream_from(vec!["0:\"hi\"\n"]);
        let result = await_first_chunk(&mut upstream, Duration::from_millis(50)).await;
        assert_eq!(result.unwrap().unwrap(), Bytes::from("0:\"hi\"\n"));
    }

    struct DropProbe {
        dropped: Arc<AtomicBool>,
    }

    impl Stream for DropProbe {
        type Item = Result<Bytes, reqwest::Error>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_translator_releases_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let upstream: UpstreamByteStream = Box::pin(DropProbe {
            dropped: dropped.clone(),
        });

        let translated = create_openai_sse_stream(
            Bytes::from("0:\"partial\"\n"),
            upstream,
            "chat-model-reasoning".into(),
            false,
        );
        assert!(!dropped.load(Ordering::SeqCst));

        // client disconnect: the translated stream is dropped mid-response
        drop(translated);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_collect_upstream_text() {
        let raw = "f:{\"messageId\":\"msg-1\"}\n0:\"Hi\"\n0:\" there\"\ng:\"pondering\"\n";
        let (content, reasoning) = collect_upstream_text(raw, true);
        assert_eq!(content, "Hi there");
        assert_eq!(reasoning, "pondering\n");

        let (content, reasoning) = collect_upstream_text(raw, false);
        assert_eq!(content, "Hi there");
        assert!(reasoning.is_empty());
    }

    #[test]
    fn test_parse_stream_line_edge_cases() {
        assert_eq!(parse_stream_line("data: [DONE]", true), None);
        assert_eq!(parse_stream_line("f:{\"messageId\":\"x\"}", true), None);
        assert_eq!(parse_stream_line("g:\"thought\"", false), None);
        assert_eq!(
            parse_stream_line("0:\"text\"", false),
            Some(StreamDelta::Content("text".into()))
        );
        assert_eq!(
            parse_stream_line("data: plain text", false),
            Some(StreamDelta::Content("plain text".into()))
        );
        assert_eq!(parse_stream_line("unknown: line", false), None);
    }
}
