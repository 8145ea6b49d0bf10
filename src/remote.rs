use std::collections::VecDeque;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;

use crate::config::AppConfig;
use crate::models::{ChatRequest, StreamItem};

#[derive(Clone)]
pub struct RemoteChain {
    client: Client,
    stream_log_url: String,
    include_names: Vec<String>,
}

#[derive(Serialize)]
struct StreamLogRequest<'a> {
    input: &'a ChatRequest,
    config: RunConfig<'a>,
    kwargs: serde_json::Map<String, serde_json::Value>,
    include_names: &'a [String],
    diff: bool,
}

#[derive(Serialize)]
struct RunConfig<'a> {
    configurable: serde_json::Map<String, serde_json::Value>,
    tags: Vec<String>,
    metadata: RunMetadata<'a>,
}

#[derive(Serialize)]
struct RunMetadata<'a> {
    conversation_id: &'a str,
}

impl RemoteChain {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            stream_log_url: config.stream_log_url(),
            include_names: vec![config.source_step_name.clone()],
        })
    }

    pub async fn stream_log(&self, request: &ChatRequest, conversation_id: &str) -> Result<StreamLog> {
        let body = stream_log_body(request, conversation_id, &self.include_names);

        let response = self
            .client
            .post(&self.stream_log_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .context("failed to call chat stream_log endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "chat stream_log returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        tracing::debug!("chat stream opened for conversation {conversation_id}");
        Ok(StreamLog::new(response))
    }
}

fn stream_log_body<'a>(
    request: &'a ChatRequest,
    conversation_id: &'a str,
    include_names: &'a [String],
) -> StreamLogRequest<'a> {
    StreamLogRequest {
        input: request,
        config: RunConfig {
            configurable: serde_json::Map::new(),
            tags: Vec::new(),
            metadata: RunMetadata { conversation_id },
        },
        kwargs: serde_json::Map::new(),
        include_names,
        diff: true,
    }
}

pub struct StreamLog {
    response: reqwest::Response,
    decoder: SseDecoder,
    queue: VecDeque<SseEvent>,
    eof: bool,
    finished: bool,
}

impl StreamLog {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::default(),
            queue: VecDeque::new(),
            eof: false,
            finished: false,
        }
    }

    pub async fn next_item(&mut self) -> Result<Option<StreamItem>> {
        loop {
            while let Some(event) = self.queue.pop_front() {
                if let Some(item) = self.handle_event(event)? {
                    return Ok(Some(item));
                }
                if self.finished {
                    return Ok(None);
                }
            }

            if self.finished {
                return Ok(None);
            }
            if self.eof {
                anyhow::bail!("chat stream closed before the end event");
            }

            match self
                .response
                .chunk()
                .await
                .context("failed to read chat stream")?
            {
                Some(bytes) => self.queue.extend(self.decoder.push(&bytes)),
                None => {
                    self.eof = true;
                    self.queue.extend(self.decoder.finish());
                }
            }
        }
    }

    fn handle_event(&mut self, event: SseEvent) -> Result<Option<StreamItem>> {
        match event.event.as_str() {
            "data" | "message" => match serde_json::from_str::<StreamItem>(&event.data) {
                Ok(item) => Ok(Some(item)),
                Err(err) => {
                    tracing::warn!("skipping undecodable stream item: {err}");
                    Ok(None)
                }
            },
            "end" => {
                self.finished = true;
                Ok(None)
            }
            "error" => anyhow::bail!(
                "chat stream reported an error: {}",
                normalize_err_body(&event.data)
            ),
            other => {
                tracing::debug!("ignoring `{other}` stream event");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.feed_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(event) = self.feed_line(&String::from_utf8_lossy(&line)) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["detail", "message", "error"] {
            if let Some(err) = json.get(key).and_then(|v| v.as_str()) {
                return err.to_string();
            }
        }
    }

    trimmed.to_string()
}
