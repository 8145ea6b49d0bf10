use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use crate::citations::CitationRenderer;
use crate::config::AppConfig;
use crate::models::{AnswerView, ChatRequest, ConversationView, HoverTarget, Notification};
use crate::remote::RemoteChain;
use crate::session::{AnswerTurn, ChatEvent, ChatState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TurnRejected {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("a turn is already in flight")]
    Busy,
}

#[derive(Clone)]
pub struct ChatService {
    remote: RemoteChain,
    renderer: CitationRenderer,
    state: Arc<Mutex<ChatState>>,
    generation_limit: Arc<Semaphore>,
}

impl ChatService {
    pub fn new(
        config: &AppConfig,
        remote: RemoteChain,
        renderer: CitationRenderer,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            remote,
            renderer,
            state: Arc::new(Mutex::new(ChatState::new(config.source_step_name.clone()))),
            generation_limit,
        }
    }

    pub async fn ask(&self, question: String) -> Result<Option<AnswerView>> {
        if question.trim().is_empty() {
            return Err(TurnRejected::EmptyQuestion.into());
        }

        let _permit = self
            .generation_limit
            .acquire()
            .await
            .context("generation limiter closed")?;

        let (request, conversation_id) = {
            let mut state = self.lock()?;
            if state.is_loading() {
                return Err(TurnRejected::Busy.into());
            }
            state.apply(&self.renderer, ChatEvent::Submit { question: Some(question) });
            let request = state
                .pending_request()
                .ok_or(TurnRejected::EmptyQuestion)?;
            (request, state.conversation_id.clone())
        };

        let mut in_flight = InFlight {
            service: self,
            settled: false,
        };
        let outcome = self.consume(&request, &conversation_id).await;
        in_flight.settled = true;

        let mut state = self.lock()?;
        match outcome {
            Ok(()) => {
                let answer_id = state.pending_answer().map(|turn| turn.id.clone());
                state.apply(&self.renderer, ChatEvent::StreamCompleted);
                Ok(answer_id
                    .and_then(|id| state.answer(&id).map(AnswerTurn::view)))
            }
            Err(err) => {
                state.apply(
                    &self.renderer,
                    ChatEvent::StreamFailed {
                        message: format!("{err:#}"),
                    },
                );
                Err(err)
            }
        }
    }

    async fn consume(&self, request: &ChatRequest, conversation_id: &str) -> Result<()> {
        let mut stream = self.remote.stream_log(request, conversation_id).await?;
        let mut batches = 0usize;

        while let Some(item) = stream.next_item().await? {
            batches += 1;
            tracing::debug!("applying batch {batches} ({} ops)", item.ops.len());
            self.dispatch(ChatEvent::Batch(item))?;
        }

        tracing::info!("answer stream finished after {batches} batches");
        Ok(())
    }

    pub fn dispatch(&self, event: ChatEvent) -> Result<()> {
        self.lock()?.apply(&self.renderer, event);
        Ok(())
    }

    pub fn conversation(&self) -> Result<ConversationView> {
        Ok(self.lock()?.view())
    }

    pub fn highlight(&self, message_id: &str, target: Option<HoverTarget>) -> Result<Option<Vec<bool>>> {
        let mut state = self.lock()?;
        let event = match target {
            Some(target) => ChatEvent::Hover {
                message_id: message_id.to_string(),
                target,
            },
            None => ChatEvent::HoverEnd {
                message_id: message_id.to_string(),
            },
        };
        state.apply(&self.renderer, event);
        Ok(state
            .answer(message_id)
            .map(|turn| turn.sources().highlight().as_slice().to_vec()))
    }

    pub fn take_notifications(&self) -> Result<Vec<Notification>> {
        Ok(self.lock()?.take_notifications())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChatState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("conversation lock poisoned"))
    }
}

struct InFlight<'a> {
    service: &'a ChatService,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!("answer stream abandoned mid-turn");
        if let Err(err) = self.service.dispatch(ChatEvent::StreamAbandoned) {
            tracing::error!("failed to mark turn abandoned: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use axum::http::{header, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::models::{MessageView, TurnStatus};

    pub(crate) const OPENING: &str = concat!(
        "event: data\n",
        r#"data: {"ops": [{"op": "replace", "path": "", "value": {"id": "run-1", "streamed_output": [], "logs": {}}}]}"#,
        "\n\n",
    );

    pub(crate) const ANSWER: &str = concat!(
        "event: data\n",
        r#"data: {"ops": [{"op": "add", "path": "/logs/FindDocs/final_output", "value": {"output": [{"metadata": {"source": "https://a.example", "title": "A"}}]}}]}"#,
        "\n\n",
        "event: data\n",
        "data: not json\n\n",
        "event: data\n",
        r#"data: {"ops": [{"op": "add", "path": "/streamed_output/-", "value": "Hi[^0]"}]}"#,
        "\n\n",
    );

    pub(crate) async fn serve_stream_log(status: StatusCode, body: String) -> AppConfig {
        let app = Router::new().route(
            "/chat/stream_log",
            post(move || async move {
                (status, [(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        AppConfig {
            api_base_url: format!("http://{addr}"),
            ..AppConfig::default()
        }
    }

    async fn serve_stalled(first: String) -> AppConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
            let chunk = format!("{:x}\r\n{first}\r\n", first.len());
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(chunk.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        AppConfig {
            api_base_url: format!("http://{addr}"),
            ..AppConfig::default()
        }
    }

    pub(crate) fn service(config: &AppConfig) -> ChatService {
        ChatService::new(
            config,
            RemoteChain::new(config).unwrap(),
            CitationRenderer::default(),
            Arc::new(Semaphore::new(1)),
        )
    }

    fn assert_rolled_back(chat: &ChatService, question: &str, reason: &str) {
        let view = chat.conversation().unwrap();
        assert!(view.messages.is_empty());
        assert_eq!(view.input, question);
        assert!(!view.loading);

        let notifications = chat.take_notifications().unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].message.contains(reason), "{}", notifications[0].message);
        assert!(chat.take_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_event_completes_the_turn() {
        let body = format!("{OPENING}{ANSWER}event: end\n\n");
        let chat = service(&serve_stream_log(StatusCode::OK, body).await);

        let answer = chat.ask("Who?".into()).await.unwrap().unwrap();
        assert_eq!(answer.status, TurnStatus::Complete);
        assert_eq!(answer.run_id.as_deref(), Some("run-1"));
        assert_eq!(answer.text, "Hi[^0]");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.segments.iter().filter(|s| s.is_citation()).count(), 1);

        let view = chat.conversation().unwrap();
        assert!(!view.loading);
        assert_eq!(view.messages.len(), 2);
        assert!(chat.take_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_event_rolls_back_and_notifies() {
        let body = format!(
            "{OPENING}{ANSWER}event: error\ndata: {{\"message\": \"backend exploded\"}}\n\n"
        );
        let chat = service(&serve_stream_log(StatusCode::OK, body).await);

        let err = chat.ask("Who?".into()).await.unwrap_err();
        assert!(format!("{err:#}").contains("backend exploded"));
        assert_rolled_back(&chat, "Who?", "backend exploded");
    }

    #[tokio::test]
    async fn body_ending_without_end_event_is_a_failure() {
        let body = format!("{OPENING}{ANSWER}");
        let chat = service(&serve_stream_log(StatusCode::OK, body).await);

        let err = chat.ask("Who?".into()).await.unwrap_err();
        assert!(format!("{err:#}").contains("before the end event"));
        assert_rolled_back(&chat, "Who?", "before the end event");
    }

    #[tokio::test]
    async fn error_status_rolls_back_with_condensed_body() {
        let config = serve_stream_log(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"detail": "model offline"}"#.to_string(),
        )
        .await;
        let chat = service(&config);

        chat.ask("Who?".into()).await.unwrap_err();
        assert_rolled_back(&chat, "Who?", "model offline");
    }

    #[tokio::test]
    async fn dropping_ask_mid_stream_marks_the_answer_interrupted() {
        let first = format!("{OPENING}{ANSWER}");
        let chat = service(&serve_stalled(first).await);

        let task = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.ask("Who?".into()).await })
        };

        let mut streaming = false;
        for _ in 0..200 {
            let view = chat.conversation().unwrap();
            if matches!(view.messages.get(1), Some(MessageView::Ai(answer)) if answer.text == "Hi[^0]") {
                streaming = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(streaming, "answer never started streaming");

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let view = chat.conversation().unwrap();
        assert!(!view.loading);
        match &view.messages[1] {
            MessageView::Ai(answer) => {
                assert_eq!(answer.status, TurnStatus::Interrupted);
                assert_eq!(answer.text, "Hi[^0]");
            }
            other => panic!("expected an answer, got {other:?}"),
        }
        assert!(chat.take_notifications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_question_is_rejected_without_calling_the_backend() {
        let chat = service(&AppConfig::default());

        let err = chat.ask("   ".into()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TurnRejected>(),
            Some(&TurnRejected::EmptyQuestion)
        );
        assert!(chat.conversation().unwrap().messages.is_empty());
    }
}
