use std::net::SocketAddr;

use anyhow::Result;
use askama::Template;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::Form;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::chat::{ChatService, TurnRejected};
use crate::config::AppConfig;
use crate::models::{
    AnswerView, AskRequest, ConversationView, HighlightRequest, MessageView, Notification,
    RenderSegment,
};

#[derive(Clone)]
struct AppState {
    chat: ChatService,
}

pub fn router(chat: ChatService) -> Router {
    Router::new()
        .route("/", get(index_page).post(submit_page))
        .route("/api/chat", post(chat_handler))
        .route("/api/conversation", get(get_conversation))
        .route("/api/highlight", post(highlight_handler))
        .route("/api/notifications", get(get_notifications))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { chat })
}

pub async fn run_server(config: AppConfig, chat: ChatService) -> Result<()> {
    let app = router(chat);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let conversation = state.chat.conversation()?;
    let notifications = state.chat.take_notifications()?;
    let template = IndexTemplate::from(conversation).with_notifications(notifications);
    let body = template.render()?;
    Ok(Html(body))
}

// A failed stream has already been rolled back into the page state, so it
// redirects like a success and surfaces as a toast.
async fn submit_page(
    State(state): State<AppState>,
    Form(request): Form<AskRequest>,
) -> Result<Response, ApiError> {
    if let Err(err) = state.chat.ask(request.question).await {
        if err.is::<TurnRejected>() {
            return Err(ApiError::from_ask(err));
        }
    }
    Ok(Redirect::to("/").into_response())
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<Option<AnswerView>>, ApiError> {
    let answer = state
        .chat
        .ask(request.question)
        .await
        .map_err(ApiError::from_ask)?;
    Ok(Json(answer))
}

async fn get_conversation(
    State(state): State<AppState>,
) -> Result<Json<ConversationView>, ApiError> {
    Ok(Json(state.chat.conversation()?))
}

async fn highlight_handler(
    State(state): State<AppState>,
    Json(request): Json<HighlightRequest>,
) -> Result<Json<Vec<bool>>, ApiError> {
    match state.chat.highlight(&request.message_id, request.target)? {
        Some(highlighted) => Ok(Json(highlighted)),
        None => Err(ApiError::not_found(format!(
            "answer not found: {}",
            request.message_id
        ))),
    }
}

async fn get_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    Ok(Json(state.chat.take_notifications()?))
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    conversation_id: String,
    loading: bool,
    input: String,
    messages: Vec<MessageCard>,
    notifications: Vec<String>,
}

struct MessageCard {
    id: String,
    is_human: bool,
    content: String,
    status: String,
    segments: Vec<SegmentCard>,
    sources: Vec<SourceCard>,
}

struct SegmentCard {
    is_citation: bool,
    html: String,
    index: usize,
    url: String,
    highlighted: bool,
}

struct SourceCard {
    index: usize,
    url: String,
    title: String,
    highlighted: bool,
}

impl From<ConversationView> for IndexTemplate {
    fn from(view: ConversationView) -> Self {
        Self {
            conversation_id: view.conversation_id,
            loading: view.loading,
            input: view.input,
            messages: view.messages.into_iter().map(MessageCard::from).collect(),
            notifications: Vec::new(),
        }
    }
}

impl IndexTemplate {
    fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications = notifications
            .into_iter()
            .map(|notification| notification.message)
            .collect();
        self
    }
}

impl From<MessageView> for MessageCard {
    fn from(view: MessageView) -> Self {
        match view {
            MessageView::Human { id, content } => Self {
                id,
                is_human: true,
                content,
                status: String::new(),
                segments: Vec::new(),
                sources: Vec::new(),
            },
            MessageView::Ai(answer) => answer_card(answer),
        }
    }
}

fn answer_card(answer: AnswerView) -> MessageCard {
    let highlighted = |index: usize| answer.highlighted.get(index).copied().unwrap_or(false);

    let segments = answer
        .segments
        .iter()
        .map(|segment| match segment {
            RenderSegment::Text { html } => SegmentCard {
                is_citation: false,
                html: html.clone(),
                index: 0,
                url: String::new(),
                highlighted: false,
            },
            RenderSegment::Citation { index, source } => SegmentCard {
                is_citation: true,
                html: String::new(),
                index: *index,
                url: source.url.clone(),
                highlighted: highlighted(*index),
            },
        })
        .collect();

    let sources = answer
        .sources
        .iter()
        .enumerate()
        .map(|(index, source)| SourceCard {
            index,
            url: source.url.clone(),
            title: source.title.clone(),
            highlighted: highlighted(index),
        })
        .collect();

    let status = serde_json::to_value(answer.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    MessageCard {
        id: answer.message_id.clone(),
        is_human: false,
        content: answer.text.clone(),
        status,
        segments,
        sources,
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn from_ask(value: anyhow::Error) -> Self {
        let status = match value.downcast_ref::<TurnRejected>() {
            Some(TurnRejected::EmptyQuestion) => StatusCode::BAD_REQUEST,
            Some(TurnRejected::Busy) => StatusCode::CONFLICT,
            None => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: format!("{value:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{CONTENT_TYPE, LOCATION};
    use reqwest::redirect::Policy;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::chat::tests::{serve_stream_log, service, ANSWER, OPENING};
    use crate::models::{RawSource, TurnStatus};

    async fn spawn_app(chat: ChatService) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(chat)).await.unwrap() });
        format!("http://{addr}")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap()
    }

    async fn answered_app() -> String {
        let body = format!("{OPENING}{ANSWER}event: end\n\n");
        let config = serve_stream_log(StatusCode::OK, body).await;
        spawn_app(service(&config)).await
    }

    fn answer() -> AnswerView {
        AnswerView {
            message_id: "m1".into(),
            run_id: None,
            status: TurnStatus::Streaming,
            text: "x[^0]".into(),
            segments: vec![
                RenderSegment::text("x"),
                RenderSegment::Citation {
                    index: 0,
                    source: RawSource::new("https://a.example", "A &amp; B"),
                },
                RenderSegment::text(""),
            ],
            sources: vec![RawSource::new("https://a.example", "A &amp; B")],
            highlighted: vec![true],
        }
    }

    #[test]
    fn page_renders_citations_and_highlighted_sources() {
        let template = IndexTemplate::from(ConversationView {
            conversation_id: "c1".into(),
            input: String::new(),
            loading: true,
            messages: vec![
                MessageView::Human {
                    id: "h1".into(),
                    content: "<b>why?</b>".into(),
                },
                MessageView::Ai(answer()),
            ],
        });
        let html = template.render().unwrap();

        assert!(html.contains("&lt;b&gt;why?"));
        assert!(!html.contains("<b>why?"));
        assert!(html.contains("a.example"));
        assert!(html.contains("A &amp; B"));
        assert!(html.contains("citation highlighted"));
        assert!(html.contains("source-card highlighted"));
        assert!(html.contains("streaming"));
    }

    #[test]
    fn stale_highlight_vector_reads_as_unhighlighted() {
        let mut view = answer();
        view.highlighted.clear();
        let card = answer_card(view);
        assert!(!card.segments[1].highlighted);
        assert!(!card.sources[0].highlighted);
    }

    #[tokio::test]
    async fn page_form_submit_asks_and_redirects_home() {
        let base = answered_app().await;
        let client = client();

        let response = client
            .post(format!("{base}/"))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("question=Who%3F")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/");

        let conversation: ConversationView = client
            .get(format!("{base}/api/conversation"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert!(matches!(&conversation.messages[0], MessageView::Human { content, .. } if content == "Who?"));

        let page = client.get(format!("{base}/")).send().await.unwrap().text().await.unwrap();
        assert!(page.contains(r#"<form id="ask-form" method="post" action="/">"#));
        assert!(page.contains("Hi"));
        assert!(page.contains(r#"data-index="0""#));
    }

    #[tokio::test]
    async fn failed_form_submit_restores_input_and_shows_toast_once() {
        let config = serve_stream_log(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"detail": "model offline"}"#.to_string(),
        )
        .await;
        let base = spawn_app(service(&config)).await;
        let client = client();

        let response = client
            .post(format!("{base}/"))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("question=Who%3F")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let page = client.get(format!("{base}/")).send().await.unwrap().text().await.unwrap();
        assert!(page.contains("model offline"));
        assert!(page.contains(">Who?</textarea>"));

        let again = client.get(format!("{base}/")).send().await.unwrap().text().await.unwrap();
        assert!(!again.contains("model offline"));
    }

    #[tokio::test]
    async fn json_chat_maps_rejections_to_client_errors() {
        let base = answered_app().await;
        let response = client()
            .post(format!("{base}/api/chat"))
            .json(&json!({"question": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let busy = ApiError::from_ask(TurnRejected::Busy.into());
        assert_eq!(busy.status, StatusCode::CONFLICT);
        let upstream = ApiError::from_ask(anyhow::anyhow!("connection refused"));
        assert_eq!(upstream.status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn highlight_endpoint_follows_hover() {
        let base = answered_app().await;
        let client = client();

        let answer: Option<AnswerView> = client
            .post(format!("{base}/api/chat"))
            .json(&json!({"question": "Who?"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let message_id = answer.unwrap().message_id;

        let hovered: Vec<bool> = client
            .post(format!("{base}/api/highlight"))
            .json(&json!({"message_id": message_id, "target": {"kind": "citation", "index": 0}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hovered, vec![true]);

        let cleared: Vec<bool> = client
            .post(format!("{base}/api/highlight"))
            .json(&json!({"message_id": message_id, "target": null}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cleared, vec![false]);

        let missing = client
            .post(format!("{base}/api/highlight"))
            .json(&json!({"message_id": "nope", "target": null}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
