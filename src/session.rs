use uuid::Uuid;

use crate::citations::CitationRenderer;
use crate::config::SOURCE_STEP_NAME;
use crate::models::{
    AnswerView, ChatRequest, ConversationView, HistoryPair, HoverTarget, MessageView,
    Notification, RawSource, RenderSegment, StreamItem, TurnStatus,
};
use crate::patch::StreamedDocument;
use crate::sources::{extract_raw_sources, ResolvedSources};

#[derive(Debug, Clone)]
pub enum ChatEvent {
    InputChanged(String),
    Submit { question: Option<String> },
    Batch(StreamItem),
    StreamCompleted,
    StreamFailed { message: String },
    StreamAbandoned,
    Hover { message_id: String, target: HoverTarget },
    HoverEnd { message_id: String },
}

#[derive(Debug, Clone)]
pub struct AnswerTurn {
    pub id: String,
    pub run_id: Option<String>,
    pub status: TurnStatus,
    text: String,
    sources: ResolvedSources,
    segments: Vec<RenderSegment>,
}

impl AnswerTurn {
    fn new(run_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            status: TurnStatus::Streaming,
            text: String::new(),
            sources: ResolvedSources::default(),
            segments: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sources(&self) -> &ResolvedSources {
        &self.sources
    }

    pub fn segments(&self) -> &[RenderSegment] {
        &self.segments
    }

    pub fn view(&self) -> AnswerView {
        AnswerView {
            message_id: self.id.clone(),
            run_id: self.run_id.clone(),
            status: self.status,
            text: self.text.clone(),
            segments: self.segments.clone(),
            sources: self.sources.deduplicated().to_vec(),
            highlighted: self.sources.highlight().as_slice().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Human { id: String, content: String },
    Ai(AnswerTurn),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Human { id, .. } => id,
            Message::Ai(turn) => &turn.id,
        }
    }

    pub fn view(&self) -> MessageView {
        match self {
            Message::Human { id, content } => MessageView::Human {
                id: id.clone(),
                content: content.clone(),
            },
            Message::Ai(turn) => MessageView::Ai(turn.view()),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingTurn {
    question: String,
    first_message: usize,
    answer_index: Option<usize>,
    document: StreamedDocument,
    raw_sources: Vec<RawSource>,
}

#[derive(Debug, Clone)]
pub struct ChatState {
    pub conversation_id: String,
    source_step: String,
    messages: Vec<Message>,
    chat_history: Vec<HistoryPair>,
    input: String,
    pending: Option<PendingTurn>,
    notifications: Vec<Notification>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new(SOURCE_STEP_NAME)
    }
}

impl ChatState {
    pub fn new(source_step: impl Into<String>) -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            source_step: source_step.into(),
            messages: Vec::new(),
            chat_history: Vec::new(),
            input: String::new(),
            pending: None,
            notifications: Vec::new(),
        }
    }

    pub fn reduce(mut self, renderer: &CitationRenderer, event: ChatEvent) -> Self {
        self.apply(renderer, event);
        self
    }

    pub fn apply(&mut self, renderer: &CitationRenderer, event: ChatEvent) {
        match event {
            ChatEvent::InputChanged(text) => self.input = text,
            ChatEvent::Submit { question } => self.submit(question),
            ChatEvent::Batch(item) => self.apply_batch(renderer, item),
            ChatEvent::StreamCompleted => self.complete(),
            ChatEvent::StreamFailed { message } => self.roll_back(message),
            ChatEvent::StreamAbandoned => self.abandon(),
            ChatEvent::Hover { message_id, target } => {
                if let Some(turn) = self.answer_mut(&message_id) {
                    turn.sources.hover(target.index());
                }
            }
            ChatEvent::HoverEnd { message_id } => {
                if let Some(turn) = self.answer_mut(&message_id) {
                    turn.sources.unhover();
                }
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn chat_history(&self) -> &[HistoryPair] {
        &self.chat_history
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn pending_request(&self) -> Option<ChatRequest> {
        self.pending.as_ref().map(|pending| ChatRequest {
            question: pending.question.clone(),
            chat_history: self.chat_history.clone(),
        })
    }

    pub fn pending_answer(&self) -> Option<&AnswerTurn> {
        let index = self.pending.as_ref()?.answer_index?;
        self.answer_at(index)
    }

    pub fn last_answer(&self) -> Option<&AnswerTurn> {
        self.messages.iter().rev().find_map(|message| match message {
            Message::Ai(turn) => Some(turn),
            Message::Human { .. } => None,
        })
    }

    pub fn answer(&self, message_id: &str) -> Option<&AnswerTurn> {
        self.messages.iter().find_map(|message| match message {
            Message::Ai(turn) if turn.id == message_id => Some(turn),
            _ => None,
        })
    }

    pub fn view(&self) -> ConversationView {
        ConversationView {
            conversation_id: self.conversation_id.clone(),
            input: self.input.clone(),
            loading: self.is_loading(),
            messages: self.messages.iter().map(Message::view).collect(),
        }
    }

    fn submit(&mut self, question: Option<String>) {
        if self.pending.is_some() {
            tracing::debug!("ignoring submit while a turn is in flight");
            return;
        }
        let question = question.unwrap_or_else(|| self.input.clone());
        if question.is_empty() {
            return;
        }

        self.input.clear();
        let first_message = self.messages.len();
        self.messages.push(Message::Human {
            id: Uuid::new_v4().to_string(),
            content: question.clone(),
        });
        self.pending = Some(PendingTurn {
            question,
            first_message,
            answer_index: None,
            document: StreamedDocument::new(),
            raw_sources: Vec::new(),
        });
    }

    fn apply_batch(&mut self, renderer: &CitationRenderer, item: StreamItem) {
        let Some(pending) = self.pending.as_mut() else {
            tracing::debug!("dropping stream batch with no turn in flight");
            return;
        };

        let failures = pending.document.apply_raw(&item.ops);
        if !failures.is_empty() {
            tracing::debug!("{} of {} ops skipped", failures.len(), item.ops.len());
        }

        if let Some(raw) = extract_raw_sources(&pending.document, &self.source_step) {
            pending.raw_sources = raw;
        }
        let run_id = pending.document.run_id().map(str::to_string);

        let Some(text) = pending.document.answer_text() else {
            return;
        };

        let index = match pending.answer_index {
            Some(index) => index,
            None => {
                self.messages.push(Message::Ai(AnswerTurn::new(run_id.clone())));
                let index = self.messages.len() - 1;
                pending.answer_index = Some(index);
                index
            }
        };

        let raw_sources = pending.raw_sources.clone();
        if let Some(Message::Ai(turn)) = self.messages.get_mut(index) {
            if run_id.is_some() {
                turn.run_id = run_id;
            }
            turn.sources.update(raw_sources);
            turn.text = text;
            turn.segments = renderer.render(&turn.text, turn.sources.index());
        }
    }

    fn complete(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let answer = pending.document.answer_text().unwrap_or_default();
        if let Some(index) = pending.answer_index {
            if let Some(Message::Ai(turn)) = self.messages.get_mut(index) {
                turn.status = TurnStatus::Complete;
            }
        }
        self.chat_history.push(HistoryPair {
            human: pending.question,
            ai: answer,
        });
    }

    fn roll_back(&mut self, message: String) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        tracing::error!("answer stream failed: {message}");
        self.messages.truncate(pending.first_message);
        self.input = pending.question;
        self.notifications.push(Notification::error(message));
    }

    fn abandon(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if let Some(index) = pending.answer_index {
            if let Some(Message::Ai(turn)) = self.messages.get_mut(index) {
                turn.status = TurnStatus::Interrupted;
            }
        }
    }

    fn answer_at(&self, index: usize) -> Option<&AnswerTurn> {
        match self.messages.get(index)? {
            Message::Ai(turn) => Some(turn),
            Message::Human { .. } => None,
        }
    }

    fn answer_mut(&mut self, message_id: &str) -> Option<&mut AnswerTurn> {
        self.messages.iter_mut().find_map(|message| match message {
            Message::Ai(turn) if turn.id == message_id => Some(turn),
            _ => None,
        })
    }
}
