use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use streamchat::chat::ChatService;
use streamchat::citations::CitationRenderer;
use streamchat::config::AppConfig;
use streamchat::models::{AnswerView, RenderSegment, StreamItem};
use streamchat::remote::RemoteChain;
use streamchat::session::{AnswerTurn, ChatEvent, ChatState};

#[derive(Parser, Debug)]
#[command(name = "ask")]
#[command(about = "Ask one question and print the cited answer")]
struct Cli {
    #[arg(long)]
    question: String,
    /// Replay a recorded stream log (one `{"ops": [...]}` item per line) instead of calling the backend
    #[arg(long)]
    replay: Option<String>,
    /// Print the rendered answer as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let renderer = CitationRenderer::default();

    let answer = match &cli.replay {
        Some(path) => replay(&config, &renderer, &cli.question, &load_items(path)?)?,
        None => {
            let remote = RemoteChain::new(&config)?;
            let chat = ChatService::new(&config, remote, renderer, Arc::new(Semaphore::new(1)));
            chat.ask(cli.question.clone()).await?
        }
    };

    let Some(answer) = answer else {
        anyhow::bail!("backend finished without answer text");
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
    } else {
        print_answer(&answer);
    }
    Ok(())
}

fn replay(
    config: &AppConfig,
    renderer: &CitationRenderer,
    question: &str,
    items: &[StreamItem],
) -> Result<Option<AnswerView>> {
    let mut state = ChatState::new(config.source_step_name.clone()).reduce(
        renderer,
        ChatEvent::Submit {
            question: Some(question.to_string()),
        },
    );
    if !state.is_loading() {
        anyhow::bail!("question must not be empty");
    }

    for item in items {
        state = state.reduce(renderer, ChatEvent::Batch(item.clone()));
    }

    let answer_id = state.pending_answer().map(|turn| turn.id.clone());
    let state = state.reduce(renderer, ChatEvent::StreamCompleted);
    Ok(answer_id.and_then(|id| state.answer(&id).map(AnswerTurn::view)))
}

fn load_items(path: &str) -> Result<Vec<StreamItem>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path))?;
    let reader = BufReader::new(file);
    let mut items = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: StreamItem = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path, idx + 1))?;
        items.push(parsed);
    }

    Ok(items)
}

fn print_answer(answer: &AnswerView) {
    let mut body = String::new();
    for segment in &answer.segments {
        match segment {
            RenderSegment::Text { html } => body.push_str(html),
            RenderSegment::Citation { index, .. } => body.push_str(&format!("[{index}]")),
        }
    }
    println!("{body}");

    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for (index, source) in answer.sources.iter().enumerate() {
            println!("  [{index}] {} <{}>", source.title, source.url);
        }
    }
    if let Some(run_id) = &answer.run_id {
        println!();
        println!("run: {run_id}");
    }
}
