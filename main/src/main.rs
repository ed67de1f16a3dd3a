use std::{io::Write as _, path::PathBuf, pin::Pin};

use anyhow::Context;
use assistant::{events::AnswerEvent, CorpusMode, DocumentAssistant};
use clap::{Parser, Subcommand};
use common::utils::config::get_config;
use futures::{Stream, StreamExt};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "docent",
    about = "Document question answering over a local knowledge base"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a document to the knowledge base
    Add {
        path: PathBuf,
        /// Store under this name instead of the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Re-index a document whose content changed
    Update {
        path: PathBuf,
        /// Re-index even when the content hash is unchanged
        #[arg(long)]
        force: bool,
    },
    /// Remove a document and its index
    Delete { name: String },
    /// List stored documents
    List,
    /// Show details for one document
    Info { name: String },
    /// Show model and knowledge-base state
    Status,
    /// Ask a question, optionally scoped to one document
    Ask {
        question: String,
        #[arg(long)]
        document: Option<String>,
    },
    /// Ask a question across all documents
    Corpus {
        question: String,
        /// Use per-document retrieval with LLM relevance filtering
        #[arg(long)]
        smart: bool,
    },
    /// Interactive question loop over all documents
    Chat {
        #[arg(long)]
        smart: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;
    let assistant = DocumentAssistant::new(config)
        .await
        .context("initializing assistant")?;

    match cli.command {
        Command::Add { path, name } => {
            match assistant.add_document(&path, name.as_deref()).await {
                Some(name) => println!("Added {name}"),
                None => anyhow::bail!("failed to add {}", path.display()),
            }
        }
        Command::Update { path, force } => match assistant.update_document(&path, force).await {
            Some(name) => println!("Updated {name}"),
            None => anyhow::bail!("failed to update {}", path.display()),
        },
        Command::Delete { name } => {
            if assistant.delete_document(&name) {
                println!("Deleted {name}");
            } else {
                anyhow::bail!("failed to delete {name}");
            }
        }
        Command::List => {
            let names = assistant.list_documents();
            if names.is_empty() {
                println!("No documents stored");
            }
            for name in names {
                println!("{name}");
            }
        }
        Command::Info { name } => {
            let info = assistant
                .document_info(&name)
                .with_context(|| format!("no such document: {name}"))?;
            println!("name:      {}", info.name);
            println!("path:      {}", info.path.display());
            println!("size:      {} bytes", info.size_bytes);
            if let Some(modified) = info.modified {
                println!("modified:  {modified}");
            }
            if let Some(hash) = info.file_hash {
                println!("hash:      {hash}");
            }
            if let Some(chunks) = info.chunk_count {
                println!("chunks:    {chunks}");
            }
            println!("indexed:   {}", info.indexed);
        }
        Command::Status => {
            let status = assistant.status();
            println!("model:        {}", status.model);
            println!("available:    {}", status.available_models.join(", "));
            println!("temperature:  {}", status.temperature);
            println!("max tokens:   {}", status.max_tokens);
            println!("embeddings:   {}", status.embedding_backend);
            println!("rerank:       {}", status.rerank_enabled);
            println!("top k:        {}", status.top_k);
            println!("documents:    {}", status.document_count);
        }
        Command::Ask { question, document } => {
            let loaded = assistant.preload().await;
            info!("Preloaded {loaded} documents");
            print_stream(Box::pin(assistant.ask_stream(question, document))).await;
        }
        Command::Corpus { question, smart } => {
            let loaded = assistant.preload().await;
            info!("Preloaded {loaded} documents");
            let mode = corpus_mode(smart);
            print_stream(assistant.ask_corpus_stream(question, mode)).await;
        }
        Command::Chat { smart } => {
            let loaded = assistant.preload().await;
            println!("{loaded} documents loaded. Type a question, 'clear' to reset the conversation, 'quit' to exit.");
            let mode = corpus_mode(smart);
            chat_loop(&assistant, mode).await;
        }
    }

    Ok(())
}

const fn corpus_mode(smart: bool) -> CorpusMode {
    if smart {
        CorpusMode::Smart
    } else {
        CorpusMode::Fast
    }
}

async fn chat_loop(assistant: &DocumentAssistant, mode: CorpusMode) {
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let question = line.trim();
        match question {
            "" => continue,
            "quit" | "exit" => break,
            "clear" => {
                assistant.clear_history();
                println!("Conversation cleared");
                continue;
            }
            _ => {}
        }

        print_stream(assistant.ask_corpus_stream(question.to_string(), mode)).await;
    }
}

async fn print_stream(mut stream: Pin<Box<dyn Stream<Item = AnswerEvent> + Send>>) {
    while let Some(event) = stream.next().await {
        match event {
            AnswerEvent::Status(status) => eprintln!("[{status}]"),
            AnswerEvent::Token(token) => {
                print!("{token}");
                let _ = std::io::stdout().flush();
            }
            AnswerEvent::Summary(summary) => {
                println!();
                if !summary.sources.is_empty() {
                    println!("\nSources:");
                    for source in &summary.sources {
                        let year = source
                            .year
                            .as_ref()
                            .map(|y| format!(" [{y}]"))
                            .unwrap_or_default();
                        println!("  {}. {}{year}", source.index, source.document);
                    }
                }
                if let Some(metadata) = summary.metadata {
                    eprintln!(
                        "[{} of {} chunks kept across {} documents{}]",
                        metadata.relevant_chunks,
                        metadata.total_chunks,
                        metadata.documents_searched,
                        if metadata.fallback_used {
                            ", fallback used"
                        } else {
                            ""
                        }
                    );
                }
            }
            AnswerEvent::Error(message) => eprintln!("error: {message}"),
            AnswerEvent::Done => break,
        }
    }
}
