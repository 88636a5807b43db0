//! Recollect CLI - ingest memories and run the retrieval loop

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use futures::StreamExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use recollect::RecollectError;
use recollect::config::Config;
use recollect::conversation::{Conversation, Message};
use recollect::embedding::{CachedEmbedder, Embedder, FastEmbedder};
use recollect::error::Result;
use recollect::llm::{OpenAiGenerator, PromptTemplates};
use recollect::memory::{IngestionPipeline, Memory, MemoryBuilder, Source, TimeRelevance};
use recollect::ner::{BertEntityExtractor, EntityExtractor, HeuristicExtractor};
use recollect::retrieval::{PipelineStatus, RetrievalPipeline};
use recollect::storage::{GraphMemoryStore, open_store};
use recollect::util::parse_time_point;

/// Recollect - long-term memory with LLM-guided retrieval
#[derive(Parser)]
#[command(name = "recollect")]
#[command(about = "Graph-backed long-term memory with iterative, LLM-guided retrieval")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store one memory
    Add {
        /// Memory text
        #[arg(long)]
        text: String,
        #[arg(long)]
        topic: Option<String>,
        /// URL or free-form source description
        #[arg(long)]
        source: Option<String>,
        /// DAY, WEEK, MONTH, YEAR, DECADE, CENTURY or ALWAYS
        #[arg(long, default_value = "ALWAYS")]
        time_relevance: String,
        /// When the memory happened, e.g. 2023-07-04 or #3d
        #[arg(long)]
        time_point: Option<String>,
        /// How much the memory can be trusted, from 0 to 1
        #[arg(long, default_value_t = 1.0)]
        truthfulness: f32,
    },

    /// Retrieve context for a prompt
    Ask {
        prompt: String,
        /// Also generate the assistant reply
        #[arg(long)]
        respond: bool,
    },

    /// Show storage statistics
    Stats {
        /// Also show one entity and its co-mentions
        #[arg(long)]
        entity: Option<String>,
    },

    /// Delete every stored memory
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    tracing::debug!("Config loaded: {:?}", config);

    let store = open_store(&config.storage).await?;

    match cli.command {
        Command::Add {
            text,
            topic,
            source,
            time_relevance,
            time_point,
            truthfulness,
        } => {
            let mut memory = Memory::new(text).with_truthfulness(truthfulness).with_time(
                TimeRelevance::parse(&time_relevance),
                time_point
                    .as_deref()
                    .and_then(parse_time_point)
                    .unwrap_or(-1),
            );
            if let Some(topic) = topic {
                memory = memory.with_topic(topic);
            }
            if let Some(source) = source {
                memory = memory.with_source(Source::parse(&source));
            }
            add(&config, store, memory).await
        }
        Command::Ask { prompt, respond } => ask(&config, store, prompt, respond).await,
        Command::Stats { entity } => stats(store, entity).await,
        Command::Reset { yes } => reset(store, yes).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,recollect=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    tracing::info!("Initializing embedding model (this may take a moment on first run)...");
    let embedder = FastEmbedder::from_name(&config.embedding.model)?;
    Ok(Arc::new(CachedEmbedder::new(
        embedder,
        config.embedding.cache_size,
    )))
}

fn build_extractor(config: &Config) -> Result<Arc<dyn EntityExtractor>> {
    match config.ner.backend.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicExtractor)),
        _ => {
            tracing::info!("Loading NER model {}", config.ner.model_id);
            Ok(Arc::new(BertEntityExtractor::from_hub(&config.ner.model_id)?))
        }
    }
}

async fn add(config: &Config, store: Arc<dyn GraphMemoryStore>, memory: Memory) -> Result<()> {
    let builder = MemoryBuilder::new(build_embedder(config)?, build_extractor(config)?)
        .with_min_confidence(config.ner.min_confidence);
    let pipeline = IngestionPipeline::new(store, builder);

    match pipeline.ingest(memory).await? {
        Some(memory) => {
            println!("Stored memory {}", memory.id);
            let entities = memory.entity_names();
            if !entities.is_empty() {
                println!("Entities: {}", entities.join(", "));
            }
        }
        None => println!("Memory too short, nothing stored"),
    }
    Ok(())
}

async fn ask(
    config: &Config,
    store: Arc<dyn GraphMemoryStore>,
    prompt: String,
    respond: bool,
) -> Result<()> {
    let generator = Arc::new(OpenAiGenerator::new(&config.generator)?);
    let pipeline = Arc::new(RetrievalPipeline::new(
        store,
        build_embedder(config)?,
        generator,
        &config.retrieval,
        PromptTemplates::from_config(&config.prompts),
    ));

    let conversation = Conversation::from_messages(vec![Message::user(prompt.clone())]);
    let mut updates = pipeline.clone().stream(conversation);

    let mut context = None;
    while let Some(update) = updates.next().await {
        match update.status {
            PipelineStatus::Completed => context = Some(update.message),
            PipelineStatus::Error => eprintln!("[{:>3.0}%] error: {}", update.progress * 100.0, update.message),
            status => println!("[{:>3.0}%] {:?}: {}", update.progress * 100.0, status, update.message),
        }
    }

    let context = context.ok_or_else(|| {
        RecollectError::Retrieval("Retrieval ended without producing context".to_string())
    })?;
    println!("\nContext:\n{context}");

    if respond {
        let mut conversation = Conversation::from_messages(vec![Message::user(prompt)]);
        conversation.add_context_as_reasoning(&context);
        let reply = pipeline.respond(&mut conversation).await?;
        println!("\nReply:\n{}", reply.message_text());
    }
    Ok(())
}

async fn stats(store: Arc<dyn GraphMemoryStore>, entity: Option<String>) -> Result<()> {
    let stats = store.stats().await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Node", "Count"]);
    table.add_row(["Memories", &stats.memories.to_string()]);
    table.add_row(["Entities", &stats.entities.to_string()]);
    table.add_row(["Sources", &stats.sources.to_string()]);
    table.add_row(["Authors", &stats.authors.to_string()]);
    println!("{table}");

    if let Some(name) = entity {
        match store.get_entity(&name).await? {
            Some(record) => {
                println!("\n{} ({} memories)", record.name, record.mention_count);
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Co-mentioned with", "Strength"]);
                for (other, strength) in record.co_mentions {
                    table.add_row([other, strength.to_string()]);
                }
                println!("{table}");
            }
            None => println!("\nNo entity named {name}"),
        }
    }
    Ok(())
}

async fn reset(store: Arc<dyn GraphMemoryStore>, yes: bool) -> Result<()> {
    if !yes {
        return Err(RecollectError::InvalidInput(
            "Refusing to reset without --yes".to_string(),
        ));
    }
    store.reset_database(true).await?;
    println!("Memory store reset");
    Ok(())
}
