//! Artifact Forge
//!
//! Entry point: the HTTP/SSE server plus one-shot CLI commands.

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::default_trait_access)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use artifact_forge::artifact::ArtifactVersionStore;
use artifact_forge::config::{AppConfig, Cli, Command, GenerateArgs};
use artifact_forge::llm::{GenerationOutcome, GenerationRequest, ProviderKind, SamplingSettings};
use artifact_forge::normalized::StreamEvent;
use artifact_forge::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (M-LOG-STRUCTURED). Stdout carries generated text.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("Configuration error")?;

    info!(
        name: "config.loaded",
        default_provider = %config.generation.default_provider,
        retry_attempts = config.generation.retry.max_attempts,
        "Configuration loaded"
    );

    match cli.command {
        None | Some(Command::Serve { .. }) => server::start_server(Arc::new(config)).await,
        Some(Command::Generate(args)) => run_generate(&config, args).await,
        Some(Command::CountTokens { provider, model, text }) => {
            run_count_tokens(&config, provider, model, text).await
        }
        Some(Command::Models { provider, refresh }) => run_models(&config, provider, refresh).await,
    }
}

fn read_stdin() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input)
}

async fn run_generate(config: &AppConfig, args: GenerateArgs) -> anyhow::Result<()> {
    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => read_stdin()?,
    };
    anyhow::ensure!(!prompt.trim().is_empty(), "Prompt is empty");

    let store = match &args.store {
        Some(path) => ArtifactVersionStore::load(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ArtifactVersionStore::new(),
    };

    let state = server::build_state(config);
    let project = state.projects.create_from("cli", store);
    let coordinator = project.coordinator().clone();

    let provider = args.provider.unwrap_or(config.generation.default_provider);
    let model = args
        .model
        .unwrap_or_else(|| config.generation.model_for(provider));
    let sampling = SamplingSettings {
        temperature: args.temperature.unwrap_or(SamplingSettings::default().temperature),
        top_p: args.top_p.unwrap_or(SamplingSettings::default().top_p),
        top_k: args.top_k,
        seed: args.seed,
        stop_sequences: args.stop_sequences,
        max_output_tokens: args.max_output_tokens,
    };
    let mut request = GenerationRequest::new(prompt, model)
        .with_sampling(sampling)
        .with_grounding(args.grounding)
        .with_thinking_budget(args.thinking_budget);
    if let Some(system) = args.system {
        request = request.with_system_instruction(system);
    }

    let interrupt = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.cancel();
            }
        })
    };

    let mut stdout = std::io::stdout();
    let outcome = coordinator
        .run(args.section, provider, request, |event| match event {
            StreamEvent::Chunk { text } => {
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            StreamEvent::Status { message } => eprintln!("[{message}]"),
            StreamEvent::Done { sources, .. } => {
                let _ = writeln!(stdout);
                for source in sources {
                    eprintln!("source: {} <{}>", source.title, source.uri);
                }
            }
            StreamEvent::Error { .. } => {}
        })
        .await;
    interrupt.abort();

    match outcome {
        GenerationOutcome::Committed { index } => {
            let snapshot = project.snapshot().await;
            info!(
                name: "generation.committed",
                section = %args.section,
                index,
                label = %snapshot.artifacts.version_label(args.section),
                input_tokens = snapshot.usage.input,
                output_tokens = snapshot.usage.output,
                estimated_cost = snapshot.usage.estimated_cost,
                "Generation committed"
            );
            if let Some(path) = &args.store {
                snapshot
                    .artifacts
                    .save(path)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            Ok(())
        }
        GenerationOutcome::Cancelled { partial_text } => {
            eprintln!();
            anyhow::bail!("Generation cancelled after {} characters", partial_text.len())
        }
        GenerationOutcome::Failed(err) => Err(err).context("Generation failed"),
    }
}

async fn run_count_tokens(
    config: &AppConfig,
    provider: Option<ProviderKind>,
    model: Option<String>,
    text: Option<String>,
) -> anyhow::Result<()> {
    let text = match text {
        Some(text) => text,
        None => read_stdin()?,
    };
    let state = server::build_state(config);
    let provider = provider.unwrap_or(config.generation.default_provider);
    let model = model.unwrap_or_else(|| config.generation.model_for(provider));
    let adapter = state.registry.get(provider)?;

    println!("estimate: {}", state.estimator.estimate(&text));
    println!(
        "exact:    {}",
        state.estimator.exact_count(adapter.as_ref(), &text, &model).await
    );
    Ok(())
}

async fn run_models(
    config: &AppConfig,
    provider: Option<ProviderKind>,
    refresh: bool,
) -> anyhow::Result<()> {
    let state = server::build_state(config);
    let provider = provider.unwrap_or(config.generation.default_provider);
    let adapter = state.registry.get(provider)?;

    let models = if refresh {
        state.catalog.refetch(adapter.as_ref()).await?
    } else {
        state.catalog.models(adapter.as_ref()).await
    };
    for model in models {
        println!(
            "{:<48} ${:>7.2} in  ${:>7.2} out  per 1M tokens",
            model.id, model.input_per_million, model.output_per_million
        );
    }
    Ok(())
}
