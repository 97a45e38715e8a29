//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, `./config.yaml`, the file
//! named by `--config` / `CONFIG_FILE`, `FORGE_`-prefixed environment
//! variables (`FORGE_SERVER__PORT=8080`), then explicit CLI flags.
//!
//! Provider credentials are read from each provider's conventional variable
//! (`GEMINI_API_KEY`, `OPENAI_API_KEY`, ...) unless the config sets one.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::artifact::ArtifactSection;
use crate::llm::ProviderKind;
use crate::llm::background::PollerConfig;
use crate::llm::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP/SSE server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },
    /// Generate one artifact version and stream it to stdout
    Generate(GenerateArgs),
    /// Estimate and count the tokens of a text
    CountTokens {
        #[arg(long, short)]
        provider: Option<ProviderKind>,
        #[arg(long, short)]
        model: Option<String>,
        /// Text to count; reads stdin when omitted
        text: Option<String>,
    },
    /// List the models a provider offers
    Models {
        #[arg(long, short)]
        provider: Option<ProviderKind>,
        /// Ignore the cached list
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Artifact section to write
    #[arg(long, short, default_value = "research")]
    pub section: ArtifactSection,
    #[arg(long, short)]
    pub provider: Option<ProviderKind>,
    #[arg(long, short)]
    pub model: Option<String>,
    /// System instruction
    #[arg(long)]
    pub system: Option<String>,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub top_p: Option<f32>,
    #[arg(long)]
    pub top_k: Option<u32>,
    #[arg(long)]
    pub seed: Option<i64>,
    #[arg(long = "stop")]
    pub stop_sequences: Vec<String>,
    #[arg(long)]
    pub max_output_tokens: Option<u32>,
    #[arg(long)]
    pub thinking_budget: Option<u32>,
    /// Enable provider-side web search
    #[arg(long)]
    pub grounding: bool,
    /// Artifact store JSON file to load and update
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// Prompt text; reads stdin when omitted
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    pub default_provider: ProviderKind,
    #[serde(default)]
    pub default_model: Option<String>,
    pub chars_per_token: f64,
    pub catalog_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub poller: PollerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub groq: ProviderConfig,
}

/// Per-provider overrides.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Replaces the provider's public endpoint (proxies, tests).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProvidersConfig {
    #[must_use]
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::OpenRouter => &self.openrouter,
            ProviderKind::Groq => &self.groq,
        }
    }

    /// Configured key, else the provider's environment variable.
    #[must_use]
    pub fn credential(&self, kind: ProviderKind) -> Option<String> {
        self.get(kind)
            .api_key
            .clone()
            .or_else(|| std::env::var(kind.credential_env()).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

impl GenerationConfig {
    /// Model to use when a request names none.
    #[must_use]
    pub fn model_for(&self, kind: ProviderKind) -> String {
        if kind == self.default_provider
            && let Some(model) = &self.default_model
        {
            return model.clone();
        }
        kind.descriptor()
            .models
            .first()
            .map(|m| m.id.clone())
            .unwrap_or_default()
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("generation.default_provider", ProviderKind::Gemini.id())?
            .set_default("generation.chars_per_token", 4.0)?
            .set_default("generation.catalog_ttl_secs", 3600)?;

        builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false));
        if let Some(path) = &cli.config {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(file_format(path))
                    .required(true),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("FORGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(Command::Serve { port, host }) = &cli.command {
            if let Some(port) = port {
                builder = builder.set_override("server.port", i64::from(*port))?;
            }
            if let Some(host) = host {
                builder = builder.set_override("server.host", host.as_str())?;
            }
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}
