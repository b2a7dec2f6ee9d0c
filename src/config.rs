use std::env;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::llm::{BackendSettings, SamplingParams};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Host to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
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

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 8000)?
            .set_default("server.host", "0.0.0.0")?;

        // 2. Config file: explicit path (flag or CONFIG_FILE), else an
        //    optional ./config.yaml in the working directory.
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        // 3. Environment variables prefixed with AGW_, e.g. AGW_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("AGW")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides (clap also resolves HOST/PORT env vars)
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

/// Backend connection plus sampling parameters, loaded from the environment
/// once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub backend: BackendSettings,
    pub sampling: SamplingParams,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings, String> {
    let base_url = env::var("LLM_BASE_URL")
        .map_err(|_| "Missing required env var: LLM_BASE_URL".to_string())?;
    if base_url.trim().is_empty() {
        return Err("LLM_BASE_URL cannot be empty".to_string());
    }

    let model =
        env::var("LLM_MODEL").map_err(|_| "Missing required env var: LLM_MODEL".to_string())?;
    if model.trim().is_empty() {
        return Err("LLM_MODEL cannot be empty".to_string());
    }

    let api_key = env::var("LLM_API_KEY").ok().filter(|s| !s.trim().is_empty());

    let agent_name = env::var("AGENT_NAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "chat".to_string());

    let timeout_secs = parse_env("LLM_TIMEOUT_SECS", 60u64)?;

    let defaults = SamplingParams::default();
    let sampling = SamplingParams {
        temperature: parse_env("LLM_TEMPERATURE", defaults.temperature)?,
        max_tokens: parse_env("LLM_MAX_TOKENS", defaults.max_tokens)?,
    };

    Ok(RuntimeSettings {
        backend: BackendSettings {
            base_url,
            api_key,
            model,
            agent_name,
            timeout: Duration::from_secs(timeout_secs),
        },
        sampling,
    })
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("Invalid value for {name}: {raw}")),
        Err(_) => Ok(default),
    }
}
