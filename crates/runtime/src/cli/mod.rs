pub mod chat;
pub mod config;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use rb_domain::config::Config;
use rb_providers::{OpenAiProvider, ProviderClient};

/// RoomBridge: per-room turn execution for chat-room agents.
#[derive(Debug, Parser)]
#[command(name = "roombridge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send one message to a room and print the reply.
    Run {
        /// The message to send.
        message: String,
        /// Room id (defaults to "cli:run").
        #[arg(long, default_value = "cli:run")]
        room: String,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// System prompt.
        #[arg(long)]
        system: Option<String>,
    },
    /// Read messages from stdin, one per line, and answer them in one room.
    ///
    /// Lines typed while a reply is streaming go through the room's queue
    /// mode, so this is a quick way to try steering and interrupts.
    Chat {
        #[arg(long, default_value = "cli:chat")]
        room: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `RB_CONFIG` (or `config.toml`).
/// Returns the config and the path that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("RB_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = load_config_from(std::path::Path::new(&config_path))?;
    Ok((config, config_path))
}

/// Parse one config file.  A missing file yields the defaults.
pub fn load_config_from(path: &std::path::Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

/// The default provider, or the first one configured.
pub fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn ProviderClient>> {
    let llm = &config.llm;
    let selected = match &llm.default_provider {
        Some(id) => llm.providers.iter().find(|p| &p.id == id),
        None => llm.providers.first(),
    };
    let Some(provider) = selected else {
        anyhow::bail!("no LLM provider configured; add one under [[llm.providers]]");
    };
    let client = OpenAiProvider::from_config(provider, llm.request_timeout_ms)?;
    tracing::debug!(provider = %provider.id, api = %provider.api, "provider ready");
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine.max_tool_rounds, Config::default().engine.max_tool_rounds);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nmax_tool_rounds = 3\n\n[[llm.providers]]\nid = \"local\"\nbase_url = \"http://localhost:8080/v1\"\napi = \"chat_completions\""
        )
        .unwrap();
        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.engine.max_tool_rounds, 3);
        assert_eq!(config.llm.providers[0].id, "local");
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nmax_tool_rounds = ").unwrap();
        let err = load_config_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn provider_selection_needs_a_provider() {
        let err = build_provider(&Config::default()).err().unwrap();
        assert!(err.to_string().contains("no LLM provider"));
    }
}
