use clap::Parser;
use tracing_subscriber::EnvFilter;

use rb_domain::config::LoggingConfig;
use rb_runtime::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = rb_runtime::cli::load_config()?;
            if !rb_runtime::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _) = rb_runtime::cli::load_config()?;
            print!("{}", rb_runtime::cli::config::render(&config)?);
            Ok(())
        }
        Command::Run { message, room, model, system } => {
            let (config, _) = rb_runtime::cli::load_config()?;
            init_tracing(&config.logging);
            rb_runtime::cli::chat::run(config, message, room, model, system).await
        }
        Command::Chat { room, model, system } => {
            let (config, _) = rb_runtime::cli::load_config()?;
            init_tracing(&config.logging);
            rb_runtime::cli::chat::chat(config, room, model, system).await
        }
        Command::Version => {
            println!("roombridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Logs go to stderr so stdout carries only the reply.
fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rb_runtime=debug"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
