//! toolrelay - Tool-call plugin dispatcher
//!
//! This is the main entry point for the toolrelay binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

mod cli;
mod completion;
mod config;
mod conversation;
mod error;
mod logging;
mod plugins;

use cli::{Args, Command};
use completion::{ChatMessage, HttpCompletionService};
use config::{Config, PluginConfig};
use conversation::ConversationReinjector;
use error::RelayError;
use logging::ToolAuditLogger;
use plugins::{PluginDependencies, PluginRegistry, ToolExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.debug);

    info!("Starting toolrelay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            Config::default()
        }
    };
    if let Some(dir) = args.plugins {
        config.plugins.directory = dir;
    }
    config.validate().map_err(RelayError::from)?;

    let registry = match load_registry(&config.plugins).await {
        Ok(registry) => registry,
        Err(e) => {
            // Only the plugin subsystem is lost; everything else keeps working
            error!("{}", e);
            PluginRegistry::empty()
        }
    };
    let registry = Arc::new(registry);

    let audit = Arc::new(ToolAuditLogger::new(config.audit.clone()));
    let executor = Arc::new(
        ToolExecutor::new(Arc::clone(&registry), &config.plugins).with_audit(Arc::clone(&audit)),
    );

    let outcome = match args.command {
        Command::Tools => {
            print_tools(&registry);
            Ok(())
        }
        Command::Run { input } => run_tools(&executor, &audit, input).await,
        Command::Chat { message, system } => {
            chat(&config, executor, audit, message, system).await
        }
    };

    registry.shutdown().await;
    info!("toolrelay exited");
    outcome.map_err(Into::into)
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn load_registry(config: &PluginConfig) -> error::Result<PluginRegistry> {
    if !config.enabled {
        info!("Plugins disabled");
        return Ok(PluginRegistry::empty());
    }

    let deps = PluginDependencies {
        project_base_path: config.base_path(),
        plugin_root: config.directory.clone(),
        session_id: ToolAuditLogger::session_id().to_string(),
    };
    let registry = PluginRegistry::load_all(
        &config.directory,
        &config.manifest_file,
        &plugins::builtin_catalog(),
        &deps,
    )
    .await?;
    Ok(registry)
}

fn print_tools(registry: &PluginRegistry) {
    let names = registry.tool_names();
    if names.is_empty() {
        println!("No tools available");
    } else {
        println!("Tools:");
        for name in names {
            if let Some(plugin) = registry.resolve(name) {
                println!(
                    "  {:<24} {} ({})",
                    name,
                    plugin.name(),
                    plugin.protocol()
                );
            }
        }
    }

    let failed = registry.failed_plugins();
    if !failed.is_empty() {
        println!("Failed plugins:");
        for (name, error) in failed {
            println!("  {:<24} {}", name, error);
        }
    }
}

async fn run_tools(
    executor: &ToolExecutor,
    audit: &ToolAuditLogger,
    input: Option<PathBuf>,
) -> error::Result<()> {
    let text = match input {
        Some(path) => tokio::fs::read_to_string(&path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let parsed = plugins::parse(&text);
    for span in &parsed.malformed {
        audit.log_malformed(&span.reason.to_string());
    }
    if !parsed.malformed.is_empty() {
        eprintln!("Skipped {} malformed tool request(s)", parsed.malformed.len());
    }
    if parsed.requests.is_empty() {
        eprintln!("No tool requests found");
        return Ok(());
    }

    let report = executor.execute(&parsed.requests).await;
    println!("{}", report.rendered);
    Ok(())
}

async fn chat(
    config: &Config,
    executor: Arc<ToolExecutor>,
    audit: Arc<ToolAuditLogger>,
    message: String,
    system: Option<String>,
) -> error::Result<()> {
    let api_key = config.get_api_key();
    if api_key.is_none() {
        warn!("No API key in {}", config.completion.api_key_env);
    }
    let service = HttpCompletionService::new(config.completion.clone(), api_key)?;

    let mut system_prompt = system.unwrap_or_default();
    let tools = executor.registry().describe_tools();
    if !tools.is_empty() {
        if !system_prompt.is_empty() {
            system_prompt.push_str("\n\n");
        }
        system_prompt.push_str(&tools);
    }

    let mut messages = Vec::new();
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.push(ChatMessage::user(message));

    let reinjector = ConversationReinjector::new(Arc::new(service), executor).with_audit(audit);
    let outcome = reinjector.run_turn(messages).await?;

    if let Some(report) = &outcome.report {
        info!("Turn used {} tool call(s)", report.results.len());
    }
    debug!("Conversation ended with {} message(s)", outcome.messages.len());
    println!("{}", outcome.final_response);
    Ok(())
}
