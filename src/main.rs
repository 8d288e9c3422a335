// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! agentlink - remote terminal and messaging gateway
//!
//! Entry point for the agentlink CLI application.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use agentlink::auth::AuthenticationService;
use agentlink::cli::{Cli, Commands, ServeArgs, SettingsArgs, SettingsCommands, SettingsFormat};
use agentlink::config::{AuthConfig, Settings};
use agentlink::error::{AgentLinkError, Result};
use agentlink::gateway::RemoteGateway;
use agentlink::queue::MessageQueue;
use agentlink::terminal::{SessionOptions, TerminalSessionManager};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());

    if cli.verbose > 0 {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        if let Ok(parsed) = format!("agentlink={}", level).parse() {
            env_filter = env_filter.add_directive(parsed);
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings_path = cli.config.clone().unwrap_or_else(Settings::default_path);
    let settings = Settings::load_from(&settings_path)?;

    match cli.command {
        Commands::Serve(args) => run_serve(args, settings).await,
        Commands::Settings(args) => run_settings(args, settings, settings_path),
    }
}

async fn run_serve(args: ServeArgs, settings: Settings) -> Result<()> {
    settings.validate()?;

    let auth = Arc::new(AuthenticationService::new(AuthConfig {
        token_secret: settings.token_secret(),
        ..settings.auth.clone()
    }));
    auth.start_cleanup_task();

    let sessions = Arc::new(TerminalSessionManager::new(settings.terminal.clone()));
    let directory = match args.directory {
        Some(directory) => directory,
        None => std::env::current_dir()?,
    };
    sessions.create_session(
        &settings.server.default_session,
        SessionOptions::in_directory(directory),
    )?;

    if let Some(agent_id) = &args.agent {
        let token = auth.generate_token_from_names(agent_id, &args.permissions)?;
        println!("{}", token);
    }

    let bind = args.bind.unwrap_or_else(|| settings.bind_address());
    let listener = TcpListener::bind(&bind).await?;
    eprintln!(
        "agentlink listening on ws://{} (session: {})",
        listener.local_addr()?,
        settings.server.default_session
    );

    let queue = MessageQueue::start(settings.queue.clone());
    let gateway = Arc::new(
        RemoteGateway::new(Arc::clone(&auth), Arc::clone(&sessions)).with_queue(queue.clone()),
    );
    let served = tokio::select! {
        result = gateway.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };

    sessions.terminate_all_sessions();
    queue.shutdown();
    auth.shutdown();
    served.map_err(AgentLinkError::from)
}

fn run_settings(args: SettingsArgs, settings: Settings, path: PathBuf) -> Result<()> {
    match args.command {
        None => print_settings(&settings, SettingsFormat::Json),
        Some(SettingsCommands::Show { format }) => print_settings(&settings, format),
        Some(SettingsCommands::Path) => {
            println!("{}", path.display());
            Ok(())
        }
        Some(SettingsCommands::Init { force }) => {
            if path.exists() && !force {
                return Err(AgentLinkError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            Settings::default().save_to(&path)?;
            println!("Wrote default settings to {}", path.display());
            Ok(())
        }
    }
}

fn print_settings(settings: &Settings, format: SettingsFormat) -> Result<()> {
    let rendered = match format {
        SettingsFormat::Json => serde_json::to_string_pretty(settings)?,
        SettingsFormat::Toml => toml::to_string_pretty(settings)?,
    };
    println!("{}", rendered);
    Ok(())
}
