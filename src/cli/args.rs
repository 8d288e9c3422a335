// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! CLI argument definitions using Clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// agentlink - remote terminal and messaging gateway for agents
#[derive(Parser, Debug)]
#[command(name = "agentlink")]
#[command(version, about = "Remote terminal and messaging gateway for agents")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file path (.json or .toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the websocket gateway
    Serve(ServeArgs),

    /// Show or initialize settings
    #[command(alias = "config")]
    Settings(SettingsArgs),
}

/// Arguments for `serve`
#[derive(Parser, Debug, Default)]
pub struct ServeArgs {
    /// Address to listen on (overrides settings and AGENTLINK_BIND)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Issue a bootstrap token for this agent id
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Permissions for the bootstrap token
    #[arg(short, long, value_delimiter = ',', default_value = "execute")]
    pub permissions: Vec<String>,

    /// Working directory of the default session
    #[arg(short = 'C', long)]
    pub directory: Option<PathBuf>,
}

/// Arguments for `settings`
#[derive(Parser, Debug, Default)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: Option<SettingsCommands>,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Print the effective settings
    Show {
        #[arg(long, default_value = "json")]
        format: SettingsFormat,
    },

    /// Print the settings file path
    Path,

    /// Write default settings to the settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SettingsFormat {
    #[default]
    Json,
    Toml,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["agentlink", "serve"]);
        assert_eq!(cli.verbose, 0);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.bind.is_none());
        assert!(args.agent.is_none());
        assert_eq!(args.permissions, vec!["execute".to_string()]);
    }

    #[test]
    fn test_serve_with_agent_and_permissions() {
        let cli = Cli::parse_from([
            "agentlink",
            "-v",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--agent",
            "builder",
            "--permissions",
            "read,execute",
        ]);
        assert_eq!(cli.verbose, 1);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.agent.as_deref(), Some("builder"));
        assert_eq!(args.permissions, vec!["read", "execute"]);
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::parse_from(["agentlink", "settings", "--config", "/tmp/a.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));
        assert!(matches!(
            cli.command,
            Commands::Settings(SettingsArgs { command: None })
        ));
    }

    #[test]
    fn test_settings_subcommands() {
        let cli = Cli::parse_from(["agentlink", "config", "show", "--format", "toml"]);
        assert!(matches!(
            cli.command,
            Commands::Settings(SettingsArgs {
                command: Some(SettingsCommands::Show {
                    format: SettingsFormat::Toml
                })
            })
        ));

        let cli = Cli::parse_from(["agentlink", "settings", "init", "--force"]);
        assert!(matches!(
            cli.command,
            Commands::Settings(SettingsArgs {
                command: Some(SettingsCommands::Init { force: true })
            })
        ));
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Cli::try_parse_from(["agentlink"]).is_err());
    }
}
