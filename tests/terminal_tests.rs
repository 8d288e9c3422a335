// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use std::path::PathBuf;

use tempfile::TempDir;

use agentlink::config::TerminalConfig;
use agentlink::error::SandboxError;
use agentlink::terminal::{
    SessionOptions, SessionStatus, TerminalCommand, TerminalSession, TerminalSessionManager,
};

fn active_session(config: TerminalConfig, dir: &TempDir) -> TerminalSession {
    let session = TerminalSession::new("s", config);
    session
        .initialize(SessionOptions::in_directory(dir.path()))
        .unwrap();
    session
}

#[tokio::test]
async fn test_allow_list_rejects_rm() {
    let dir = TempDir::new().unwrap();
    let session = active_session(
        TerminalConfig {
            allowed_commands: vec!["ls".to_string(), "pwd".to_string()],
            ..TerminalConfig::default()
        },
        &dir,
    );

    let result = session
        .execute_command(TerminalCommand::new("rm -rf /"))
        .await;
    assert!(matches!(result, Err(SandboxError::CommandNotAllowed(cmd)) if cmd == "rm"));

    let ok = session.execute_command(TerminalCommand::new("pwd")).await.unwrap();
    assert_eq!(ok.exit_code, 0);
}

#[tokio::test]
async fn test_restricted_path_rejects_argument() {
    let dir = TempDir::new().unwrap();
    let session = active_session(
        TerminalConfig {
            restricted_paths: vec![PathBuf::from("/etc")],
            ..TerminalConfig::default()
        },
        &dir,
    );

    let result = session
        .execute_command(TerminalCommand::new("ls").with_args(["/etc/passwd"]))
        .await;
    assert!(matches!(result, Err(SandboxError::AccessDenied(_))));

    let traversal = session
        .execute_command(TerminalCommand::new("cat /tmp/../etc/hosts"))
        .await;
    assert!(matches!(traversal, Err(SandboxError::AccessDenied(_))));

    let sibling = session
        .execute_command(TerminalCommand::new("ls").with_args(["/etcetera"]))
        .await;
    assert!(!matches!(sibling, Err(SandboxError::AccessDenied(_))));
}

#[tokio::test]
async fn test_command_runs_in_session_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let session = active_session(TerminalConfig::default(), &dir);

    let response = session
        .execute_command(TerminalCommand::new("ls"))
        .await
        .unwrap();
    assert!(response.success());
    assert!(response.stdout.contains("marker.txt"));
    assert_eq!(session.get_command_history(), vec!["ls".to_string()]);
}

#[tokio::test]
async fn test_suspended_session_rejects_commands() {
    let dir = TempDir::new().unwrap();
    let session = active_session(TerminalConfig::default(), &dir);
    session.suspend().unwrap();

    let result = session.execute_command(TerminalCommand::new("pwd")).await;
    assert_eq!(
        result,
        Err(SandboxError::SessionNotActive(SessionStatus::Suspended))
    );

    session.resume().unwrap();
    assert!(session
        .execute_command(TerminalCommand::new("pwd"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_timeout_reports_exit_minus_one() {
    let dir = TempDir::new().unwrap();
    let session = active_session(TerminalConfig::default(), &dir);

    let response = session
        .execute_command(TerminalCommand::new("sleep").with_args(["5"]).with_timeout(100))
        .await
        .unwrap();
    assert_eq!(response.exit_code, -1);
    assert!(response.stderr.contains("timed out after 100 ms"));
    assert_eq!(session.state().active_processes, 0);
}

#[test]
fn test_manager_lifecycle() {
    let dir = TempDir::new().unwrap();
    let manager = TerminalSessionManager::new(TerminalConfig::default());
    manager
        .create_session("one", SessionOptions::in_directory(dir.path()))
        .unwrap();
    manager
        .create_session("two", SessionOptions::in_directory(dir.path()))
        .unwrap();

    assert_eq!(manager.get_active_sessions(), vec!["one", "two"]);
    manager.terminate_session("one").unwrap();
    assert_eq!(manager.get_active_sessions(), vec!["two"]);
    assert_eq!(manager.terminate_all_sessions(), 1);
    assert!(manager.get_session_states().is_empty());
}
