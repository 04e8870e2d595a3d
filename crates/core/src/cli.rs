//! Command-line surface. `serve` boots the daemon in this process; every
//! other subcommand is a thin `reqwest` client against the admin API of an
//! already-running `serve` instance.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "wis2watch", about = "WIS2 MQTT fleet supervisor")]
pub struct Cli {
    /// Defaults to `serve` when no subcommand is given.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host:port of a running supervisor's admin API, for non-`serve` commands.
    #[arg(long, env = "WIS2WATCH_ADMIN_URL", default_value = "http://127.0.0.1:8090")]
    pub admin_url: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the supervisor daemon: MQTT fleet, control loop, and admin API.
    Serve,
    /// Show health/status for one node.
    Status { node_id: String },
    /// Start a node's MQTT client.
    Start { node_id: String },
    /// Stop a node's MQTT client.
    Stop { node_id: String },
    /// Restart a node's MQTT client.
    Restart { node_id: String },
    /// Start every active node's MQTT client.
    StartAll,
    /// Stop every running MQTT client.
    StopAll,
    /// Show fleet-wide health reports.
    Health,
}

pub async fn run_client_command(admin_url: &str, command: Command) -> Result<()> {
    let client = reqwest::Client::new();

    let (method, path) = match &command {
        Command::Serve => unreachable!("serve is handled before dispatch"),
        Command::Status { node_id } => {
            (reqwest::Method::GET, format!("/api/nodes/{node_id}/status"))
        }
        Command::Start { node_id } => {
            (reqwest::Method::POST, format!("/api/nodes/{node_id}/start"))
        }
        Command::Stop { node_id } => {
            (reqwest::Method::POST, format!("/api/nodes/{node_id}/stop"))
        }
        Command::Restart { node_id } => {
            (reqwest::Method::POST, format!("/api/nodes/{node_id}/restart"))
        }
        Command::StartAll => (reqwest::Method::POST, "/api/fleet/start-all".to_string()),
        Command::StopAll => (reqwest::Method::POST, "/api/fleet/stop-all".to_string()),
        Command::Health => (reqwest::Method::GET, "/api/fleet/health".to_string()),
    };

    let url = format!("{}{}", admin_url.trim_end_matches('/'), path);
    let resp = client
        .request(method, &url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed — is `wis2watch serve` running?"))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("failed to parse admin API response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        anyhow::bail!("admin API returned {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from(["wis2watch", "serve"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn cli_parses_status_with_node_id() {
        let cli = Cli::try_parse_from(["wis2watch", "status", "node-a"]).unwrap();
        match cli.command {
            Some(Command::Status { node_id }) => assert_eq!(node_id, "node-a"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cli_with_no_subcommand_defaults_to_none() {
        let cli = Cli::try_parse_from(["wis2watch"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
