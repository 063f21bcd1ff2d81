use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hydra_mcp::mcp_client::{ManagerOptions, McpClientManager};
use hydra_mcp::LogTarget;

#[derive(Parser)]
#[command(name = "hydra-mcp")]
#[command(about = "Connect to MCP tool servers and inspect or call their tools", long_about = None)]
struct Cli {
    /// Config file (defaults to $HYDRA_MCP_CONFIG or ~/.hydra/mcp-servers.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled server and show its status
    Status,

    /// List the tools of every connected server
    Tools {
        /// Only show tools from this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Call a tool by qualified id (mcp__server__tool)
    Call {
        tool_id: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Probe server health
    Check {
        /// Only probe this server
        server: Option<String>,
    },

    /// Validate the config file without connecting
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    hydra_mcp::init_tracing(if cli.log_file {
        LogTarget::File
    } else {
        LogTarget::Stderr
    });

    let auto_connect = !matches!(cli.command, Commands::Validate);
    let manager = McpClientManager::new(ManagerOptions {
        config_path: cli.config.clone(),
        auto_connect,
        ..ManagerOptions::default()
    });
    manager
        .initialize()
        .await
        .with_context(|| format!("failed to load {}", manager.config_path().display()))?;

    let outcome = run(&manager, cli.command, cli.json).await;
    manager.shutdown().await;
    outcome
}

async fn run(manager: &McpClientManager, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Status => {
            let servers = manager.servers().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&servers)?);
                return Ok(());
            }
            for s in servers {
                let detail = s.last_error.as_deref().unwrap_or("");
                println!(
                    "{:<20} {:<6} {:<13} tools={:<3} {}",
                    s.id, s.transport, s.state, s.tool_count, detail
                );
            }
        }

        Commands::Tools { server } => {
            let tools: Vec<_> = manager
                .list_tools()
                .await
                .into_iter()
                .filter(|t| server.as_deref().map_or(true, |s| t.server_id == s))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
                return Ok(());
            }
            for t in tools {
                let description = t.tool.description.as_deref().unwrap_or("");
                println!("{:<40} {}", t.qualified_id, description);
            }
        }

        Commands::Call { tool_id, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = manager.execute_tool_by_id(&tool_id, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Check { server } => {
            let ids = match server {
                Some(id) => vec![id],
                None => manager.servers().await.into_iter().map(|s| s.id).collect(),
            };
            let mut results = Vec::new();
            for id in ids {
                let result = manager
                    .check_health(&id, true)
                    .await
                    .with_context(|| format!("unknown server: {id}"))?;
                results.push((id, result));
            }
            if json {
                let map: std::collections::BTreeMap<_, _> = results.into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
                return Ok(());
            }
            for (id, r) in results {
                let latency = r
                    .response_time_ms
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<9} {:>7} {}",
                    id,
                    r.status,
                    latency,
                    r.error.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Validate => {
            let stats = manager.registry_stats().await;
            println!(
                "{}: ok ({} servers)",
                manager.config_path().display(),
                stats.total
            );
        }
    }
    Ok(())
}
