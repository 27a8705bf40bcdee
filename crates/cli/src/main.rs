use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client::ProtocolClient;
use protocol_core::{EventPayload, Request};
use server::config::{ProtocolConfig, DEFAULT_CONFIG_FILE};
use server::state::AppState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SERVER_URL: &str = "http://localhost:3001";

#[derive(Parser)]
#[command(name = "agent-protocol")]
#[command(about = "Serve and talk to agents over the agent protocol", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST + SSE server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite URL of the durable event store
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Write a config file with default values
    InitConfig {
        #[arg(long)]
        force: bool,
    },
    /// List the agents of a running server
    Agents {
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        url: String,
    },
    /// Send one chat message and print the run's events
    Chat {
        agent: String,
        message: String,

        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        url: String,

        /// Continue an existing thread
        #[arg(long)]
        thread: Option<uuid::Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            host,
            port,
            database_url,
        }) => serve(&cli.config, host, port, database_url).await,
        Some(Commands::InitConfig { force }) => init_config(&cli.config, force).await,
        Some(Commands::Agents { url }) => agents(&url).await,
        Some(Commands::Chat {
            agent,
            message,
            url,
            thread,
        }) => chat(&url, &agent, message, thread).await,
        None => serve(&cli.config, None, None, None).await,
    }
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    ProtocolConfig::default()
        .write(path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());

    Ok(())
}

async fn serve(
    config_path: &Path,
    host: Option<String>,
    port: Option<u16>,
    database_url: Option<String>,
) -> Result<()> {
    init_tracing();

    let mut config = ProtocolConfig::load(config_path).await?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if database_url.is_some() {
        config.storage.database_url = database_url;
    }

    let state = AppState::from_config(&config)
        .await
        .context("Failed to start agents")?;
    let agents = state.registry.names();

    println!();
    println!("Agent Protocol");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://localhost:{}", config.server.port);
    println!("  Swagger UI:  http://localhost:{}/swagger-ui", config.server.port);
    println!("  Agents:      {}", agents.join(", "));
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };
    server::serve(state, &config.bind_address(), shutdown).await?;

    Ok(())
}

async fn agents(url: &str) -> Result<()> {
    let entries = client::list_agents(url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    if entries.is_empty() {
        println!("No agents served at {}", url);
        return Ok(());
    }

    for entry in entries {
        let describe = ProtocolClient::new(format!("{}{}", url.trim_end_matches('/'), entry.path))
            .describe()
            .await;
        match describe {
            Ok(descriptor) => println!("  {:<16} {}", entry.name, descriptor.purpose),
            Err(e) => println!("  {:<16} (unavailable: {})", entry.name, e),
        }
    }

    Ok(())
}

async fn chat(url: &str, agent: &str, message: String, thread: Option<uuid::Uuid>) -> Result<()> {
    let client = ProtocolClient::new(format!("{}/{}", url.trim_end_matches('/'), agent));
    let mut request = Request::chat(message);
    request.thread_id = thread;

    let mut events = client.stream_request(&request);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = events.next_event().await {
        let event = event?;
        let indent = "  ".repeat(event.depth as usize);
        match &event.payload {
            EventPayload::RunStarted { .. } => {
                println!("run {} on thread {}", event.run_id, event.thread_id);
            }
            EventPayload::TextOutput { content } => println!("{}{}", indent, content),
            EventPayload::ToolCall { function_name, .. } => {
                println!("{}-> {}", indent, function_name)
            }
            EventPayload::ToolResult {
                function_name,
                text_result,
            } => println!("{}<- {}: {}", indent, function_name, text_result),
            EventPayload::ArtifactGenerated { name, url, .. } => {
                println!("{}[artifact] {} {}", indent, name, url)
            }
            EventPayload::Custom { name, data } => println!("{}[{}] {}", indent, name, data),
            EventPayload::WaitForInput { request_keys } => {
                let mut values = HashMap::new();
                for (key, description) in request_keys {
                    println!("{} ({}):", description, key);
                    let Some(line) = stdin.next_line().await? else {
                        bail!("stdin closed while input was requested");
                    };
                    values.insert(key.clone(), serde_json::Value::String(line));
                }
                client
                    .run(&Request::resume(event.run_id, values), false)
                    .await?;
            }
            EventPayload::RunCompleted {
                finish_reason,
                error,
            } => {
                match error {
                    Some(error) => println!("finished: {} ({})", finish_reason.as_str(), error),
                    None => println!("finished: {}", finish_reason.as_str()),
                }
                break;
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "agent_protocol=info,server=info,orchestrator=info,events=info,tower_http=info"
                    .into()
            }),
        )
        .init();
}
