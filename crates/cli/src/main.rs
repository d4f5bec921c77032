use std::sync::Arc;

use {
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    beeline_broker::{AgentBus, BrokerConfig, MessageHandler},
    beeline_protocol::{Agent, ChatMessage, RunOptions},
};

#[derive(Parser)]
#[command(name = "beeline", about = "beeline — queue-mediated agent pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Broker host.
    #[arg(long, global = true, default_value = "localhost")]
    host: String,
    /// Broker port.
    #[arg(long, global = true, default_value_t = 5672)]
    port: u16,
    /// Broker username.
    #[arg(long, global = true, default_value = "guest")]
    username: String,
    /// Broker password.
    #[arg(long, global = true, default_value = "guest")]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register agents and consume their queues until ctrl-c.
    Worker {
        /// Agent name; repeat for multiple agents.
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
    },
    /// Queue a task on an agent's own inbox.
    Send {
        #[arg(long)]
        agent: String,
        #[arg(short, long)]
        message: String,
        /// Model override carried in the envelope.
        #[arg(long)]
        model: Option<String>,
        /// Turn bound carried in the envelope (unbounded when omitted).
        #[arg(long)]
        max_turns: Option<u64>,
    },
    /// Hand a conversation from one agent to another.
    Handoff {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        message: String,
    },
    /// Register the named agents and print their live queue stats.
    Queues {
        /// Agent name; repeat for multiple agents.
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn print_handler(agent: String) -> MessageHandler {
    Arc::new(move |envelope| {
        let agent = agent.clone();
        Box::pin(async move {
            println!("=== {agent} received ===");
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(())
        })
    })
}

async fn run_worker(config: BrokerConfig, agents: Vec<String>) -> anyhow::Result<()> {
    let bus = Arc::new(AgentBus::connect(config).await?);
    let agents: Vec<Agent> = agents
        .into_iter()
        .map(|name| Agent::new(name, ""))
        .collect();
    let registered = bus.register_agents(&agents).await;
    info!(count = registered.len(), "agents registered");

    let mut workers = tokio::task::JoinSet::new();
    for agent in agents {
        let bus = Arc::clone(&bus);
        let handler = print_handler(agent.name.clone());
        workers.spawn(async move {
            if let Err(error) = bus.start_consuming(&agent, handler).await {
                warn!(agent = %agent.name, %error, "consumer exited");
            }
        });
    }

    info!("workers running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    bus.shutdown();
    while workers.join_next().await.is_some() {}
    bus.close().await;
    Ok(())
}

async fn run_send(
    config: BrokerConfig,
    agent: String,
    message: String,
    model: Option<String>,
    max_turns: Option<u64>,
) -> anyhow::Result<()> {
    let bus = AgentBus::connect(config).await?;
    let receipt = bus
        .run(
            &Agent::new(agent, ""),
            vec![ChatMessage::user(message)],
            serde_json::Map::new(),
            RunOptions {
                model,
                max_turns,
                ..RunOptions::default()
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    bus.close().await;
    Ok(())
}

async fn run_handoff(
    config: BrokerConfig,
    from: String,
    to: String,
    message: String,
) -> anyhow::Result<()> {
    let bus = AgentBus::connect(config).await?;
    bus.handoff(
        &Agent::new(from, ""),
        &Agent::new(to, ""),
        vec![ChatMessage::user(message)],
        serde_json::Map::new(),
    )
    .await?;
    bus.close().await;
    Ok(())
}

async fn run_queues(config: BrokerConfig, agents: Vec<String>) -> anyhow::Result<()> {
    let bus = AgentBus::connect(config).await?;
    for name in agents {
        bus.register_agent(&Agent::new(name, "")).await?;
    }
    let report = bus.debug_queues().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    bus.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = BrokerConfig {
        host: cli.host.clone(),
        port: cli.port,
        username: cli.username.clone(),
        password: cli.password.clone(),
    };

    match cli.command {
        Commands::Worker { agents } => run_worker(config, agents).await,
        Commands::Send {
            agent,
            message,
            model,
            max_turns,
        } => run_send(config, agent, message, model, max_turns).await,
        Commands::Handoff { from, to, message } => run_handoff(config, from, to, message).await,
        Commands::Queues { agents } => run_queues(config, agents).await,
    }
}
