use clap::{Parser, Subcommand};
use murmur_agent::AppContext;
use murmur_channels::ChannelManager;
use murmur_core::{Config, Paths};
use murmur_providers::testing::{HashEmbedder, InMemoryVectorStore, ScriptedModel};
use murmur_storage::{Database, PermissionStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Conversational agent core runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base directory (defaults to ~/.murmur)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the core runtime with adapter endpoints
    Run {
        /// WebSocket adapter bind address
        #[arg(long, default_value = "127.0.0.1:8090")]
        ws: String,

        /// HTTP adapter bind address
        #[arg(long, default_value = "127.0.0.1:8091")]
        http: String,
    },

    /// Show configuration, plugin and memory status
    Status,

    /// Manage permission nodes and grants
    Permission {
        #[command(subcommand)]
        command: PermissionCommands,
    },
}

#[derive(Subcommand)]
enum PermissionCommands {
    /// Grant a node to a user
    Grant {
        platform: String,
        user_id: String,
        node: String,
    },
    /// Revoke a node from a user
    Revoke {
        platform: String,
        user_id: String,
        node: String,
    },
    /// List a user's explicit grants
    List { platform: String, user_id: String },
    /// Check whether a user holds a node
    Check {
        platform: String,
        user_id: String,
        node: String,
    },
    /// List all registered permission nodes
    Nodes,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_paths(base_dir: Option<PathBuf>) -> Paths {
    match base_dir {
        Some(base) => Paths::with_base(base),
        None => Paths::new(),
    }
}

async fn build_context(paths: &Paths) -> murmur_core::Result<Arc<AppContext>> {
    let config = Config::load(&paths.config_file())?;
    // Concrete model/embedding/vector providers are deployment concerns;
    // without them the deterministic offline providers keep the runtime
    // usable for development and adapters.
    warn!("No external providers configured; using offline deterministic providers");
    AppContext::init(
        config,
        paths.clone(),
        Arc::new(HashEmbedder::default()),
        Arc::new(InMemoryVectorStore::new()),
        Arc::new(ScriptedModel::new("(offline) I heard you.")),
        None,
        Vec::new(),
    )
    .await
}

async fn run(paths: Paths, ws: String, http: String) -> murmur_core::Result<()> {
    let ctx = build_context(&paths).await?;
    let mut handles = ctx.start();

    let (endpoint_shutdown, _) = tokio::sync::broadcast::channel(4);
    let channels = ChannelManager::new(ctx.runtime.clone())
        .with_websocket(&ws)
        .with_http(&http);
    handles.extend(channels.start(&endpoint_shutdown)?);

    info!("murmur is running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");

    let _ = endpoint_shutdown.send(());
    ctx.shutdown().await;
    for handle in handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(12), handle).await;
    }
    Ok(())
}

async fn status(paths: Paths) -> murmur_core::Result<()> {
    let ctx = build_context(&paths).await?;
    println!("base dir: {}", ctx.paths.base.display());
    println!("config:   {}", ctx.paths.config_file().display());

    println!("\nplugins:");
    for (name, state) in ctx.host.states().await {
        println!("  {:<20} {:?}", name, state);
    }

    let stats = ctx.memory.stats().await?;
    println!("\nmemory:");
    println!("  perceptual blocks   {}", stats.perceptual_blocks);
    println!("  pending messages    {}", stats.perceptual_pending);
    println!("  short-term          {}", stats.short_term_memories);
    println!("  promotion queue     {}", stats.promotion_queue);
    println!(
        "  graph               {} nodes / {} edges / {} memories",
        stats.graph_nodes, stats.graph_edges, stats.long_term_memories
    );

    let sched = ctx.scheduler.stats().await;
    println!("\nscheduler:");
    println!("  entries             {} ({} active)", sched.total, sched.active);
    ctx.host.shutdown().await;
    Ok(())
}

fn permission(paths: Paths, command: PermissionCommands) -> murmur_core::Result<()> {
    paths.ensure_dirs()?;
    let store = PermissionStore::new(Database::open(&paths.db_file())?);
    match command {
        PermissionCommands::Grant {
            platform,
            user_id,
            node,
        } => {
            store.grant(&platform, &user_id, &node)?;
            println!("granted `{}` to {}:{}", node, platform, user_id);
        }
        PermissionCommands::Revoke {
            platform,
            user_id,
            node,
        } => {
            if store.revoke(&platform, &user_id, &node)? {
                println!("revoked `{}` from {}:{}", node, platform, user_id);
            } else {
                println!("{}:{} did not hold `{}`", platform, user_id, node);
            }
        }
        PermissionCommands::List { platform, user_id } => {
            let nodes = store.list_user(&platform, &user_id)?;
            if nodes.is_empty() {
                println!("{}:{} holds no explicit grants", platform, user_id);
            } else {
                for node in nodes {
                    println!("{}", node);
                }
            }
        }
        PermissionCommands::Check {
            platform,
            user_id,
            node,
        } => {
            let held = store.check(&platform, &user_id, &node)?;
            println!(
                "{}:{} {} `{}`",
                platform,
                user_id,
                if held { "holds" } else { "does not hold" },
                node
            );
        }
        PermissionCommands::Nodes => {
            for node in store.nodes()? {
                println!(
                    "{:<40} {:<12} default={}",
                    node.node_name,
                    node.plugin,
                    if node.default_grant { "grant" } else { "deny" }
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let paths = load_paths(cli.base_dir);

    let result = match cli.command {
        Commands::Run { ws, http } => run(paths, ws, http).await,
        Commands::Status => status(paths).await,
        Commands::Permission { command } => permission(paths, command),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
