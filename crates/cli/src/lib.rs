use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

pub mod agent;
pub mod cache;
pub mod client;
pub mod collector;
pub mod config;
mod http_api;
pub mod server;
pub mod shutdown;

use agent::{Agent, AgentSource, KeyFileWriter};
use cache::{CacheConfig, MembershipCache};
use client::CollectorClient;
use collector::Collector;
use config::{AgentArgs, AgentMode, AgentSettings, CollectorArgs, CollectorSettings, FileConfig};
use server::{spawn_dispatcher, ServerState, Waiters};
use shutdown::Shutdown;
use sshkey_directory::GitHubDirectory;

const APP_NAME: &str = "SSH Key Provider";

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "sshkey-provider")]
#[command(about = "Manages authorized_keys files based on GitHub team membership", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll GitHub for team changes, serve keys over HTTP and notify agents
    Collector(CollectorArgs),

    /// Keep an authorized_keys file in sync with a team
    Agent(AgentArgs),

    /// Print the version
    Version,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    // hyper is noisy at debug level
    if !cli.verbose {
        builder.filter_module("hyper", log::LevelFilter::Warn);
    }
    builder.target(env_logger::Target::Stderr).init();

    if matches!(cli.command, Commands::Version) {
        return print_stdout(&format!("{APP_NAME} v{}", env!("CARGO_PKG_VERSION")));
    }

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let env = |key: &str| std::env::var(key).ok();

    match cli.command {
        Commands::Collector(args) => {
            let settings = CollectorSettings::resolve(&file, &args, &env)
                .context("Invalid collector configuration")?;
            run_collector(settings).await
        }
        Commands::Agent(args) => {
            let settings = AgentSettings::resolve(&file, &args, &env)
                .context("Invalid agent configuration")?;
            run_agent(settings).await
        }
        Commands::Version => Ok(()),
    }
}

async fn run_collector(settings: CollectorSettings) -> Result<()> {
    log::info!(
        "Starting collector [organization={}, teams={}, polling_interval={:?}, cache_ttl={:?}]",
        settings.organization,
        settings.teams.join(","),
        settings.polling_interval,
        settings.cache_ttl
    );
    if settings.github.token.is_none() {
        log::warn!("{} is not set, GitHub requests are unauthenticated", config::ENV_GITHUB_TOKEN);
    }

    let directory =
        Arc::new(GitHubDirectory::new(settings.github.clone()).context("Cannot build GitHub client")?);
    let (cache, updates) = MembershipCache::new(
        directory,
        CacheConfig {
            organization: settings.organization.clone(),
            ttl: settings.cache_ttl,
        },
    );
    let cache = Arc::new(cache);
    let waiters = Arc::new(Waiters::default());
    let dispatcher = spawn_dispatcher(updates, waiters.clone());

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signals();

    let mut collector = Collector::new(
        cache.clone(),
        settings.teams.clone(),
        settings.polling_interval,
    );
    match &settings.transport {
        Some(transport) => {
            for team in &settings.teams {
                let publisher = transport.transport_for(team)?;
                log::info!("Publishing team '{team}' on '{}'", transport.channel_for(team));
                collector = collector.with_publisher(team, Arc::new(publisher));
            }
        }
        None => log::info!("No Redis URL configured, pub/sub publishing disabled"),
    }

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("Cannot bind {}", settings.listen))?;
    let base_url = format!("http://{}", listener.local_addr()?);
    print_stdout(&format!("Serving keys: {base_url}/keys?team=<team>"))?;
    print_stdout(&format!("Status endpoint: {base_url}/status"))?;

    let state = Arc::new(ServerState {
        cache,
        waiters,
        status: settings.status.clone(),
        default_timeout: settings.longpoll_timeout,
        shutdown: shutdown.subscribe(),
    });
    let collector_task = tokio::spawn(collector.run(shutdown.subscribe()));

    let served = server::serve(listener, state, shutdown.subscribe()).await;
    shutdown.trigger();
    collector_task.await.context("Collector task panicked")?;
    dispatcher.abort();
    served.context("HTTP server failed")?;

    log::info!("Shutdown complete, exiting now");
    Ok(())
}

async fn run_agent(settings: AgentSettings) -> Result<()> {
    let shutdown = Shutdown::new();
    shutdown.trigger_on_signals();

    let writer = KeyFileWriter::new(&settings.authorized_keys_path, settings.missing_file);
    let client = settings
        .collector_url
        .as_deref()
        .map(|url| CollectorClient::new(url, settings.poll_timeout))
        .transpose()
        .context("Cannot build collector client")?;

    let source = match settings.mode {
        AgentMode::Push => {
            let transport = settings
                .transport
                .as_ref()
                .context("push mode needs a Redis URL")?;
            log::info!("Listening on '{}'", transport.channel_for(&settings.team));
            AgentSource::Push {
                transport: Arc::new(transport.transport_for(&settings.team)?),
                bootstrap: client,
            }
        }
        AgentMode::Poll => AgentSource::Poll {
            client: client.context("poll mode needs a collector URL")?,
        },
    };

    Agent::new(settings.team, writer, source, settings.recover_interval)
        .run(shutdown.subscribe())
        .await;
    log::info!("Shutdown complete, exiting now");
    Ok(())
}
