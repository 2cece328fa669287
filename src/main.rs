use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use watchhub::{
    Bus, BranchWatcher, Event, EventHub, NotifyPrimitive, RecursiveRegistrar, Settings,
    WatchError, WatchPrimitive, WatchSupervisor,
};

#[derive(Parser)]
#[command(name = "watchhub", version)]
#[command(about = "Watch directory trees and files and print typed change events")]
struct Cli {
    /// Configuration file (defaults to .watchhub/settings.toml)
    #[arg(long, global = true, env = "WATCHHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory tree and print every event until Ctrl-C
    Watch {
        /// Root of the tree to watch
        root: PathBuf,

        /// Keep this file watched across deletes and atomic saves (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Report branch switches of the git repository at this path
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow!("failed to load configuration: {e}"))?;

    watchhub::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Watch { root, files, repo } => watch(settings, root, files, repo).await,
    }
}

async fn watch(
    settings: Settings,
    root: PathBuf,
    files: Vec<PathBuf>,
    repo: Option<PathBuf>,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let primitive: Arc<dyn WatchPrimitive> = Arc::new(NotifyPrimitive::new());

    let hub = EventHub::new(&shutdown, primitive.clone(), settings.bus.options("hub"));
    let registrar = RecursiveRegistrar::new(
        primitive,
        Bus::new(&shutdown, settings.bus.options("registrar")),
        &settings.watcher,
    );

    let (_, hub_events) = hub.subscribe_all();
    let (registrar_events, _registrar_subscription) = registrar.subscribe();
    print_events(hub_events);
    print_events(registrar_events);

    registrar
        .add_file_watch(&root)
        .with_context(|| format!("cannot watch {}", root.display()))?;

    match registrar.add_recursive_watches(&root) {
        Ok(added) => {
            watchhub::log_event!(
                "watch",
                "monitoring",
                "{} ({} subdirectories)",
                root.display(),
                added.len()
            );
        }
        Err(e) if e.is_admission_denied() => {
            tracing::warn!(
                "[watch] {e}; watching only the top level of {}",
                root.display()
            );
        }
        Err(e) => return Err(e.into()),
    }

    let backoff = settings.supervisor.backoff();
    let supervisors = files
        .into_iter()
        .map(|file| {
            let supervisor = WatchSupervisor::new(hub.clone(), file, backoff)?;
            supervisor.start();
            Ok(supervisor)
        })
        .collect::<Result<Vec<_>, WatchError>>()?;

    let branch = repo
        .map(|repo| BranchWatcher::start(hub.clone(), &repo, backoff))
        .transpose()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    watchhub::log_event!("watch", "shutting down");

    if let Some(branch) = &branch {
        branch.shutdown();
    }
    for supervisor in &supervisors {
        supervisor.shutdown();
    }
    shutdown.cancel();
    registrar.close();
    hub.close();

    Ok(())
}

fn print_events(events: Receiver<Event>) {
    std::thread::spawn(move || {
        for event in events.iter() {
            println!("{event}");
        }
    });
}
