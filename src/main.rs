use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use lxp_sync::config::Config;
use lxp_sync::entity::entity_record;
use lxp_sync::intercept::{is_reserved_store, FetchOutcome};
use lxp_sync::model::{Operation, QueueStatus};
use lxp_sync::notify::ClientChannel;
use lxp_sync::queue::SubmitOutcome;
use lxp_sync::runtime::Runtime;
use lxp_sync::store::DurableStore;
use lxp_sync::transport::Request;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "lxp-sync")]
#[command(about = "Offline-first cache and mutation queue for learning platform portals")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lxp-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queue counts and registered sync tags
  Status,
  /// Request a path through the interception layer
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Submit a write: create, update or delete
  Submit {
    operation: Operation,
    store: String,
    /// JSON payload
    payload: String,
  },
  /// Run a drain cycle for one tag, or for every registered tag
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Watch connectivity and drain whenever the server is reachable
  Watch,
  /// List writes that gave up or need a decision
  DeadLetters,
  /// Put a dead-lettered write back in the queue
  Retry { id: Uuid },
  /// Delete synced writes from the queue
  Purge,
  /// Register a sync tag
  Register { tag: String },
  /// Show the local view of one entity
  Entity { store: String, id: String },
  /// Fetch the configured precache routes into the cache
  Precache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config, args.log_stderr)?;

  let runtime = Runtime::from_config(&config)?;
  let mut client = runtime.bus.subscribe();

  match args.command {
    Command::Status => {
      let counts = runtime.store.queue_counts()?;
      println!("pending:     {}", counts.pending);
      println!("in-flight:   {}", counts.in_flight);
      println!("synced:      {}", counts.synced);
      println!("dead-letter: {}", counts.dead_letter);
      println!("tags:        {}", runtime.store.registered_tags()?.join(", "));
      if let Some(due) = runtime.store.next_due_at()? {
        println!("next due:    {}", due.to_rfc3339());
      }
    }
    Command::Fetch { path, navigate } => {
      let request = if navigate {
        Request::navigate(path)
      } else {
        Request::get(path)
      };
      let outcome = runtime.interceptor.handle(request).await?;
      print_messages(&mut client);
      print_fetch(&outcome);
    }
    Command::Submit {
      operation,
      store,
      payload,
    } => {
      if is_reserved_store(&store) {
        return Err(eyre!("'{}' is a cache partition, not a data store", store));
      }
      let payload = serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let outcome = runtime.engine.submit(operation, &store, payload).await?;
      print_messages(&mut client);
      match outcome {
        SubmitOutcome::Synced(response) => println!("synced (HTTP {})", response.status),
        SubmitOutcome::Queued { id } => println!("queued {}", id),
        SubmitOutcome::Rejected(response) => {
          println!("rejected (HTTP {})", response.status);
          println!("{}", String::from_utf8_lossy(&response.body));
        }
      }
    }
    Command::Sync { tag } => {
      let reports = match tag {
        Some(tag) => vec![runtime.coordinator.run_cycle(&tag).await?],
        None => runtime.coordinator.fire_all().await?,
      };
      print_messages(&mut client);
      for report in reports {
        println!("{}", serde_json::to_string(&report)?);
      }
    }
    Command::Watch => {
      let (tx, rx) = tokio::sync::watch::channel(false);
      tokio::spawn(async move {
        while let Some(message) = client.next().await {
          println!("{}", message.to_json());
        }
      });
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          let _ = tx.send(true);
        }
      });
      runtime.coordinator.watch(&runtime.monitor, rx).await?;
    }
    Command::DeadLetters => {
      for item in runtime.store.items_with_status(QueueStatus::DeadLetter)? {
        println!("{}", serde_json::to_string(&item)?);
      }
    }
    Command::Retry { id } => {
      if runtime.coordinator.retry_dead_letter(id)? {
        println!("{} moved back to pending", id);
      } else {
        return Err(eyre!("No dead-lettered item {}", id));
      }
    }
    Command::Purge => {
      println!("purged {}", runtime.store.purge_synced()?);
    }
    Command::Register { tag } => {
      runtime.coordinator.register(&tag)?;
      println!("registered {}", tag);
    }
    Command::Entity { store, id } => {
      let record = entity_record(runtime.store.as_ref(), &store, &id)?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Command::Precache => {
      let stored = runtime
        .interceptor
        .precache(&config.intercept.precache)
        .await?;
      print_messages(&mut client);
      println!("precached {} of {}", stored, config.intercept.precache.len());
    }
  }

  Ok(())
}

/// Install the tracing subscriber. Logs go to a daily file under the data
/// directory unless `to_stderr` is set; the guard must outlive `main`.
fn init_logging(config: &Config, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("LXP_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if to_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  let db_path = config.storage.database_path()?;
  let log_dir = db_path
    .parent()
    .map(|dir| dir.join("logs"))
    .ok_or_else(|| eyre!("Could not determine log directory"))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "lxp-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(Some(guard))
}

fn print_messages(client: &mut ClientChannel) {
  for message in client.drain() {
    println!("{}", message.to_json());
  }
}

fn print_fetch(outcome: &FetchOutcome) {
  match outcome {
    FetchOutcome::Response { response, source } => {
      println!("HTTP {} ({:?})", response.status, source);
      println!("{}", String::from_utf8_lossy(&response.body));
    }
    FetchOutcome::Queued { id } => println!("queued {}", id),
    FetchOutcome::Rejected(response) => println!("rejected (HTTP {})", response.status),
    FetchOutcome::Unavailable => println!("unavailable: no network and nothing cached"),
    FetchOutcome::Passthrough(Ok(response)) => {
      println!("HTTP {} (not intercepted)", response.status);
      println!("{}", String::from_utf8_lossy(&response.body));
    }
    FetchOutcome::Passthrough(Err(e)) => println!("not intercepted, request failed: {}", e),
  }
}
