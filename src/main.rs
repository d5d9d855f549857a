use assetsync::config::Config;
use assetsync::instances::ConflictResolution;
use assetsync::remote::api_types::SyncDirection;
use assetsync::{logging, SyncEngine};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "assetsync")]
#[command(about = "Offline-first asset cache and instance sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/assetsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Watch connectivity, replay deferred work on reconnect and sweep
  /// expired assets until interrupted
  Run {
    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 600)]
    sweep_interval: u64,
  },
  /// Fetch one asset and write its bytes to stdout
  Fetch {
    uri: String,
    /// Only read the local cache
    #[arg(long)]
    cached: bool,
  },
  /// Sync one instance
  Sync {
    instance_type: String,
    instance_id: String,
    /// pull, push or merge
    direction: SyncDirection,
    /// Conflict hint for merges: use_local or use_cloud
    #[arg(long)]
    resolve: Option<ConflictResolution>,
  },
  /// Print engine status as JSON
  Status,
  /// Remove expired assets from the cache
  Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let engine = SyncEngine::open(config)?;
  let result = run(&engine, args.command).await;
  engine.close().await;
  result
}

async fn run(engine: &SyncEngine, command: Command) -> Result<()> {
  match command {
    Command::Run { sweep_interval } => {
      engine.start();
      let mut sweep = tokio::time::interval(Duration::from_secs(sweep_interval.max(1)));
      info!(sweep_interval, "running, press Ctrl-C to stop");
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            break;
          }
          _ = sweep.tick() => {
            if let Err(e) = engine.cleanup() {
              warn!(error = %e, "expiry sweep failed");
            }
            if engine.monitor().is_online() {
              engine.replay_deferred().await;
              if let Err(e) = engine.tracker().replay_all_changes().await {
                warn!(error = %e, "replaying local changes failed");
              }
            }
          }
        }
      }
    }
    Command::Fetch { uri, cached } => {
      let bytes = if cached {
        engine.get_cached(&uri)?
      } else {
        engine.monitor().check_now().await;
        engine.fetch(&uri).await?
      };
      let bytes = bytes.ok_or_else(|| eyre!("Asset {} is not available", uri))?;
      std::io::stdout()
        .write_all(&bytes)
        .map_err(|e| eyre!("Failed to write asset: {}", e))?;
    }
    Command::Sync {
      instance_type,
      instance_id,
      direction,
      resolve,
    } => {
      let outcome = match resolve {
        Some(resolution) => {
          engine
            .sync_instance_with(&instance_type, &instance_id, direction, resolution)
            .await
        }
        None => {
          engine
            .sync_instance(&instance_type, &instance_id, direction)
            .await
        }
      };
      println!(
        "{}",
        serde_json::to_string_pretty(&outcome)
          .map_err(|e| eyre!("Failed to encode outcome: {}", e))?
      );
      if !outcome.status.is_success() {
        return Err(eyre!("Sync finished with status {}", outcome.status));
      }
    }
    Command::Status => {
      engine.monitor().check_now().await;
      let status = engine.status().await?;
      println!(
        "{}",
        serde_json::to_string_pretty(&status)
          .map_err(|e| eyre!("Failed to encode status: {}", e))?
      );
    }
    Command::Cleanup => {
      let stats = engine.cleanup()?;
      println!(
        "checked {} removed {} kept stale {} pruned {} errors {}",
        stats.checked, stats.removed, stats.retained_stale, stats.pruned_invalid, stats.errors
      );
    }
  }
  Ok(())
}
