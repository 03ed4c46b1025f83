//! CLI surface and resolved runtime configuration (spec.md §6).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::discovery::DEFAULT_BROADCAST_INTERVAL;

/// Command-line arguments, following the teacher's minimal `clap::Parser`
/// struct with sensible defaults.
#[derive(Debug, Parser)]
#[command(name = "lcp-node", about = "Local Chat Protocol node")]
pub struct Args {
    /// This node's identity, normalized to 20 bytes (spec.md §3).
    #[arg(long)]
    pub user_id: String,

    /// Seconds between discovery broadcasts.
    #[arg(long, default_value_t = 1)]
    pub broadcast_interval_secs: u64,

    /// Directory received files are written to.
    #[arg(long, default_value = "downloads")]
    pub downloads_dir: PathBuf,

    /// Directory the peer snapshot and history log are persisted under.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Capacity of the bounded inbound message work-queue (spec.md §5).
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,
}

/// Resolved configuration the [`crate::engine::Engine`] is built from.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub user_id: String,
    pub broadcast_interval: Duration,
    pub downloads_dir: PathBuf,
    pub data_dir: PathBuf,
    pub queue_capacity: usize,
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        let broadcast_interval = if args.broadcast_interval_secs == 0 {
            DEFAULT_BROADCAST_INTERVAL
        } else {
            Duration::from_secs(args.broadcast_interval_secs)
        };
        Self {
            user_id: args.user_id,
            broadcast_interval,
            downloads_dir: args.downloads_dir,
            data_dir: args.data_dir,
            queue_capacity: args.queue_capacity,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            downloads_dir: PathBuf::from("downloads"),
            data_dir: PathBuf::from("data"),
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_falls_back_to_default() {
        let args = Args {
            user_id: "alice".into(),
            broadcast_interval_secs: 0,
            downloads_dir: "downloads".into(),
            data_dir: "data".into(),
            queue_capacity: 1024,
        };
        let cfg: NodeConfig = args.into();
        assert_eq!(cfg.broadcast_interval, DEFAULT_BROADCAST_INTERVAL);
    }
}
