use std::path::PathBuf;

use clap::Parser;

/// CLI for the collaboration daemon.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pagewiki-collab",
    about = "Realtime page collaboration, update log compaction and search indexing"
)]
pub struct Cli {
    /// Listen address for HTTP/WS endpoints
    #[arg(long, env = "PAGEWIKI_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// SQLite database holding the update log, snapshots and search blocks.
    /// `:memory:` keeps everything in process.
    #[arg(long, env = "PAGEWIKI_DATABASE", default_value = "pagewiki-collab.db")]
    pub database: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Merge engine
    // ─────────────────────────────────────────────────────────────────────────

    /// Base URL of the external CRDT merge engine
    #[arg(long, env = "PAGEWIKI_ENGINE_URL", default_value = "http://127.0.0.1:8790")]
    pub engine_url: String,

    /// Per-request timeout for merge engine calls, in milliseconds
    #[arg(long, env = "PAGEWIKI_ENGINE_TIMEOUT_MS", default_value = "10000")]
    pub engine_timeout_ms: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Background workers
    // ─────────────────────────────────────────────────────────────────────────

    /// Seconds between snapshot passes
    #[arg(long, env = "PAGEWIKI_SNAPSHOT_INTERVAL_SECS", default_value = "30")]
    pub snapshot_interval_secs: u64,

    /// Seconds between full indexing passes
    #[arg(long, env = "PAGEWIKI_INDEX_INTERVAL_SECS", default_value = "60")]
    pub index_interval_secs: u64,

    /// Snapshots to keep per page. Update records covered by the oldest kept
    /// snapshot are deleted. 0 keeps full history.
    #[arg(long, env = "PAGEWIKI_RETAIN_SNAPSHOTS", default_value = "0")]
    pub retain_snapshots: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Largest accepted inbound frame, in bytes
    #[arg(long, env = "PAGEWIKI_MAX_FRAME_BYTES", default_value = "1048576")]
    pub max_frame_bytes: usize,

    /// Outbound queue capacity per session; frames beyond it are dropped
    #[arg(long, env = "PAGEWIKI_OUTBOUND_CAPACITY", default_value = "256")]
    pub outbound_capacity: usize,

    /// Seconds between heartbeat pings
    #[arg(long, env = "PAGEWIKI_PING_INTERVAL_SECS", default_value = "54")]
    pub ping_interval_secs: u64,

    /// Seconds without a pong before a session is dropped
    #[arg(long, env = "PAGEWIKI_PONG_WAIT_SECS", default_value = "60")]
    pub pong_wait_secs: u64,

    /// Seconds between room manager housekeeping ticks
    #[arg(long, env = "PAGEWIKI_MANAGER_TICK_SECS", default_value = "30")]
    pub manager_tick_secs: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Auth options
    // ─────────────────────────────────────────────────────────────────────────

    /// Secret for verifying JWT tokens (HS256, kid "primary").
    /// If not set, tokens cannot be verified.
    #[arg(long, env = "PAGEWIKI_AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Previous secret, still accepted under kid "previous" during rotation.
    #[arg(long, env = "PAGEWIKI_AUTH_PREVIOUS_SECRET", hide_env_values = true)]
    pub auth_previous_secret: Option<String>,

    /// Require a token on every route except /healthz.
    #[arg(long, env = "PAGEWIKI_REQUIRE_AUTH", default_value = "false")]
    pub require_auth: bool,

    /// Expected JWT audience claim (optional).
    #[arg(long, env = "PAGEWIKI_AUTH_AUDIENCE")]
    pub auth_audience: Option<String>,
}
