use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::auth::AuthConfig;
use crate::cli::Cli;
use crate::retention::RetentionPolicy;
use crate::session::SessionLimits;

/// Runtime configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub listen_addr: String,
    pub database: PathBuf,
    pub engine_url: String,
    pub engine_timeout: Duration,
    pub snapshot_interval: Duration,
    pub index_interval: Duration,
    pub retention: RetentionPolicy,
    pub limits: SessionLimits,
    pub manager_tick: Duration,
    pub auth: AuthConfig,
}

impl CollabConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let limits = SessionLimits {
            max_frame_bytes: cli.max_frame_bytes,
            outbound_capacity: cli.outbound_capacity,
            ping_interval: Duration::from_secs(cli.ping_interval_secs),
            pong_wait: Duration::from_secs(cli.pong_wait_secs),
        };
        if limits.ping_interval >= limits.pong_wait {
            bail!(
                "ping interval ({}s) must be shorter than pong wait ({}s)",
                cli.ping_interval_secs,
                cli.pong_wait_secs
            );
        }
        if limits.outbound_capacity == 0 || limits.max_frame_bytes == 0 {
            bail!("outbound capacity and max frame bytes must be positive");
        }
        for (name, secs) in [
            ("ping interval", cli.ping_interval_secs),
            ("snapshot interval", cli.snapshot_interval_secs),
            ("index interval", cli.index_interval_secs),
            ("manager tick", cli.manager_tick_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be at least one second");
            }
        }

        if cli.engine_timeout_ms == 0 {
            bail!("engine timeout must be positive");
        }

        let auth = AuthConfig {
            secret: cli.auth_secret.clone(),
            previous_secret: cli.auth_previous_secret.clone(),
            expected_aud: cli.auth_audience.clone(),
            require_auth: cli.require_auth,
        };

        Ok(Self {
            listen_addr: cli.listen_addr.clone(),
            database: cli.database.clone(),
            engine_url: cli.engine_url.clone(),
            engine_timeout: Duration::from_millis(cli.engine_timeout_ms),
            snapshot_interval: Duration::from_secs(cli.snapshot_interval_secs),
            index_interval: Duration::from_secs(cli.index_interval_secs),
            retention: RetentionPolicy::from_keep(cli.retain_snapshots),
            limits,
            manager_tick: Duration::from_secs(cli.manager_tick_secs),
            auth,
        })
    }
}
