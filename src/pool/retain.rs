use log::info;

use crate::config::get_config;

use super::{get_all_pools, ConnectionPool, PoolIdentifier};

/// Controls which idle slots a flush evicts; mirrors the `flush` control-plane verb's modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Evict only slots already past their idle timeout.
    Idle,
    /// Evict every idle slot regardless of age.
    Graceful,
    /// Evict every idle slot and mark slots currently `IN_USE` `GRACEFULLY`,
    /// so they're removed instead of returned once their client is done.
    All,
}

impl ConnectionPool {
    /// Reaps `Free` slots past the idle timeout and marks `InUse` slots past
    /// the configured connection lifetime `GRACEFULLY`, so a burst of
    /// expirations doesn't stampede the backend all at once.
    pub fn retain_pool_connections(&self) {
        self.database.idle_timeout(self.settings.idle_timeout_ms);
        self.database
            .max_connection_age(self.settings.life_time_ms);
    }

    /// Drops every `Free` slot unconditionally. Used for graceful shutdown and
    /// the `flush` control-plane verb in `Graceful` mode.
    pub fn drain_idle_connections(&self) {
        self.database.flush(FlushMode::Graceful, 0);
    }

    /// Opens connections up to the pool's configured `min_size`, leaving them `Free`.
    pub async fn prefill(&self) {
        let filled = self.database.prefill().await;
        if filled > 0 {
            info!(
                "[pool: {}][user: {}] prefilled {filled} connection(s)",
                self.settings.db, self.settings.user.username
            );
        }
    }
}

pub async fn retain_connections() {
    let retain_time_ms = get_config().general.retain_connections_time;
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(retain_time_ms));
    loop {
        interval.tick().await;
        for (_, pool) in get_all_pools() {
            pool.retain_pool_connections();
        }
    }
}

/// Drains idle slots from every pool; called during graceful shutdown so backend
/// connections aren't held open while we wait for in-flight clients to finish.
pub fn drain_all_pools() {
    for (id, pool) in get_all_pools().iter() {
        pool.drain_idle_connections();
        info!("[pool: {id}] drained idle connections");
    }
}

/// Opens up to `min_pool_size` connections per pool, run at startup and on `SIGUSR1`.
pub async fn prefill_all_pools() {
    for (id, pool) in get_all_pools().iter() {
        pool.prefill().await;
        info!("[pool: {id}] prefill complete");
    }
}

/// Drains a single pool identified by database/user, used by the `flush` control verb.
pub fn flush_pool(id: &PoolIdentifier, mode: FlushMode) -> bool {
    match get_all_pools().get(id) {
        Some(pool) => {
            let idle_timeout_ms = get_config().general.idle_timeout.as_millis();
            pool.database.flush(mode, idle_timeout_ms);
            true
        }
        None => false,
    }
}
