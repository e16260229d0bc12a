use crate::config::{ConfigError, HealthCheckTarget, TunnelConfig};
use crate::tunnel::{host_of, split_host_port, Tunnel, TunnelConn, TunnelCreator, TunnelError};
use itertools::Itertools;
use log::{error, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

#[derive(Clone)]
pub struct TunnelEntry {
    pub address: String,
    pub tunnel: Arc<dyn Tunnel>,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<TunnelEntry>,
    /// Addresses with a creation in flight, so repeated updates don't stack
    /// duplicate tunnels.
    adding: HashSet<String>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    tasks: Mutex<JoinSet<()>>,
    creator: Box<dyn TunnelCreator>,
    user: String,
    key_file: String,
    health_check: HealthCheckTarget,
    health_check_interval: Duration,
    dial_timeout: Duration,
}

/// A reconciled set of tunnels, one per remote address, with periodic health
/// checking. Failed tunnels are torn down and recreated in the background.
pub struct TunnelPool {
    shared: Arc<PoolShared>,
    stop: watch::Sender<bool>,
}

impl TunnelPool {
    /// Must be called from within a tokio runtime; the health check loop is
    /// spawned immediately.
    pub fn new(config: &TunnelConfig, creator: Box<dyn TunnelCreator>) -> Result<Self, ConfigError> {
        let health_check = config.health_check_target()?;
        let (stop, mut stop_rx) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            tasks: Mutex::new(JoinSet::new()),
            creator,
            user: config.user.clone(),
            key_file: config.key_file.clone(),
            health_check,
            health_check_interval: config.health_check_interval(),
            dial_timeout: config.dial_timeout(),
        });

        let loop_shared = Arc::clone(&shared);
        shared.spawn(async move {
            let mut ticker = tokio::time::interval(loop_shared.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => loop_shared.run_health_checks(),
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(TunnelPool { shared, stop })
    }

    /// Reconciles the pool against the desired address set. Never blocks:
    /// tunnel creation and teardown happen in background tasks.
    pub fn update(&self, addrs: &[String]) {
        let shared = &self.shared;
        let removed = {
            let mut state = shared.lock_state();

            let have: HashSet<String> =
                state.entries.iter().map(|e| e.address.clone()).collect();
            for addr in addrs {
                if have.contains(addr) || state.adding.contains(addr) {
                    continue;
                }
                state.adding.insert(addr.clone());
                let addr = addr.clone();
                let task_shared = Arc::clone(shared);
                shared.spawn(async move { task_shared.create_and_add_tunnel(addr).await });
            }

            let want: HashSet<&String> = addrs.iter().collect();
            let entries = std::mem::take(&mut state.entries);
            let (keep, removed): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| want.contains(&e.address));
            state.entries = keep;
            removed
        };

        for entry in removed {
            info!("removing tunnel to deleted node at {}", entry.address);
            shared.spawn(async move {
                if let Err(err) = entry.tunnel.close().await {
                    error!("failed to close tunnel to {}: {}", entry.address, err);
                }
            });
        }
    }

    /// Dials `host:port` through the pool, preferring the tunnel whose remote
    /// host matches and falling back to a random tunnel otherwise.
    pub async fn dial(&self, addr: &str) -> Result<Box<dyn TunnelConn>, TunnelError> {
        let start = Instant::now();
        let id: u64 = rand::rng().random();
        info!("[{:x}: {}] dialing", id, addr);

        let (host, port) = split_host_port(addr)?;
        let tunnel = self.shared.pick_tunnel(&host)?;
        let conn = match tokio::time::timeout(self.shared.dial_timeout, tunnel.dial(&host, port))
            .await
        {
            Ok(res) => res?,
            Err(_) => return Err(TunnelError::Timeout(self.shared.dial_timeout)),
        };

        info!("[{:x}: {}] dialed in {:?}", id, addr, start.elapsed());
        Ok(conn)
    }

    /// Current tunnel addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        self.shared
            .lock_state()
            .entries
            .iter()
            .map(|e| e.address.clone())
            .sorted()
            .collect()
    }

    /// Stops the health check loop, aborts in-flight background work and
    /// closes every tunnel.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);

        let mut tasks = std::mem::take(&mut *self.shared.lock_tasks());
        tasks.shutdown().await;

        let entries = std::mem::take(&mut self.shared.lock_state().entries);
        for entry in entries {
            if let Err(err) = entry.tunnel.close().await {
                info!("failed to close tunnel to {}: {}", entry.address, err);
            }
        }
    }
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        // reap finished tasks so the set doesn't grow unbounded
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    fn pick_tunnel(&self, host: &str) -> Result<Arc<dyn Tunnel>, TunnelError> {
        let state = self.lock_state();
        if state.entries.is_empty() {
            return Err(TunnelError::NoTunnels {
                user: self.user.clone(),
            });
        }
        if let Some(entry) = state.entries.iter().find(|e| host_of(&e.address) == host) {
            return Ok(Arc::clone(&entry.tunnel));
        }
        warn!("no tunnel found for host {}, picking a random one", host);
        let i = rand::rng().random_range(0..state.entries.len());
        Ok(Arc::clone(&state.entries[i].tunnel))
    }

    async fn create_and_add_tunnel(self: Arc<Self>, addr: String) {
        info!("trying to add tunnel to {}", addr);

        let tunnel = match self.creator.create(&self.user, &self.key_file, &addr).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                error!("failed to create tunnel for {}: {}", addr, err);
                self.lock_state().adding.remove(&addr);
                return;
            }
        };

        let opened = match tokio::time::timeout(self.dial_timeout, tunnel.open()).await {
            Ok(res) => res,
            Err(_) => Err(TunnelError::Timeout(self.dial_timeout)),
        };
        if let Err(err) = opened {
            error!("failed to open tunnel to {}: {}", addr, err);
            self.lock_state().adding.remove(&addr);
            return;
        }

        {
            let mut state = self.lock_state();
            state.entries.push(TunnelEntry {
                address: addr.clone(),
                tunnel,
            });
            state.adding.remove(&addr);
        }
        info!("successfully added tunnel for {}", addr);
    }

    /// Schedules one health check per tunnel, staggered across the check
    /// interval so probes don't burst.
    fn run_health_checks(self: &Arc<Self>) {
        let entries = self.lock_state().entries.clone();
        let count = entries.len();
        if count == 0 {
            return;
        }
        for (i, entry) in entries.into_iter().enumerate() {
            let delay = self.health_check_interval * i as u32 / count as u32;
            let shared = Arc::clone(self);
            self.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = shared.health_check(&entry).await {
                    error!("health check of {} failed: {}", entry.address, err);
                    shared.remove_and_re_add(entry).await;
                }
            });
        }
    }

    async fn health_check(&self, entry: &TunnelEntry) -> Result<(), TunnelError> {
        match tokio::time::timeout(self.dial_timeout, self.health_probe(entry)).await {
            Ok(res) => res,
            Err(_) => Err(TunnelError::Timeout(self.dial_timeout)),
        }
    }

    /// Issues a plain HTTP GET through the tunnel. Any well formed HTTP
    /// response counts as healthy; only transport failures are errors.
    async fn health_probe(&self, entry: &TunnelEntry) -> Result<(), TunnelError> {
        let target = &self.health_check;
        let mut conn = entry.tunnel.dial(&target.host, target.port).await?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target.path, target.host
        );
        conn.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await?;
        if !response.starts_with(b"HTTP/") {
            let head = String::from_utf8_lossy(&response[..response.len().min(64)]).to_string();
            return Err(TunnelError::HealthCheckResponse(head));
        }
        Ok(())
    }

    /// Tears down a tunnel that failed its health check and re-creates it.
    /// The entry may already have been removed by a concurrent update, in
    /// which case the address is no longer wanted and nothing is re-added.
    async fn remove_and_re_add(self: Arc<Self>, entry: TunnelEntry) {
        {
            let mut state = self.lock_state();
            let Some(i) = state
                .entries
                .iter()
                .position(|e| Arc::ptr_eq(&e.tunnel, &entry.tunnel))
            else {
                return;
            };
            state.entries.remove(i);
            state.adding.insert(entry.address.clone());
        }

        if let Err(err) = entry.tunnel.close().await {
            info!("failed to close unhealthy tunnel to {}: {}", entry.address, err);
        }
        self.create_and_add_tunnel(entry.address).await;
    }
}
