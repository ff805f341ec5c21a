use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use data_model::{EdgeError, EndpointId};
use priority_queue::PriorityQueue;
use state_store::scanner::StateReader;
use strum::Display;
use tokio::{
    sync::{watch, Notify, RwLock},
    time::Instant,
};
use tracing::{debug, info, trace};

use crate::{config::PortRange, http_objects::EdgeJobSchedule};

const CREDENTIALS_LENGTH: usize = 32;

/// Wrapper for `tokio::time::Instant` that reverses the ordering for deadline.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReverseInstant(pub Instant);

impl Ord for ReverseInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0) // Reverse ordering
    }
}

impl PartialOrd for ReverseInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum TunnelStatus {
    Required,
    Active,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub status: TunnelStatus,
    pub port: Option<u16>,
    pub credentials: Option<String>,
}

impl Tunnel {
    fn idle() -> Self {
        Self {
            status: TunnelStatus::Idle,
            port: None,
            credentials: None,
        }
    }
}

#[derive(Default)]
struct TunnelTable {
    tunnels: HashMap<EndpointId, Tunnel>,
    ports_in_use: HashSet<u16>,
}

impl TunnelTable {
    fn allocate_port(&mut self, range: PortRange) -> Option<u16> {
        let port = (range.start..=range.end).find(|port| !self.ports_in_use.contains(port))?;
        self.ports_in_use.insert(port);
        Some(port)
    }

    fn release(&mut self, endpoint_id: EndpointId) -> Option<Tunnel> {
        let tunnel = self.tunnels.remove(&endpoint_id)?;
        if let Some(port) = tunnel.port {
            self.ports_in_use.remove(&port);
        }
        Some(tunnel)
    }
}

/// Represents the possible outcomes of waiting for an event in the idle
/// monitor
enum WaitResult {
    Deadline,
    Notified,
    Shutdown,
}

/// Reverse tunnels and the jobs queued for synchronous agents.
pub struct TunnelService {
    port_range: PortRange,
    idle_timeout: Duration,
    table: RwLock<TunnelTable>,
    deadlines: RwLock<PriorityQueue<EndpointId, ReverseInstant>>,
    /// Used to wake the monitor only when necessary
    notify: Arc<Notify>,
    jobs: RwLock<HashMap<EndpointId, Vec<EdgeJobSchedule>>>,
}

impl TunnelService {
    pub fn new(port_range: PortRange, idle_timeout: Duration) -> Self {
        Self {
            port_range,
            idle_timeout,
            table: RwLock::new(TunnelTable::default()),
            deadlines: RwLock::new(PriorityQueue::new()),
            notify: Arc::new(Notify::new()),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    async fn push_deadline(&self, endpoint_id: EndpointId) {
        let was_empty = {
            let new_deadline = ReverseInstant(Instant::now() + self.idle_timeout);
            let mut deadlines = self.deadlines.write().await;
            let was_empty = deadlines.is_empty();
            if deadlines.change_priority(&endpoint_id, new_deadline).is_none() {
                deadlines.push(endpoint_id, new_deadline);
            }
            was_empty
        };
        if was_empty {
            self.notify.notify_one();
        }
    }

    /// Asks the agent to open a tunnel on its next check-in. Opening a
    /// tunnel that is already up counts as activity.
    pub async fn open_tunnel(&self, endpoint_id: EndpointId) -> Result<Tunnel> {
        let tunnel = {
            let mut table = self.table.write().await;
            if let Some(existing) = table.tunnels.get(&endpoint_id) {
                existing.clone()
            } else {
                let port = table.allocate_port(self.port_range).ok_or_else(|| {
                    EdgeError::InvalidState("no free tunnel port left".to_string())
                })?;
                let tunnel = Tunnel {
                    status: TunnelStatus::Required,
                    port: Some(port),
                    credentials: Some(nanoid::nanoid!(CREDENTIALS_LENGTH)),
                };
                table.tunnels.insert(endpoint_id, tunnel.clone());
                info!(endpoint_id = %endpoint_id, port, "tunnel required");
                tunnel
            }
        };
        self.push_deadline(endpoint_id).await;
        Ok(tunnel)
    }

    /// Returns the tunnel as the agent has to see it. A required tunnel is
    /// reported as required once more while it becomes active. Checking in
    /// with an active tunnel counts as activity.
    pub async fn check_in(&self, endpoint_id: EndpointId) -> Tunnel {
        let reported = {
            let mut table = self.table.write().await;
            let Some(tunnel) = table.tunnels.get_mut(&endpoint_id) else {
                return Tunnel::idle();
            };
            let reported = tunnel.clone();
            if tunnel.status == TunnelStatus::Required {
                tunnel.status = TunnelStatus::Active;
                debug!(endpoint_id = %endpoint_id, "tunnel active");
            }
            reported
        };
        match reported.status {
            TunnelStatus::Required => self.push_deadline(endpoint_id).await,
            TunnelStatus::Active => self.record_activity(endpoint_id).await,
            TunnelStatus::Idle => {}
        }
        reported
    }

    /// Keeps an active tunnel from being reclaimed.
    pub async fn record_activity(&self, endpoint_id: EndpointId) {
        let active = self
            .table
            .read()
            .await
            .tunnels
            .get(&endpoint_id)
            .is_some_and(|tunnel| tunnel.status == TunnelStatus::Active);
        if active {
            self.push_deadline(endpoint_id).await;
        }
    }

    pub async fn tunnel(&self, endpoint_id: EndpointId) -> Tunnel {
        self.table
            .read()
            .await
            .tunnels
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_else(Tunnel::idle)
    }

    pub async fn remove_endpoint(&self, endpoint_id: EndpointId) {
        self.table.write().await.release(endpoint_id);
        self.deadlines.write().await.remove(&endpoint_id);
        self.jobs.write().await.remove(&endpoint_id);
    }

    /// Rebuilds the per-endpoint job queues of synchronous endpoints.
    pub async fn rebuild_jobs(&self, reader: &StateReader) -> Result<()> {
        let sync_endpoints: HashSet<EndpointId> = reader
            .list_endpoints()?
            .into_iter()
            .filter(|endpoint| !endpoint.is_async())
            .map(|endpoint| endpoint.id)
            .collect();
        let mut queues: HashMap<EndpointId, Vec<EdgeJobSchedule>> = HashMap::new();
        for job in reader.list_edge_jobs()? {
            for (endpoint_id, meta) in &job.endpoints {
                if sync_endpoints.contains(endpoint_id) {
                    queues
                        .entry(*endpoint_id)
                        .or_default()
                        .push(EdgeJobSchedule::new(&job, meta.collect_logs));
                }
            }
        }
        debug!(endpoints = queues.len(), "rebuilt edge job queues");
        *self.jobs.write().await = queues;
        Ok(())
    }

    pub async fn jobs(&self, endpoint_id: EndpointId) -> Vec<EdgeJobSchedule> {
        self.jobs
            .read()
            .await
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn wait_for_idle_event(&self, shutdown_rx: &mut watch::Receiver<()>) -> WaitResult {
        let next_deadline = {
            let deadlines = self.deadlines.read().await;
            deadlines.peek().map(|(_, deadline)| deadline.0)
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => WaitResult::Deadline,
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
            None => {
                trace!("Waiting for notification, no tunnel deadline to wait for");
                tokio::select! {
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
        }
    }

    /// Demotes tunnels without activity to idle and frees their ports.
    pub async fn start_idle_monitor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            match self.wait_for_idle_event(&mut shutdown_rx).await {
                WaitResult::Deadline => {
                    self.process_idle_tunnels().await;
                }
                WaitResult::Notified => continue,
                WaitResult::Shutdown => {
                    trace!("Received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn process_idle_tunnels(&self) {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        {
            let mut deadlines = self.deadlines.write().await;
            while let Some((_, next_deadline)) = deadlines.peek() {
                if next_deadline.0 > now {
                    break;
                }
                match deadlines.pop() {
                    Some((endpoint_id, _)) => lapsed.push(endpoint_id),
                    None => break,
                }
            }
        }

        let mut table = self.table.write().await;
        for endpoint_id in lapsed {
            if let Some(tunnel) = table.release(endpoint_id) {
                info!(
                    endpoint_id = %endpoint_id,
                    port = tunnel.port,
                    "tunnel idle, releasing port"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(end: u16) -> Arc<TunnelService> {
        Arc::new(TunnelService::new(
            PortRange { start: 9000, end },
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_required_then_active() -> Result<()> {
        let tunnels = service(9010);
        let endpoint_id = EndpointId::new(1);
        assert_eq!(tunnels.check_in(endpoint_id).await.status, TunnelStatus::Idle);

        let opened = tunnels.open_tunnel(endpoint_id).await?;
        assert_eq!(opened.status, TunnelStatus::Required);
        assert_eq!(opened.port, Some(9000));
        assert_eq!(opened.credentials.as_ref().map(String::len), Some(CREDENTIALS_LENGTH));

        // The first check-in still reports required.
        let seen = tunnels.check_in(endpoint_id).await;
        assert_eq!(seen.status, TunnelStatus::Required);
        assert_eq!(seen.credentials, opened.credentials);
        assert_eq!(tunnels.check_in(endpoint_id).await.status, TunnelStatus::Active);

        // Reopening keeps the port and credentials.
        let reopened = tunnels.open_tunnel(endpoint_id).await?;
        assert_eq!(reopened.port, opened.port);
        assert_eq!(reopened.status, TunnelStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn test_port_exhaustion() -> Result<()> {
        let tunnels = service(9001);
        tunnels.open_tunnel(EndpointId::new(1)).await?;
        tunnels.open_tunnel(EndpointId::new(2)).await?;
        let err = tunnels.open_tunnel(EndpointId::new(3)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidState(_))
        ));

        tunnels.remove_endpoint(EndpointId::new(1)).await;
        assert_eq!(tunnels.open_tunnel(EndpointId::new(3)).await?.port, Some(9000));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_monitor_releases_tunnels() -> Result<()> {
        let tunnels = service(9010);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let monitor = tokio::spawn(tunnels.clone().start_idle_monitor(shutdown_rx));

        let busy = EndpointId::new(1);
        let quiet = EndpointId::new(2);
        tunnels.open_tunnel(busy).await?;
        tunnels.open_tunnel(quiet).await?;
        tunnels.check_in(busy).await;
        tunnels.check_in(quiet).await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        tunnels.record_activity(busy).await;
        tokio::time::sleep(Duration::from_secs(40)).await;

        assert_eq!(tunnels.tunnel(busy).await.status, TunnelStatus::Active);
        assert_eq!(tunnels.tunnel(quiet).await.status, TunnelStatus::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(tunnels.tunnel(busy).await.status, TunnelStatus::Idle);

        // Released ports are handed out again.
        assert_eq!(tunnels.open_tunnel(EndpointId::new(3)).await?.port, Some(9000));

        shutdown_tx.send(())?;
        monitor.await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_ins_keep_active_tunnel_open() -> Result<()> {
        let tunnels = service(9010);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let monitor = tokio::spawn(tunnels.clone().start_idle_monitor(shutdown_rx));

        let endpoint_id = EndpointId::new(1);
        tunnels.open_tunnel(endpoint_id).await?;
        assert_eq!(tunnels.check_in(endpoint_id).await.status, TunnelStatus::Required);

        // Agent polls every 30s, well past one idle timeout in total.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert_eq!(tunnels.check_in(endpoint_id).await.status, TunnelStatus::Active);
        }

        // Once the agent stops checking in the tunnel lapses.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(tunnels.tunnel(endpoint_id).await.status, TunnelStatus::Idle);

        shutdown_tx.send(())?;
        monitor.await?;
        Ok(())
    }
}
