//! Network node
//!
//! Wires the listener, the peer table and the periodic timers together
//! and owns their tasks.

use crate::config::NetworkConfig;
use crate::network::endpoint::Endpoint;
use crate::network::events::{EventBus, NetworkEvent};
use crate::network::identity::NodeIdentity;
use crate::network::peer::NetworkError;
use crate::network::server::Server;
use crate::network::table::{PeerTable, TableStats};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Node status snapshot
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub listening: Endpoint,
    pub session_id: String,
    pub user_agent: String,
    pub table: TableStats,
}

/// A running network node
pub struct Node {
    config: NetworkConfig,
    local: Endpoint,
    events: EventBus,
    table: Arc<PeerTable>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the listener and start every background task
    pub async fn start(config: NetworkConfig) -> Result<Self, NetworkError> {
        for warning in config.validate() {
            log::warn!("Configuration: {}", warning);
        }

        let server = Server::bind(&config.listen_address, config.listen_port).await?;
        let local = server.local_endpoint().clone();
        let identity = NodeIdentity::local(&config).with_port(local.port());
        let events = EventBus::new();
        let (table, peer_rx) = PeerTable::new(config.clone(), identity, events.clone())?;
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(server.run(Arc::clone(&table), shutdown.clone())));

        let dispatcher = Arc::clone(&table).dispatch(peer_rx);
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = dispatcher => {}
            }
        }));

        let upkeep_table = Arc::clone(&table);
        tasks.push(spawn_timer(
            config.upkeep_interval(),
            shutdown.clone(),
            move || {
                let table = Arc::clone(&upkeep_table);
                async move {
                    table.upkeep().await;
                }
            },
        ));

        let decay_table = Arc::clone(&table);
        tasks.push(spawn_timer(
            config.warden_decay_interval(),
            shutdown.clone(),
            move || {
                let table = Arc::clone(&decay_table);
                async move { table.warden().decay() }
            },
        ));

        log::info!(
            "Node {} started on {}",
            table.identity().session_id,
            local
        );
        events.publish(NetworkEvent::Listening {
            endpoint: local.clone(),
        });

        Ok(Self {
            config,
            local,
            events,
            table,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.table.identity()
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.table.peer_count()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            listening: self.local.clone(),
            session_id: self.identity().session_id.clone(),
            user_agent: self.identity().user_agent(),
            table: self.table.stats(),
        }
    }

    /// Stop timers and the listener, disconnect every peer, then wait up to
    /// the grace period for tasks to finish before aborting them
    pub async fn shutdown(&self) {
        log::info!("Node shutting down...");
        self.shutdown.cancel();
        self.table.shutdown();

        let grace = self.config.shutdown_grace();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                log::warn!("Task did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
        log::info!("Node stopped");
    }
}

/// Shortest period a timer runs at
const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Run `tick` every `period` until cancelled. The first run is one period
/// after start.
fn spawn_timer<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(MIN_TIMER_PERIOD);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig {
            listen_address: "127.0.0.1".into(),
            listen_port: 0,
            enable_bootstrap: false,
            min_peers: 1,
            max_peers: 4,
            shutdown_grace_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let node = Node::start(config()).await.unwrap();
        assert_ne!(node.local_endpoint().port(), 0);
        assert_eq!(node.identity().port, node.local_endpoint().port());
        assert_eq!(node.peer_count(), 0);

        node.shutdown().await;
        assert!(!node.table().is_running());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let node = Node::start(config()).await.unwrap();
        let status = node.status();
        assert_eq!(status.listening, *node.local_endpoint());
        assert_eq!(status.table, TableStats::default());
        assert!(status.user_agent.starts_with("peerlink/"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_period_timer_keeps_ticking() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let shutdown = CancellationToken::new();
        let handle = spawn_timer(Duration::ZERO, shutdown.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!handle.is_finished());
        assert!(ticks.load(Ordering::SeqCst) >= 1);

        shutdown.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_endpoint() {
        let mut cfg = config();
        cfg.peers = vec!["no-port".into()];
        assert!(matches!(
            Node::start(cfg).await,
            Err(NetworkError::Config(_))
        ));
    }
}
