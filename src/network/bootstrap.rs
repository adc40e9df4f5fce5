//! Bootstrap endpoint supply
//!
//! Produces candidate endpoints when the peer table has none: the static
//! bootstrap list plus whatever the DNS seeds resolve to, de-duplicated and
//! shuffled. The queue is rebuilt once it runs dry and the refresh interval
//! has passed.

use crate::network::endpoint::Endpoint;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::Mutex;

/// Default time between rebuilds
pub const BOOTSTRAP_REFRESH: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct BootstrapQueue {
    queue: VecDeque<Endpoint>,
    last_refresh: Option<Instant>,
}

/// Randomized, periodically refreshed queue of bootstrap endpoints
#[derive(Debug)]
pub struct Bootstrapper {
    static_peers: Vec<Endpoint>,
    dns_seeds: Vec<String>,
    default_port: u16,
    refresh_interval: Duration,
    inner: Mutex<BootstrapQueue>,
}

impl Bootstrapper {
    pub fn new(static_peers: Vec<Endpoint>, dns_seeds: Vec<String>, default_port: u16) -> Self {
        Self {
            static_peers,
            dns_seeds,
            default_port,
            refresh_interval: BOOTSTRAP_REFRESH,
            inner: Mutex::new(BootstrapQueue::default()),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Next endpoint, rebuilding the queue if it is empty and due
    pub async fn next(&self) -> Option<Endpoint> {
        let mut inner = self.inner.lock().await;

        if inner.queue.is_empty() {
            let due = inner
                .last_refresh
                .map(|at| at.elapsed() >= self.refresh_interval)
                .unwrap_or(true);
            if !due {
                return None;
            }
            inner.queue = self.rebuild().await;
            inner.last_refresh = Some(Instant::now());
        }

        inner.queue.pop_front()
    }

    /// Up to `n` endpoints, fewer if the queue runs out
    pub async fn next_n(&self, n: usize) -> Vec<Endpoint> {
        let mut endpoints = Vec::with_capacity(n);
        while endpoints.len() < n {
            match self.next().await {
                Some(endpoint) => endpoints.push(endpoint),
                None => break,
            }
        }
        endpoints
    }

    /// Endpoints still queued
    pub async fn remaining(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    async fn rebuild(&self) -> VecDeque<Endpoint> {
        let mut unique: HashSet<Endpoint> = self.static_peers.iter().cloned().collect();

        let lookups = self.dns_seeds.iter().map(|seed| self.resolve_seed(seed));
        for resolved in join_all(lookups).await {
            unique.extend(resolved);
        }

        let mut endpoints: Vec<Endpoint> = unique.into_iter().collect();
        endpoints.shuffle(&mut rand::thread_rng());

        log::info!(
            "Bootstrap queue rebuilt with {} endpoints ({} static, {} seeds)",
            endpoints.len(),
            self.static_peers.len(),
            self.dns_seeds.len()
        );
        endpoints.into()
    }

    async fn resolve_seed(&self, seed: &str) -> Vec<Endpoint> {
        // A seed may carry its own port
        let (host, port) = match seed.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => {
                    log::warn!("Skipping DNS seed with invalid port: {}", seed);
                    return Vec::new();
                }
            },
            _ => (seed.to_string(), self.default_port),
        };

        log::debug!("Resolving DNS seed: {}", host);
        let resolved = match lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs.map(Endpoint::from).collect(),
            Err(e) => {
                log::warn!("Failed to resolve DNS seed {}: {}", seed, e);
                Vec::new()
            }
        };
        resolved
    }
}
