//! Connected agents
//!
//! Agents register after their hello validates and stay registered until
//! their session ends. A reconnecting agent replaces its previous entry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use excalibur_transport::{AgentIdentifiers, SessionHandle};
use tracing::{debug, info};

use crate::options::ProxyStrategy;

/// One connected agent
#[derive(Debug)]
pub struct AgentEntry {
    id: u64,
    /// Cluster the agent runs in
    pub cluster_name: String,
    /// Destinations the agent serves
    pub identifiers: AgentIdentifiers,
    /// Session carrying the agent's streams
    pub session: SessionHandle,
    /// When the agent connected
    pub connected_at: Instant,
}

impl AgentEntry {
    /// Whether the agent's session is still up
    pub fn is_connected(&self) -> bool {
        !self.session.is_closed()
    }
}

/// Registry of connected agents keyed by cluster name
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentEntry>>,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any previous session for its cluster
    pub fn register(
        &self,
        cluster_name: impl Into<String>,
        identifiers: AgentIdentifiers,
        session: SessionHandle,
    ) -> Arc<AgentEntry> {
        let entry = Arc::new(AgentEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cluster_name: cluster_name.into(),
            identifiers,
            session,
            connected_at: Instant::now(),
        });

        if let Some(previous) = self
            .agents
            .insert(entry.cluster_name.clone(), Arc::clone(&entry))
        {
            info!(cluster = %entry.cluster_name, "Agent reconnected, closing previous session");
            previous.session.close();
        } else {
            info!(
                cluster = %entry.cluster_name,
                identifiers = %entry.identifiers,
                "Agent connected"
            );
        }
        entry
    }

    /// Remove `entry` unless a newer session has replaced it
    pub fn unregister(&self, entry: &AgentEntry) {
        let removed = self
            .agents
            .remove_if(&entry.cluster_name, |_, current| current.id == entry.id);
        if removed.is_some() {
            info!(cluster = %entry.cluster_name, "Agent disconnected");
        }
    }

    /// Agent registered for `cluster_name`
    pub fn get(&self, cluster_name: &str) -> Option<Arc<AgentEntry>> {
        self.agents
            .get(cluster_name)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| e.is_connected())
    }

    /// Pick the agent that should carry a connection to `host`
    pub fn select(&self, host: &str, strategy: ProxyStrategy) -> Option<Arc<AgentEntry>> {
        let selected = match strategy {
            ProxyStrategy::DestHost => self
                .agents
                .iter()
                .find(|e| e.is_connected() && e.identifiers.matches(host))
                .map(|e| Arc::clone(e.value())),
            ProxyStrategy::Default => {
                let connected: Vec<_> = self
                    .agents
                    .iter()
                    .filter(|e| e.is_connected())
                    .map(|e| Arc::clone(e.value()))
                    .collect();
                if connected.is_empty() {
                    None
                } else {
                    let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % connected.len();
                    connected.into_iter().nth(index)
                }
            }
        };
        debug!(
            host = %host,
            strategy = ?strategy,
            agent = selected.as_ref().map(|e| e.cluster_name.as_str()),
            "Selected agent"
        );
        selected
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Names of the registered clusters
    pub fn cluster_names(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }
}
