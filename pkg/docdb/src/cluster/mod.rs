//! The set of known servers: seed resolution, discovery
//! of new members from probe replies, canonical-name dedup, and the
//! reconnect-strategy lookup handed to the pool.
//!
//! Grounded on `pkg/http/src/client/resolver.rs`'s `Resolver` trait
//! (adapted here from "resolve one service's endpoints" to "track many
//! peer servers with per-server role") and on the `HashMap<usize, Backend>`
//! registry shape of `pkg/http/src/client/load_balanced_client.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::server::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Standalone,
    ReplicaSet,
    Sharded,
}

/// Given a lost connection's server, decides whether and how soon to
/// attempt a new one. Returning `None` means "give up on this server."
pub trait ReconnectStrategy: Send + Sync {
    fn backoff_options(&self) -> BackoffOptions;
}

#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_duration: Duration,
    pub max_duration: Duration,
    pub max_num_attempts: usize,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        BackoffOptions {
            base_duration: Duration::from_millis(100),
            max_duration: Duration::from_secs(30),
            max_num_attempts: 0,
        }
    }
}

/// The reconnect policy used for standalone and replica-set clusters:
/// retry indefinitely with capped exponential backoff.
pub struct PersistentReconnect {
    options: BackoffOptions,
}

impl PersistentReconnect {
    pub fn new(options: BackoffOptions) -> Self {
        Self { options }
    }
}

impl ReconnectStrategy for PersistentReconnect {
    fn backoff_options(&self) -> BackoffOptions {
        self.options.clone()
    }
}

impl ClusterKind {
    /// The reconnect strategy a cluster factory would hand out by default
    /// for this kind. Every kind here retries
    /// persistently; the distinction exists so a factory can override it
    /// per kind (e.g. a sharded deployment's mongos routers) without this
    /// crate hard-coding that choice.
    pub fn default_reconnect_strategy(self) -> Arc<dyn ReconnectStrategy> {
        Arc::new(PersistentReconnect::new(BackoffOptions::default()))
    }
}

struct Entry {
    server: Arc<Server>,
}

struct State {
    entries: HashMap<String, Entry>,
}

/// A set of servers known to this client, deduplicated by canonical name
/// once a probe reveals one.
pub struct Cluster {
    kind: ClusterKind,
    reconnect_strategy: Arc<dyn ReconnectStrategy>,
    state: Mutex<State>,
}

impl Cluster {
    /// Starts a cluster from its seed list (`host:port` strings given at
    /// construction time).
    pub fn new(kind: ClusterKind, seeds: &[String]) -> Self {
        let mut entries = HashMap::with_capacity(seeds.len());
        for seed in seeds {
            entries.insert(
                seed.clone(),
                Entry {
                    server: Arc::new(Server::new(seed.clone())),
                },
            );
        }

        Cluster {
            reconnect_strategy: kind.default_reconnect_strategy(),
            kind,
            state: Mutex::new(State { entries }),
        }
    }

    pub fn kind(&self) -> ClusterKind {
        self.kind
    }

    pub fn reconnect_strategy(&self) -> Arc<dyn ReconnectStrategy> {
        self.reconnect_strategy.clone()
    }

    /// A stable snapshot of every currently-tracked server.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|e| e.server.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Adds a server discovered through another member's probe reply
    /// (`hosts` list), if not already tracked under this name.
    pub fn discover(&self, host_port: &str) -> Arc<Server> {
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .entry(host_port.to_string())
            .or_insert_with(|| Entry {
                server: Arc::new(Server::new(host_port.to_string())),
            })
            .server
            .clone()
    }

    /// Folds a duplicate seed entry into the server's canonical name once
    /// a probe reveals it, so a server discovered under two different
    /// rendezvous names collapses to one record.
    pub fn reconcile_canonical_name(&self, seed_name: &str, canonical_name: &str) {
        if seed_name == canonical_name {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.remove(seed_name) else {
            return;
        };

        state
            .entries
            .entry(canonical_name.to_string())
            .or_insert(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_are_tracked_individually() {
        let cluster = Cluster::new(
            ClusterKind::ReplicaSet,
            &["a:27017".to_string(), "b:27017".to_string()],
        );
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn discovery_adds_new_members_without_duplicating() {
        let cluster = Cluster::new(ClusterKind::ReplicaSet, &["a:27017".to_string()]);
        cluster.discover("b:27017");
        cluster.discover("b:27017");
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn canonical_name_dedup_collapses_seed_entry() {
        let cluster = Cluster::new(ClusterKind::ReplicaSet, &["seed:27017".to_string()]);
        cluster.reconcile_canonical_name("seed:27017", "real-host:27017");
        assert_eq!(cluster.len(), 1);
        assert_eq!(
            cluster.servers()[0].seed_name(),
            "seed:27017" // the Server's own seed_name is unchanged...
        );
        assert!(cluster
            .state
            .lock()
            .unwrap()
            .entries
            .contains_key("real-host:27017")); // ...but it's now keyed by canonical name.
    }
}
