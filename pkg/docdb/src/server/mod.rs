//! Per-server mutable state: role, tags, lag, version,
//! size caps, latency EMA, all updated from status-probe replies.

pub mod latency;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use common::async_std::channel;

use crate::bson::Document;

pub use latency::LatencyEstimate;

pub const DEFAULT_MAX_BSON_OBJECT_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 1000;
const VERSION_PROBE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writable,
    ReadOnly,
    Unavailable,
    Unknown,
}

/// One member of a `replSetGetStatus` reply.
#[derive(Debug, Clone)]
pub struct ReplSetMember {
    pub name: String,
    pub optime_secs: i64,
}

/// The subset of `replSetGetStatus` this crate cares about.
#[derive(Debug, Clone, Default)]
pub struct ReplSetStatus {
    pub my_state: i32,
    pub me: String,
    pub members: Vec<ReplSetMember>,
}

/// The fields this crate extracts from an `isMaster`/`hello` probe reply,
/// already decoded out of the raw wire document by the reply layer.
#[derive(Debug, Clone, Default)]
pub struct ProbeReply {
    pub is_master: bool,
    pub secondary: bool,
    pub tags: Option<Document>,
    pub me: Option<String>,
    pub hosts: Vec<String>,
    pub max_bson_object_size: Option<usize>,
    pub max_write_batch_size: Option<usize>,
    pub replica_set_status: Option<ReplSetStatus>,
}

/// A typed (field, old, new) change notification, re-expressed as an enum
/// per-field rather than a generic triple so listeners can match on what
/// changed without downcasting.
#[derive(Debug, Clone)]
pub enum FieldChange {
    Role { old: Role, new: Role },
    Lag { old: f64, new: f64 },
    Tags { old: Option<Document>, new: Option<Document> },
    CanonicalName { old: String, new: String },
    Version { old: Option<String>, new: Option<String> },
    MaxBsonObjectSize { old: usize, new: usize },
    MaxWriteBatchSize { old: usize, new: usize },
}

struct Fields {
    canonical_name: String,
    role: Role,
    lag_secs: f64,
    tags: Option<Document>,
    version: Option<String>,
    max_bson_object_size: usize,
    max_write_batch_size: usize,
    last_version_probe: Option<Instant>,
}

/// Per-server mutable record. Cheap to read field-by-field; compound reads
/// (e.g. role + tags together) are not atomic across one another, matching
/// the "approximately-coherent snapshot" contract this type is specified to
/// have.
pub struct Server {
    /// The seed address this server was first discovered under. The
    /// cluster dedups on `fields.canonical_name` once a probe reveals it;
    /// this is kept around only as the original rendezvous key.
    seed_name: String,
    fields: Mutex<Fields>,
    latency: LatencyEstimate,
    listeners: Mutex<Vec<channel::Sender<FieldChange>>>,
}

impl Server {
    pub fn new(seed_name: impl Into<String>) -> Self {
        let seed_name = seed_name.into();
        Server {
            fields: Mutex::new(Fields {
                canonical_name: seed_name.clone(),
                role: Role::Unknown,
                lag_secs: 0.0,
                tags: None,
                version: None,
                max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
                max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
                last_version_probe: None,
            }),
            seed_name,
            latency: LatencyEstimate::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn seed_name(&self) -> &str {
        &self.seed_name
    }

    pub fn canonical_name(&self) -> String {
        self.fields.lock().unwrap().canonical_name.clone()
    }

    pub fn role(&self) -> Role {
        self.fields.lock().unwrap().role
    }

    pub fn lag_secs(&self) -> f64 {
        self.fields.lock().unwrap().lag_secs
    }

    pub fn tags(&self) -> Option<Document> {
        self.fields.lock().unwrap().tags.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.fields.lock().unwrap().version.clone()
    }

    pub fn max_bson_object_size(&self) -> usize {
        self.fields.lock().unwrap().max_bson_object_size
    }

    pub fn max_write_batch_size(&self) -> usize {
        self.fields.lock().unwrap().max_write_batch_size
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.value_ms()
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.sample(elapsed);
    }

    /// Re-probe `buildInfo` only if the version is unknown or the last
    /// successful probe is older than 10 minutes.
    pub fn needs_version_probe(&self) -> bool {
        let fields = self.fields.lock().unwrap();
        match fields.last_version_probe {
            None => true,
            Some(last) => {
                fields.version.is_none() || last.elapsed() > VERSION_PROBE_INTERVAL
            }
        }
    }

    /// Records a precisely-known version from `buildInfo`. A wire-version
    /// floor alone (`apply_probe`'s role derivation) never overwrites this.
    pub async fn apply_version_probe(&self, version: String) {
        let old = {
            let mut fields = self.fields.lock().unwrap();
            fields.last_version_probe = Some(Instant::now());
            let old = fields.version.clone();
            fields.version = Some(version.clone());
            old
        };

        if old.as_deref() != Some(version.as_str()) {
            self.publish(FieldChange::Version {
                old,
                new: Some(version),
            })
            .await;
        }
    }

    /// Applies an `isMaster`/`hello` (+ optional `replSetGetStatus`) probe
    /// reply, updating role, lag, tags, canonical name, and size caps in
    /// that order, publishing one typed event per field that changed.
    pub async fn apply_probe(&self, reply: &ProbeReply) {
        let (role, lag) = derive_role(reply);

        let mut changes = Vec::new();
        {
            let mut fields = self.fields.lock().unwrap();

            if fields.role != role {
                changes.push(FieldChange::Role {
                    old: fields.role,
                    new: role,
                });
                fields.role = role;
            }

            if fields.lag_secs != lag {
                changes.push(FieldChange::Lag {
                    old: fields.lag_secs,
                    new: lag,
                });
                fields.lag_secs = lag;
            }

            if fields.tags != reply.tags {
                changes.push(FieldChange::Tags {
                    old: fields.tags.clone(),
                    new: reply.tags.clone(),
                });
                fields.tags = reply.tags.clone();
            }

            if let Some(me) = &reply.me {
                if &fields.canonical_name != me {
                    changes.push(FieldChange::CanonicalName {
                        old: fields.canonical_name.clone(),
                        new: me.clone(),
                    });
                    fields.canonical_name = me.clone();
                }
            }

            if let Some(size) = reply.max_bson_object_size {
                if fields.max_bson_object_size != size {
                    changes.push(FieldChange::MaxBsonObjectSize {
                        old: fields.max_bson_object_size,
                        new: size,
                    });
                    fields.max_bson_object_size = size;
                }
            }

            if let Some(ops) = reply.max_write_batch_size {
                if fields.max_write_batch_size != ops {
                    changes.push(FieldChange::MaxWriteBatchSize {
                        old: fields.max_write_batch_size,
                        new: ops,
                    });
                    fields.max_write_batch_size = ops;
                }
            }
        }

        for change in changes {
            self.publish(change).await;
        }
    }

    pub async fn subscribe(&self) -> channel::Receiver<FieldChange> {
        let (sender, receiver) = channel::unbounded();
        self.listeners.lock().unwrap().push(sender);
        receiver
    }

    async fn publish(&self, change: FieldChange) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let _ = listener.send(change.clone()).await;
        }
    }
}

/// Role derivation: explicit replica-set status takes
/// precedence over the plain `ismaster`/`secondary` booleans.
fn derive_role(reply: &ProbeReply) -> (Role, f64) {
    if let Some(status) = &reply.replica_set_status {
        return match status.my_state {
            1 => (Role::Writable, 0.0),
            2 => {
                let my_optime = status
                    .members
                    .iter()
                    .find(|m| m.name == status.me)
                    .map(|m| m.optime_secs)
                    .unwrap_or(0);
                let max_optime = status
                    .members
                    .iter()
                    .map(|m| m.optime_secs)
                    .fold(my_optime, i64::max);
                (Role::ReadOnly, (max_optime - my_optime) as f64)
            }
            _ => (Role::Unavailable, f64::INFINITY),
        };
    }

    if reply.is_master {
        (Role::Writable, 0.0)
    } else if reply.secondary {
        (Role::ReadOnly, 0.0)
    } else {
        (Role::Unavailable, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_to_read_only_transition_fires_one_event() {
        common::async_std::task::block_on(async {
            let server = Server::new("host:27017");
            let events = server.subscribe().await;

            let reply = ProbeReply {
                is_master: false,
                secondary: true,
                ..Default::default()
            };
            server.apply_probe(&reply).await;

            assert_eq!(server.role(), Role::ReadOnly);
            let change = events.recv().await.unwrap();
            match change {
                FieldChange::Role { old, new } => {
                    assert_eq!(old, Role::Unknown);
                    assert_eq!(new, Role::ReadOnly);
                }
                other => panic!("unexpected change: {:?}", other),
            }
        });
    }

    #[test]
    fn replica_set_status_computes_lag_from_optimes() {
        common::async_std::task::block_on(async {
            let server = Server::new("host:27017");

            let reply = ProbeReply {
                replica_set_status: Some(ReplSetStatus {
                    my_state: 2,
                    me: "secondary:27017".to_string(),
                    members: vec![
                        ReplSetMember {
                            name: "primary:27017".to_string(),
                            optime_secs: 100,
                        },
                        ReplSetMember {
                            name: "secondary:27017".to_string(),
                            optime_secs: 95,
                        },
                    ],
                }),
                ..Default::default()
            };
            server.apply_probe(&reply).await;

            assert_eq!(server.role(), Role::ReadOnly);
            assert_eq!(server.lag_secs(), 5.0);
        });
    }

    #[test]
    fn version_probe_cadence_starts_true_and_quiets_after_success() {
        common::async_std::task::block_on(async {
            let server = Server::new("host:27017");
            assert!(server.needs_version_probe());
            server.apply_version_probe("6.0.1".to_string()).await;
            assert!(!server.needs_version_probe());
        });
    }
}
