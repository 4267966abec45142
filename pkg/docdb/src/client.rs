//! The public facade: a client handle owning a
//! `Cluster`, a `Pool`, and a background status-probe loop, in the
//! `Arc<Shared>`-per-client idiom `pkg/http/src/client/direct_client.rs`
//! uses for its own top-level handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::async_std::sync::Mutex;
use common::async_std::task;
use common::errors::*;
use common::task::ChildTask;

use crate::bson::element::{Element, Value};
use crate::bson::Document;
use crate::cluster::{Cluster, ClusterKind};
use crate::conn::Connection;
use crate::planner::{self, Bundle, BundlingMode, Durability, DurabilityLevel, PlannerOptions, WriteOperation};
use crate::pool::{ConnectionFactory, Pool, PoolOptions, ReadPreference, TcpConnectionFactory};
use crate::reply;
use crate::server::{self, ProbeReply, ReplSetMember, ReplSetStatus, Server};
use crate::wire::{Message, QueryMessage, ReplyMessage};

/// Runs a connection's authentication handshake before it joins the
/// pool's rotation. Concrete mechanisms (SASL, x.509, Kerberos) are out of
/// scope; the default accepts every connection unconditionally.
#[async_trait]
pub trait ConnectionAuthenticator: Send + Sync {
    async fn authenticate(&self, conn: &Connection) -> Result<()>;
}

pub struct NoAuthentication;

#[async_trait]
impl ConnectionAuthenticator for NoAuthentication {
    async fn authenticate(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

struct AuthenticatingFactory {
    authenticator: Arc<dyn ConnectionAuthenticator>,
}

#[async_trait]
impl ConnectionFactory for AuthenticatingFactory {
    async fn connect(&self, server: &Arc<Server>) -> Result<Connection> {
        let conn = TcpConnectionFactory.connect(server).await?;
        if let Err(e) = self.authenticator.authenticate(&conn).await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }
}

#[derive(Clone)]
pub struct DocDbClientOptions {
    pub seeds: Vec<String>,
    pub cluster_kind: ClusterKind,
    pub pool_options: PoolOptions,
    pub default_read_preference: ReadPreference,
    pub durability: Durability,
    pub status_probe_interval: Duration,
    pub authenticator: Arc<dyn ConnectionAuthenticator>,
}

impl Default for DocDbClientOptions {
    fn default() -> Self {
        DocDbClientOptions {
            seeds: Vec::new(),
            cluster_kind: ClusterKind::Standalone,
            pool_options: PoolOptions::default(),
            default_read_preference: ReadPreference::Primary,
            durability: Durability::new(DurabilityLevel::Ack),
            status_probe_interval: Duration::from_secs(10),
            authenticator: Arc::new(NoAuthentication),
        }
    }
}

/// Ties the cluster, pool, planner, and reply layers together behind one
/// handle. Owns the background task that periodically probes every known
/// server's status and feeds the result into `Server::apply_probe`.
pub struct DocDbClient {
    cluster: Arc<Cluster>,
    pool: Pool,
    factory: Arc<dyn ConnectionFactory>,
    default_read_preference: ReadPreference,
    durability: Durability,
    probe_task: Mutex<Option<ChildTask>>,
}

impl DocDbClient {
    pub async fn connect(options: DocDbClientOptions) -> Result<DocDbClient> {
        let cluster = Arc::new(Cluster::new(options.cluster_kind, &options.seeds));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(AuthenticatingFactory {
            authenticator: options.authenticator.clone(),
        });
        let pool = Pool::new(cluster.clone(), factory.clone(), options.pool_options.clone());

        let client = DocDbClient {
            cluster: cluster.clone(),
            pool,
            factory: factory.clone(),
            default_read_preference: options.default_read_preference,
            durability: options.durability,
            probe_task: Mutex::new(None),
        };

        let probe_cluster = cluster;
        let probe_factory = factory;
        let interval = options.status_probe_interval;
        let task = ChildTask::spawn(async move {
            run_status_probe_loop(probe_cluster, probe_factory, interval).await;
        });
        *client.probe_task.lock().await = Some(task);

        Ok(client)
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub async fn reconfigure_pool(&self, max_connections: usize) {
        self.pool.reconfigure(max_connections).await;
    }

    /// Runs a generic command against a connection chosen per
    /// `read_preference` (or the client's default).
    pub async fn command(
        &self,
        db: &str,
        command: Document,
        read_preference: Option<&ReadPreference>,
    ) -> Result<ReplyMessage> {
        let read_preference = read_preference.unwrap_or(&self.default_read_preference);
        let message = Message::Query(QueryMessage::command(db, command));
        self.pool.send(message, read_preference).await
    }

    /// Plans `operations` into one or more command documents sized against
    /// the picked connection's server, then sends each bundle in turn.
    pub async fn execute_writes(
        &self,
        db: &str,
        collection: &str,
        operations: Vec<WriteOperation>,
        mode: BundlingMode,
    ) -> Result<Vec<ReplyMessage>> {
        let conn = self.pool.pick(&ReadPreference::Primary).await?;
        let (max_command_size, max_ops_per_bundle) = match self.pool.server_for(&conn).await {
            Some(srv) => (srv.max_bson_object_size(), srv.max_write_batch_size()),
            None => (
                server::DEFAULT_MAX_BSON_OBJECT_SIZE,
                server::DEFAULT_MAX_WRITE_BATCH_SIZE,
            ),
        };

        let bundles: Vec<Bundle> = planner::plan(
            operations,
            &PlannerOptions {
                collection: collection.to_string(),
                max_command_size,
                max_ops_per_bundle,
                durability: self.durability.clone(),
                mode,
            },
        )?;

        let mut replies = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let message = Message::Query(QueryMessage::command(db, bundle.command));
            replies.push(conn.send(message).await?);
        }
        Ok(replies)
    }

    pub async fn close(&self) {
        if let Some(task) = self.probe_task.lock().await.take() {
            drop(task);
        }
    }
}

async fn run_status_probe_loop(cluster: Arc<Cluster>, factory: Arc<dyn ConnectionFactory>, interval: Duration) {
    loop {
        for server in cluster.servers() {
            if let Err(e) = probe_one(&cluster, &factory, &server).await {
                eprintln!(
                    "docdb: status probe for {} failed: {}",
                    server.canonical_name(),
                    e
                );
            }
        }
        task::sleep(interval).await;
    }
}

async fn probe_one(cluster: &Arc<Cluster>, factory: &Arc<dyn ConnectionFactory>, server: &Arc<Server>) -> Result<()> {
    let conn = factory.connect(server).await?;

    let mut is_master_command = Document::new();
    is_master_command.push(Element::new("isMaster", Value::Int32(1))?)?;

    let started = Instant::now();
    let is_master_reply = conn
        .send(Message::Query(QueryMessage::command("admin", is_master_command)))
        .await?;
    server.record_latency(started.elapsed());

    let doc = reply::single_document(&is_master_reply)?;
    let is_master = matches!(doc.get_value("ismaster"), Some(Value::Boolean(true)));
    let secondary = matches!(doc.get_value("secondary"), Some(Value::Boolean(true)));
    let tags = match doc.get_value("tags") {
        Some(Value::Document(d)) => Some(d.clone()),
        _ => None,
    };
    let me = match doc.get_value("me") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let hosts: Vec<String> = match doc.get_value("hosts") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let max_bson_object_size = as_usize(doc.get_value("maxBsonObjectSize"));
    let max_write_batch_size = as_usize(doc.get_value("maxWriteBatchSize"));

    if let Some(me) = &me {
        cluster.reconcile_canonical_name(server.seed_name(), me);
    }
    for host in &hosts {
        cluster.discover(host);
    }

    let replica_set_status = if cluster.kind() == ClusterKind::ReplicaSet {
        let mut rs_command = Document::new();
        rs_command.push(Element::new("replSetGetStatus", Value::Int32(1))?)?;
        let self_name = me.clone().unwrap_or_else(|| server.canonical_name());
        match conn
            .send(Message::Query(QueryMessage::command("admin", rs_command)))
            .await
        {
            Ok(rs_reply) => reply::single_document(&rs_reply)
                .ok()
                .and_then(|d| parse_repl_set_status(&d, &self_name)),
            Err(_) => None,
        }
    } else {
        None
    };

    server
        .apply_probe(&ProbeReply {
            is_master,
            secondary,
            tags,
            me,
            hosts,
            max_bson_object_size,
            max_write_batch_size,
            replica_set_status,
        })
        .await;

    if server.needs_version_probe() {
        let mut build_info_command = Document::new();
        build_info_command.push(Element::new("buildInfo", Value::Int32(1))?)?;
        if let Ok(bi_reply) = conn
            .send(Message::Query(QueryMessage::command("admin", build_info_command)))
            .await
        {
            if let Ok(bi_doc) = reply::single_document(&bi_reply) {
                if let Some(Value::String(version)) = bi_doc.get_value("version") {
                    server.apply_version_probe(version.clone()).await;
                }
            }
        }
    }

    conn.close().await;
    Ok(())
}

fn as_usize(v: Option<&Value>) -> Option<usize> {
    match v {
        Some(Value::Int32(i)) => Some(*i as usize),
        Some(Value::Int64(i)) => Some(*i as usize),
        Some(Value::Double(d)) => Some(*d as usize),
        _ => None,
    }
}

fn parse_repl_set_status(doc: &Document, me: &str) -> Option<ReplSetStatus> {
    let my_state = match doc.get_value("myState") {
        Some(Value::Int32(i)) => *i,
        _ => return None,
    };

    let members = match doc.get_value("members") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::Document(member_doc) => {
                    let name = match member_doc.get_value("name") {
                        Some(Value::String(s)) => s.clone(),
                        _ => return None,
                    };
                    let optime_secs = match member_doc.get_value("optime") {
                        Some(Value::Int64(t)) => *t,
                        Some(Value::Int32(t)) => *t as i64,
                        Some(Value::Document(optime_doc)) => match optime_doc.get_value("t") {
                            Some(Value::Int32(t)) => *t as i64,
                            Some(Value::Int64(t)) => *t,
                            _ => 0,
                        },
                        _ => 0,
                    };
                    Some(ReplSetMember { name, optime_secs })
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(ReplSetStatus {
        my_state,
        me: me.to_string(),
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_a_standalone_cluster_and_primary_reads() {
        let options = DocDbClientOptions::default();
        assert_eq!(options.cluster_kind, ClusterKind::Standalone);
        assert!(matches!(options.default_read_preference, ReadPreference::Primary));
    }

    #[test]
    fn no_authentication_is_a_usable_authenticator_trait_object() {
        let _authenticator: Arc<dyn ConnectionAuthenticator> = Arc::new(NoAuthentication);
    }
}
