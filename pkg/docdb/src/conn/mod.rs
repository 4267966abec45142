//! One duplex socket to one server: request-id
//! allocation, the pending-reply map, and the reader/writer halves,
//! grounded on `pkg/http/src/client/direct_client.rs`'s `Arc<Shared>` +
//! `Condvar` pattern and `pkg/http/src/v1/client_connection.rs`'s
//! callback-per-request bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::async_std::channel;
use common::async_std::net::TcpStream;
use common::async_std::sync::Mutex;
use common::async_std::{future, task};
use common::condvar::Condvar;
use common::errors::*;
use common::io::{Readable, Writeable};
use common::task::ChildTask;

use crate::error::{CannotConnect, ConnectionLost, DecodeFailure};
use crate::wire::{Header, Message, ReplyMessage, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Draining,
    Closed,
}

struct Shared {
    address: String,
    max_bson_object_size: usize,
    open: AtomicBool,
    pending_count: AtomicUsize,
    next_request_id: AtomicI32,
    writer: Mutex<Option<Box<dyn Writeable>>>,
    pending: Mutex<HashMap<i32, channel::Sender<Result<ReplyMessage>>>>,
    state: Condvar<ConnState>,
    closed_listeners: Mutex<Vec<channel::Sender<()>>>,
    orphaned_replies: AtomicUsize,
    reader_task: Mutex<Option<ChildTask>>,
}

/// An open connection to a single server. Cheaply cloneable; clones share
/// the same underlying socket and pending-reply bookkeeping.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects to `address` and starts the background reader loop.
    pub async fn connect(address: &str, max_bson_object_size: usize) -> Result<Connection> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            Error::from(CannotConnect {
                reason: format!("{}: {}", address, e),
            })
        })?;

        let reader: Box<dyn Readable> = Box::new(stream.clone());
        let writer: Box<dyn Writeable> = Box::new(stream);

        let shared = Arc::new(Shared {
            address: address.to_string(),
            max_bson_object_size,
            open: AtomicBool::new(true),
            pending_count: AtomicUsize::new(0),
            next_request_id: AtomicI32::new(0),
            writer: Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            state: Condvar::new(ConnState::Open),
            closed_listeners: Mutex::new(Vec::new()),
            orphaned_replies: AtomicUsize::new(0),
            reader_task: Mutex::new(None),
        });

        let reader_shared = shared.clone();
        let task = ChildTask::spawn(async move {
            Shared::run_reader(reader_shared, reader).await;
        });
        *shared.reader_task.lock().await = Some(task);

        Ok(Connection { shared })
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Number of in-flight messages; used by the pool's pick ladder.
    pub fn pending_count(&self) -> usize {
        self.shared.pending_count.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn orphaned_reply_count(&self) -> usize {
        self.shared.orphaned_replies.load(Ordering::Acquire)
    }

    /// A receiver that fires once when the connection closes. Each call
    /// subscribes a fresh listener (the "open -> false" property-change
    /// event of this connection's lifecycle).
    pub async fn closed_events(&self) -> channel::Receiver<()> {
        let (sender, receiver) = channel::bounded(1);
        let mut listeners = self.shared.closed_listeners.lock().await;
        if !self.is_open() {
            let _ = sender.try_send(());
        } else {
            listeners.push(sender);
        }
        receiver
    }

    pub async fn wait_for_closed(&self, timeout: Duration) -> bool {
        if !self.is_open() {
            return true;
        }

        let wait = async {
            loop {
                let state = self.shared.state.lock().await;
                if *state == ConnState::Closed {
                    return;
                }
                state.wait(()).await;
            }
        };

        future::timeout(timeout, wait).await.is_ok()
    }

    /// Encodes `message`, assigns the next request-id, registers the
    /// pending callback, and awaits the matching reply.
    pub async fn send(&self, message: Message) -> Result<ReplyMessage> {
        message.validate_size(self.shared.max_bson_object_size)?;

        {
            let state = self.shared.state.lock().await;
            if *state != ConnState::Open {
                return Err(Error::from(ConnectionLost::new(&self.shared.address)));
            }
        }

        let request_id = self.shared.allocate_request_id();
        let bytes = message.encode(request_id, 0)?;

        let (sender, receiver) = channel::bounded(1);
        self.shared.pending.lock().await.insert(request_id, sender);
        self.shared.pending_count.fetch_add(1, Ordering::AcqRel);

        let write_result = {
            let mut guard = self.shared.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(&bytes).await,
                None => Err(Error::from(ConnectionLost::new(&self.shared.address))),
            }
        };

        if let Err(e) = write_result {
            self.shared.pending.lock().await.remove(&request_id);
            self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
            self.close().await;
            return Err(e);
        }

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(Error::from(ConnectionLost::new(&self.shared.address))),
        }
    }

    /// Refuses new messages and closes once every in-flight reply lands
    /// (or `grace_period` elapses, whichever comes first).
    pub async fn shutdown(&self, grace_period: Duration) {
        {
            let mut state = self.shared.state.lock().await;
            if *state == ConnState::Open {
                *state = ConnState::Draining;
                state.notify_all();
            }
        }

        let drain = async {
            while self.pending_count() > 0 {
                task::sleep(Duration::from_millis(20)).await;
            }
        };
        let _ = future::timeout(grace_period, drain).await;

        self.close().await;
    }

    /// Hard close: fails every pending reply with *connection-lost* and
    /// tears down the socket halves.
    pub async fn close(&self) {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return;
        }

        *self.shared.writer.lock().await = None;

        let pending: Vec<_> = self.shared.pending.lock().await.drain().collect();
        for (_, sender) in pending {
            let _ = sender
                .send(Err(Error::from(ConnectionLost::new(&self.shared.address))))
                .await;
        }
        self.shared.pending_count.store(0, Ordering::Release);

        {
            let mut state = self.shared.state.lock().await;
            *state = ConnState::Closed;
            state.notify_all();
        }

        let listeners: Vec<_> = self.shared.closed_listeners.lock().await.drain(..).collect();
        for listener in listeners {
            let _ = listener.try_send(());
        }
    }
}

impl Shared {
    fn allocate_request_id(&self) -> i32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn run_reader(shared: Arc<Shared>, mut reader: Box<dyn Readable>) {
        loop {
            let mut header_bytes = [0u8; HEADER_LEN];
            if let Err(e) = reader.read_exact(&mut header_bytes).await {
                eprintln!(
                    "docdb: connection to {} lost while reading header: {}",
                    shared.address, e
                );
                break;
            }

            let header = match Header::decode(&header_bytes) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("docdb: decode failure from {}: {}", shared.address, e);
                    break;
                }
            };

            if header.total_length < HEADER_LEN as i32 {
                eprintln!(
                    "docdb: decode failure from {}: total_length smaller than header",
                    shared.address
                );
                break;
            }

            let mut body = vec![0u8; header.total_length as usize - HEADER_LEN];
            if let Err(e) = reader.read_exact(&mut body).await {
                eprintln!(
                    "docdb: connection to {} lost while reading body: {}",
                    shared.address, e
                );
                break;
            }

            let message = match Message::decode_body(&header, &body) {
                Ok(m) => m,
                Err(e) => {
                    eprintln!(
                        "docdb: {}",
                        Error::from(DecodeFailure {
                            reason: e.to_string()
                        })
                    );
                    break;
                }
            };

            let reply = match message.as_reply() {
                Some(r) => r.clone(),
                None => {
                    eprintln!(
                        "docdb: decode failure from {}: non-reply op-code on the wire",
                        shared.address
                    );
                    break;
                }
            };

            let sender = shared.pending.lock().await.remove(&header.response_to);
            match sender {
                Some(sender) => {
                    shared.pending_count.fetch_sub(1, Ordering::AcqRel);
                    let _ = sender.send(Ok(reply)).await;
                }
                None => {
                    shared.orphaned_replies.fetch_add(1, Ordering::Relaxed);
                    eprintln!(
                        "docdb: orphaned reply from {} for request {}",
                        shared.address, header.response_to
                    );
                }
            }
        }

        let conn = Connection { shared };
        conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_skip_zero() {
        let shared = Shared {
            address: "test".to_string(),
            max_bson_object_size: 1024,
            open: AtomicBool::new(true),
            pending_count: AtomicUsize::new(0),
            next_request_id: AtomicI32::new(-1),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            state: Condvar::new(ConnState::Open),
            closed_listeners: Mutex::new(Vec::new()),
            orphaned_replies: AtomicUsize::new(0),
            reader_task: Mutex::new(None),
        };

        assert_eq!(shared.allocate_request_id(), -1);
        assert_eq!(shared.allocate_request_id(), 1); // 0 is skipped.
    }
}
