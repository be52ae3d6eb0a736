//! `FailOverCacheClient`: streams every cluster write to a remote FOC
//! server. Two modes: `Synchronous` (the caller's `add` doesn't return
//! until the server acks) and `Asynchronous` (bounded write-behind queue,
//! a background task drains it; `add` only blocks if the queue is full).

use super::{
    wire::{self, FocEntry, Opcode, RegisterPayload},
    FoCError,
};
use crate::types::{ClusterLocation, NamespaceId, OwnerTag, ScoNumber};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::Mutex,
    time::timeout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocMode {
    Synchronous,
    Asynchronous { queue_depth: usize },
}

/// Callback invoked when the background write-behind task hits an error
/// it can't recover from inline; `VolumeEngine`'s `HealthMonitor` wires
/// this to its `Running -> Degraded` transition.
pub type DegradedCallback = Arc<dyn Fn(FoCError) + Send + Sync>;

struct Conn {
    stream: TcpStream,
}

/// One cluster write queued for write-behind delivery.
struct QueuedEntry {
    entry: FocEntry,
}

pub struct FailOverCacheClient {
    addr: String,
    namespace: NamespaceId,
    cluster_size: u32,
    owner_tag: OwnerTag,
    mode: FocMode,
    timeout: Duration,
    conn: Mutex<Option<Conn>>,
    queue_tx: Option<async_channel::Sender<QueuedEntry>>,
    on_degraded: Option<DegradedCallback>,
}

impl FailOverCacheClient {
    /// Connects, registers `(namespace, cluster_size, owner_tag)`, and for
    /// `Asynchronous` mode spawns the background drain task.
    pub async fn connect(
        addr: String,
        namespace: NamespaceId,
        cluster_size: u32,
        owner_tag: OwnerTag,
        mode: FocMode,
        timeout: Duration,
        on_degraded: Option<DegradedCallback>,
    ) -> Result<Arc<Self>, FoCError> {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FoCError::Connect {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        let mut conn = Conn { stream };
        Self::do_register(&mut conn, &namespace, cluster_size, owner_tag).await?;

        let (queue_tx, queue_rx) = match mode {
            FocMode::Synchronous => (None, None),
            FocMode::Asynchronous { queue_depth } => {
                let (tx, rx) = async_channel::bounded(queue_depth);
                (Some(tx), Some(rx))
            }
        };

        let client = Arc::new(Self {
            addr,
            namespace,
            cluster_size,
            owner_tag,
            mode,
            timeout,
            conn: Mutex::new(Some(conn)),
            queue_tx,
            on_degraded,
        });

        if let Some(rx) = queue_rx {
            let drain_client = client.clone();
            tokio::spawn(async move { drain_client.run_drain_task(rx).await });
        }

        Ok(client)
    }

    /// Background write-behind loop for `Asynchronous` mode: pulls queued
    /// entries and ships them one at a time, reporting to the
    /// `HealthMonitor` callback on any delivery failure.
    async fn run_drain_task(
        self: Arc<Self>,
        rx: async_channel::Receiver<QueuedEntry>,
    ) {
        while let Ok(queued) = rx.recv().await {
            if let Err(e) = self.send_entries(std::slice::from_ref(&queued.entry)).await {
                self.report_degraded(e);
            }
        }
    }

    async fn do_register(
        conn: &mut Conn,
        namespace: &str,
        cluster_size: u32,
        owner_tag: OwnerTag,
    ) -> Result<(), FoCError> {
        let payload = wire::encode_register(&RegisterPayload {
            namespace: namespace.to_string(),
            cluster_size,
            owner_tag: owner_tag.0,
        });
        wire::write_frame(&mut conn.stream, Opcode::Register, &payload).await?;
        let (op, resp) = wire::read_frame(&mut conn.stream).await?;
        match op {
            Opcode::Ok => Ok(()),
            Opcode::Err => Err(decode_server_error(&resp)),
            _ => Err(FoCError::Wire {
                message: "unexpected reply to Register".to_string(),
            }),
        }
    }

    pub fn mode(&self) -> FocMode {
        self.mode
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Streams one cluster write. In `Synchronous` mode, returns only once
    /// the server has acked (contract 3). In `Asynchronous` mode, enqueues
    /// and returns once there's room in the queue — actual delivery is the
    /// background task's job, started by a fully queue-owning variant of
    /// this client (`spawn_drain_task`).
    pub async fn add(
        &self,
        cl: ClusterLocation,
        lba: u64,
        bytes: Vec<u8>,
    ) -> Result<(), FoCError> {
        let entry = FocEntry { cl, lba, bytes };
        match &self.queue_tx {
            None => self.send_entries(std::slice::from_ref(&entry)).await,
            Some(tx) => tx
                .send(QueuedEntry { entry })
                .await
                .map_err(|_| FoCError::Wire {
                    message: "write-behind queue closed".to_string(),
                }),
        }
    }

    async fn send_entries(&self, entries: &[FocEntry]) -> Result<(), FoCError> {
        let payload = wire::encode_entries(entries);
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| FoCError::Connect {
            addr: self.addr.clone(),
            message: "not connected".to_string(),
        })?;
        timeout(self.timeout, async {
            wire::write_frame(&mut conn.stream, Opcode::AddEntries, &payload).await?;
            let (op, resp) = wire::read_frame(&mut conn.stream).await?;
            match op {
                Opcode::Ok => Ok(()),
                Opcode::Err => Err(decode_server_error(&resp)),
                _ => Err(FoCError::Wire {
                    message: "unexpected reply to AddEntries".to_string(),
                }),
            }
        })
        .await
        .map_err(|_| FoCError::Timeout {
            millis: self.timeout.as_millis() as u64,
        })?
    }

    pub async fn flush(&self) -> Result<(), FoCError> {
        self.roundtrip(Opcode::Flush, &[]).await.map(|_| ())
    }

    pub async fn remove_up_to(&self, sco: ScoNumber) -> Result<(), FoCError> {
        self.roundtrip(Opcode::RemoveUpTo, &sco.to_le_bytes())
            .await
            .map(|_| ())
    }

    pub async fn clear(&self) -> Result<(), FoCError> {
        self.roundtrip(Opcode::Clear, &[]).await.map(|_| ())
    }

    pub async fn unregister(&self) -> Result<(), FoCError> {
        self.roundtrip(Opcode::Unregister, &[]).await.map(|_| ())
    }

    /// Replays every entry the server still holds for this namespace,
    /// newest-registration-since last cork — used on restart (S3).
    pub async fn get_range(&self) -> Result<Vec<FocEntry>, FoCError> {
        let resp = self.roundtrip(Opcode::GetSCORange, &[]).await?;
        Ok(wire::decode_entries(&resp)?)
    }

    pub async fn get_sco(&self, sco: ScoNumber) -> Result<Vec<FocEntry>, FoCError> {
        let resp = self.roundtrip(Opcode::GetSCO, &sco.to_le_bytes()).await?;
        Ok(wire::decode_entries(&resp)?)
    }

    async fn roundtrip(
        &self,
        op: Opcode,
        payload: &[u8],
    ) -> Result<Vec<u8>, FoCError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| FoCError::Connect {
            addr: self.addr.clone(),
            message: "not connected".to_string(),
        })?;
        timeout(self.timeout, async {
            wire::write_frame(&mut conn.stream, op, payload).await?;
            let (reply_op, resp) = wire::read_frame(&mut conn.stream).await?;
            match reply_op {
                Opcode::Ok => Ok(resp),
                Opcode::Err => Err(decode_server_error(&resp)),
                _ => Err(FoCError::Wire {
                    message: "unexpected reply opcode".to_string(),
                }),
            }
        })
        .await
        .map_err(|_| FoCError::Timeout {
            millis: self.timeout.as_millis() as u64,
        })?
    }

    /// Notifies the `HealthMonitor` (if wired) that this connection has
    /// become unusable.
    pub fn report_degraded(&self, err: FoCError) {
        if let Some(cb) = &self.on_degraded {
            cb(err);
        }
    }
}

fn decode_server_error(resp: &[u8]) -> FoCError {
    if resp.len() < 2 {
        return FoCError::Wire {
            message: "truncated error reply".to_string(),
        };
    }
    let code = u16::from_le_bytes([resp[0], resp[1]]);
    let message = String::from_utf8_lossy(&resp[2 ..]).to_string();
    FoCError::ServerError { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_mode_has_no_queue() {
        assert!(matches!(FocMode::Synchronous, FocMode::Synchronous));
    }
}
