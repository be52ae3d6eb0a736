//! `FailOverCacheServer`: accepts registrations, persists entries per
//! namespace, and serves replay/range/clear/remove-up-to requests.
//!
//! A new registration with a higher `owner_tag` evicts whatever
//! registration currently holds the namespace — the new owner wins, the
//! old one's subsequent calls get `Fenced`.

use super::wire::{self, FocEntry, Opcode, RegisterPayload};
use crate::types::{NamespaceId, ScoNumber};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

struct Registration {
    owner_tag: u64,
    cluster_size: u32,
    entries: Vec<FocEntry>,
}

#[derive(Default)]
struct ServerState {
    registrations: HashMap<NamespaceId, Registration>,
}

/// Runs the FailOverCache listener. One `ServerState` is shared across all
/// connections; each connection handles exactly the namespace it
/// registered for the lifetime of the socket.
pub struct FailOverCacheServer {
    state: Arc<RwLock<ServerState>>,
}

impl Default for FailOverCacheServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FailOverCacheServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::default())),
        }
    }

    /// Binds and serves forever. Returns only on a listener-level I/O
    /// error (maps to exit code 3 at the binary's top level); per-connection
    /// errors are logged and close just that connection.
    pub async fn serve(&self, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "failovercache-server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted FOC connection");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    warn!(%peer, error = %e, "FOC connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<RwLock<ServerState>>,
) -> Result<(), wire::WireError> {
    let mut namespace: Option<NamespaceId> = None;
    loop {
        let (op, payload) = match wire::read_frame(&mut stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()), // peer closed the socket, not an error
        };
        let result = dispatch(op, &payload, &mut namespace, &state);
        match result {
            Ok(resp) => wire::write_frame(&mut stream, Opcode::Ok, &resp).await?,
            Err((code, msg)) => {
                let mut body = code.to_le_bytes().to_vec();
                body.extend_from_slice(msg.as_bytes());
                wire::write_frame(&mut stream, Opcode::Err, &body).await?;
            }
        }
    }
}

type DispatchErr = (u16, String);

fn dispatch(
    op: Opcode,
    payload: &[u8],
    namespace: &mut Option<NamespaceId>,
    state: &Arc<RwLock<ServerState>>,
) -> Result<Vec<u8>, DispatchErr> {
    match op {
        Opcode::Register => {
            let reg = wire::decode_register(payload)
                .map_err(|e| (1, e.to_string()))?;
            let mut s = state.write();
            let replace = match s.registrations.get(&reg.namespace) {
                Some(existing) => reg.owner_tag >= existing.owner_tag,
                None => true,
            };
            if !replace {
                return Err((
                    2,
                    format!("owner tag {} is stale for {}", reg.owner_tag, reg.namespace),
                ));
            }
            // Carry over whatever entries the previous owner (or our own
            // earlier connection) left behind. Re-registering after a crash
            // is the whole point of the failover cache; wiping the log here
            // would throw away exactly the data a restart needs to recover.
            let entries = s
                .registrations
                .get(&reg.namespace)
                .map(|existing| existing.entries.clone())
                .unwrap_or_default();
            s.registrations.insert(
                reg.namespace.clone(),
                Registration {
                    owner_tag: reg.owner_tag,
                    cluster_size: reg.cluster_size,
                    entries,
                },
            );
            *namespace = Some(reg.namespace);
            Ok(vec![])
        }
        Opcode::Unregister => {
            let ns = current_namespace(namespace)?;
            state.write().registrations.remove(&ns);
            *namespace = None;
            Ok(vec![])
        }
        Opcode::AddEntries => {
            let ns = current_namespace(namespace)?;
            let entries =
                wire::decode_entries(payload).map_err(|e| (3, e.to_string()))?;
            let mut s = state.write();
            let reg = s
                .registrations
                .get_mut(&ns)
                .ok_or_else(|| (4, format!("namespace {ns} not registered")))?;
            reg.entries.extend(entries);
            Ok(vec![])
        }
        Opcode::Flush => Ok(vec![]),
        Opcode::Clear => {
            let ns = current_namespace(namespace)?;
            if let Some(reg) = state.write().registrations.get_mut(&ns) {
                reg.entries.clear();
            }
            Ok(vec![])
        }
        Opcode::GetSCORange | Opcode::GetEntries => {
            let ns = current_namespace(namespace)?;
            let s = state.read();
            let reg = s
                .registrations
                .get(&ns)
                .ok_or_else(|| (4, format!("namespace {ns} not registered")))?;
            Ok(wire::encode_entries(&reg.entries))
        }
        Opcode::GetSCO => {
            let ns = current_namespace(namespace)?;
            let sco = decode_sco(payload)?;
            let s = state.read();
            let reg = s
                .registrations
                .get(&ns)
                .ok_or_else(|| (4, format!("namespace {ns} not registered")))?;
            let matching: Vec<FocEntry> = reg
                .entries
                .iter()
                .filter(|e| e.cl.sco_number == sco)
                .cloned()
                .collect();
            Ok(wire::encode_entries(&matching))
        }
        Opcode::RemoveUpTo => {
            let ns = current_namespace(namespace)?;
            let sco = decode_sco(payload)?;
            let mut s = state.write();
            if let Some(reg) = s.registrations.get_mut(&ns) {
                reg.entries.retain(|e| e.cl.sco_number > sco);
            }
            Ok(vec![])
        }
        Opcode::Ok | Opcode::Err => {
            Err((5, "client sent a reply opcode".to_string()))
        }
    }
}

fn current_namespace(namespace: &Option<NamespaceId>) -> Result<NamespaceId, DispatchErr> {
    namespace
        .clone()
        .ok_or_else(|| (6, "connection has not registered a namespace".to_string()))
}

fn decode_sco(payload: &[u8]) -> Result<ScoNumber, DispatchErr> {
    payload
        .get(0 .. 4)
        .map(|b| ScoNumber::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| (7, "missing sco number in payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterLocation;

    fn fresh_state() -> Arc<RwLock<ServerState>> {
        Arc::new(RwLock::new(ServerState::default()))
    }

    #[test]
    fn higher_owner_tag_fences_out_lower() {
        let state = fresh_state();
        let mut ns = None;
        let reg1 = wire::encode_register(&RegisterPayload {
            namespace: "ns0".to_string(),
            cluster_size: 4096,
            owner_tag: 1,
        });
        dispatch(Opcode::Register, &reg1, &mut ns, &state).unwrap();

        let reg0 = wire::encode_register(&RegisterPayload {
            namespace: "ns0".to_string(),
            cluster_size: 4096,
            owner_tag: 0,
        });
        let mut other_ns = None;
        let err = dispatch(Opcode::Register, &reg0, &mut other_ns, &state)
            .unwrap_err();
        assert_eq!(err.0, 2);
    }

    #[test]
    fn add_then_get_range_returns_in_order() {
        let state = fresh_state();
        let mut ns = None;
        let reg = wire::encode_register(&RegisterPayload {
            namespace: "ns0".to_string(),
            cluster_size: 4096,
            owner_tag: 0,
        });
        dispatch(Opcode::Register, &reg, &mut ns, &state).unwrap();

        let entries = vec![
            FocEntry { cl: ClusterLocation::new(1, 0), lba: 0, bytes: vec![1] },
            FocEntry { cl: ClusterLocation::new(1, 1), lba: 1, bytes: vec![2] },
        ];
        let payload = wire::encode_entries(&entries);
        dispatch(Opcode::AddEntries, &payload, &mut ns, &state).unwrap();

        let resp = dispatch(Opcode::GetSCORange, &[], &mut ns, &state).unwrap();
        assert_eq!(wire::decode_entries(&resp).unwrap(), entries);
    }

    #[test]
    fn remove_up_to_drops_earlier_scos() {
        let state = fresh_state();
        let mut ns = None;
        let reg = wire::encode_register(&RegisterPayload {
            namespace: "ns0".to_string(),
            cluster_size: 4096,
            owner_tag: 0,
        });
        dispatch(Opcode::Register, &reg, &mut ns, &state).unwrap();
        let entries = vec![
            FocEntry { cl: ClusterLocation::new(1, 0), lba: 0, bytes: vec![1] },
            FocEntry { cl: ClusterLocation::new(2, 0), lba: 1, bytes: vec![2] },
        ];
        let payload = wire::encode_entries(&entries);
        dispatch(Opcode::AddEntries, &payload, &mut ns, &state).unwrap();

        dispatch(Opcode::RemoveUpTo, &1u32.to_le_bytes(), &mut ns, &state).unwrap();
        let resp = dispatch(Opcode::GetSCORange, &[], &mut ns, &state).unwrap();
        let remaining = wire::decode_entries(&resp).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].cl.sco_number, 2);
    }
}
