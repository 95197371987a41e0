use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ktunnel::tunnel::{connection::Connection, link::ControlLink};

/// Line written to a refused client before it is dropped.
pub const REFUSAL_LINE: &[u8] = b"max tunnel limit reached\n";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("max tunnel limit of {0} reached")]
    AtCapacity(usize),
    #[error("channel {0} already exists")]
    DuplicateId(u16),
    #[error("no free channel id")]
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: u16,
    pub started_at_unix_ms: u64,
    pub closed: bool,
}

struct State {
    table: HashMap<u16, Arc<Connection>>,
    next_id: u16,
}

/// Channel id -> Connection table with admission control.
///
/// One lock guards the whole table; creation fails instead of waiting once `max_size`
/// connections are registered.
pub struct Connections {
    state: Mutex<State>,
    max_size: usize,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl Connections {
    pub fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                table: HashMap::new(),
                next_id: 1,
            }),
            max_size: max_size.min(u16::MAX as usize),
            idle_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new Connection writing to `link`.
    ///
    /// `id == 0` allocates the next free id (1..=65535, wrapping back to 1); any other id is
    /// taken as given and must not be in use. When the table is full and `direct` is set, a
    /// one-line refusal is written to it.
    pub async fn create(
        &self,
        link: ControlLink,
        id: u16,
        direct: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<Arc<Connection>, RegistryError> {
        let res = self.insert(link, id);

        if let Err(RegistryError::AtCapacity(max)) = &res {
            tracing::debug!(max, "tunnel: max tunnel limit reached; refusing connection");
            metrics::counter!("ktunnel_channels_refused_total").increment(1);
            if let Some(w) = direct {
                let _ = w.write_all(REFUSAL_LINE).await;
                let _ = w.flush().await;
            }
        }

        if res.is_ok() {
            metrics::counter!("ktunnel_channels_total").increment(1);
        }
        res
    }

    fn insert(&self, link: ControlLink, id: u16) -> Result<Arc<Connection>, RegistryError> {
        let mut st = self.lock();
        if st.table.len() >= self.max_size {
            return Err(RegistryError::AtCapacity(self.max_size));
        }

        let id = if id == 0 {
            allocate_id(&mut st)?
        } else if st.table.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        } else {
            id
        };

        let conn = Connection::new(id, link, self.idle_timeout);
        st.table.insert(id, conn.clone());
        metrics::gauge!("ktunnel_channels_active").set(st.table.len() as f64);
        Ok(conn)
    }

    pub fn get(&self, id: u16, remove: bool) -> Option<Arc<Connection>> {
        let mut st = self.lock();
        let found = if remove {
            st.table.remove(&id)
        } else {
            st.table.get(&id).cloned()
        };
        if remove && found.is_some() {
            metrics::gauge!("ktunnel_channels_active").set(st.table.len() as f64);
        }
        found
    }

    pub fn remove(&self, id: u16) -> bool {
        self.get(id, true).is_some()
    }

    /// Removes `conn` only if its id still maps to this very Connection.
    pub fn release(&self, conn: &Arc<Connection>) -> bool {
        let mut st = self.lock();
        let same = st
            .table
            .get(&conn.id())
            .is_some_and(|c| Arc::ptr_eq(c, conn));
        if same {
            st.table.remove(&conn.id());
            metrics::gauge!("ktunnel_channels_active").set(st.table.len() as f64);
        }
        same
    }

    /// Unregisters and disconnects every Connection. Returns how many there were.
    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut st = self.lock();
            st.table.drain().map(|(_, c)| c).collect()
        };
        metrics::gauge!("ktunnel_channels_active").set(0.0);
        for conn in &drained {
            conn.disconnect();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .table
            .values()
            .map(|c| ChannelSnapshot {
                id: c.id(),
                started_at_unix_ms: c.started_at_unix_ms(),
                closed: c.is_closed(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u16) {
        self.lock().next_id = id;
    }
}

fn allocate_id(st: &mut State) -> Result<u16, RegistryError> {
    for _ in 0..u16::MAX {
        let id = st.next_id;
        st.next_id = if id == u16::MAX { 1 } else { id + 1 };
        if !st.table.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(RegistryError::Exhausted)
}
