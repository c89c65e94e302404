//! Registry of in-flight requests
//!
//! Maps each [`RequestId`] to the local socket carrying it. The broker
//! registers entries with a deadline so a request whose peer never closes
//! is eventually evicted; the agent registers without one.

use backhaul_proto::RequestId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::socket::LocalSocket;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Request {0} is already registered")]
    DuplicateRequest(RequestId),
}

struct PendingRequest {
    socket: LocalSocket,
    deadline: Option<JoinHandle<()>>,
    registered_at: Instant,
}

impl PendingRequest {
    fn cancel_deadline(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}

/// Called with the id of each request evicted by its deadline
pub type ExpiryHook = Arc<dyn Fn(RequestId) + Send + Sync>;

/// Shared map of live requests.
///
/// Cloning yields another handle to the same map.
#[derive(Clone, Default)]
pub struct RequestRegistry {
    requests: Arc<DashMap<RequestId, PendingRequest>>,
    on_expire: Option<ExpiryHook>,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` after a deadline evicts an entry and closes its socket
    pub fn with_expiry_hook(mut self, hook: impl Fn(RequestId) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(hook));
        self
    }

    /// Register a socket under `request_id`. Never overwrites.
    pub fn register(&self, request_id: RequestId, socket: LocalSocket) -> Result<(), RegistryError> {
        match self.requests.entry(request_id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateRequest(request_id)),
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    socket,
                    deadline: None,
                    registered_at: Instant::now(),
                });
                debug!(request_id = %request_id, "Registered request");
                Ok(())
            }
        }
    }

    /// Register a socket that is closed and evicted once `timeout` elapses
    pub fn register_with_deadline(
        &self,
        request_id: RequestId,
        socket: LocalSocket,
        timeout: Duration,
    ) -> Result<(), RegistryError> {
        match self.requests.entry(request_id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateRequest(request_id)),
            Entry::Vacant(entry) => {
                let requests = Arc::downgrade(&self.requests);
                let on_expire = self.on_expire.clone();
                let deadline = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    Self::expire(requests, request_id, timeout, on_expire);
                });

                entry.insert(PendingRequest {
                    socket,
                    deadline: Some(deadline),
                    registered_at: Instant::now(),
                });
                debug!(
                    request_id = %request_id,
                    timeout_secs = timeout.as_secs(),
                    "Registered request"
                );
                Ok(())
            }
        }
    }

    fn expire(
        requests: Weak<DashMap<RequestId, PendingRequest>>,
        request_id: RequestId,
        timeout: Duration,
        on_expire: Option<ExpiryHook>,
    ) {
        let Some(requests) = requests.upgrade() else {
            return;
        };
        // The deadline handle is the running task itself; dropping it detaches.
        if let Some((_, pending)) = requests.remove(&request_id) {
            pending.socket.close();
            warn!(
                request_id = %request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            if let Some(hook) = on_expire {
                hook(request_id);
            }
        }
    }

    pub fn get(&self, request_id: &RequestId) -> Option<LocalSocket> {
        self.requests
            .get(request_id)
            .map(|pending| pending.socket.clone())
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.requests.contains_key(request_id)
    }

    /// Remove an entry, cancelling its deadline. The socket is left open.
    pub fn remove(&self, request_id: &RequestId) -> Option<LocalSocket> {
        self.requests.remove(request_id).map(|(_, mut pending)| {
            pending.cancel_deadline();
            debug!(
                request_id = %request_id,
                age_ms = pending.registered_at.elapsed().as_millis() as u64,
                "Removed request"
            );
            pending.socket
        })
    }

    /// Remove an entry and close its socket. Returns false if it was absent.
    pub fn close(&self, request_id: &RequestId) -> bool {
        match self.remove(request_id) {
            Some(socket) => {
                socket.close();
                true
            }
            None => false,
        }
    }

    /// Remove and close every entry, returning how many there were
    pub fn close_all(&self) -> usize {
        let ids = self.ids();
        let mut closed = 0;
        for request_id in ids {
            if self.close(&request_id) {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!("Closed {} pending requests", closed);
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|entry| *entry.key()).collect()
    }
}
