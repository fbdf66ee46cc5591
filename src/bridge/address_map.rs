use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Addresses of a client connection as seen by the front-facing listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySocketAddressInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Backend-local socket address -> originating client addresses.
///
/// Entries live exactly as long as the bridged connection that created them.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    entries: Arc<Mutex<HashMap<SocketAddr, ProxySocketAddressInfo>>>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `info` under `backend_local`; the entry is removed when the lease drops.
    pub fn insert(&self, backend_local: SocketAddr, info: ProxySocketAddressInfo) -> AddressLease {
        self.entries().insert(backend_local, info);
        AddressLease {
            map: self.clone(),
            key: backend_local,
        }
    }

    pub fn get(&self, backend_local: &SocketAddr) -> Option<ProxySocketAddressInfo> {
        self.entries().get(backend_local).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SocketAddr, ProxySocketAddressInfo>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its entry from the [`AddressMap`] on drop.
#[derive(Debug)]
pub struct AddressLease {
    map: AddressMap,
    key: SocketAddr,
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        self.map.entries().remove(&self.key);
    }
}
