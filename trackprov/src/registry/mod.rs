//! Registry of granted serial ports.
//!
//! The registry is a process-wide service, but it is passed around as an
//! `Arc<ChannelRegistry>` rather than living in a global. Sessions read it;
//! only discovery, grants and selection mutate it, and grants are
//! serialized so the same physical port is never registered twice.

mod port;

pub use port::{
    PortDescriptor, PortFilter, PortIdentity, PortInfo, PortScanner, StaticScanner, SystemScanner,
    VID_ESPRESSIF, VID_FTDI, VID_SILICON_LABS, VID_WCH,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, info};

use crate::error::{RegistryError, Result};
use crate::transport::ChannelHandle;

/// Asks an operator to pick a port. This is the consent step.
#[async_trait]
pub trait PortPicker: Send + Sync {
    /// Return the index of the chosen candidate, or `None` if the operator
    /// declined.
    async fn pick(&self, candidates: &[PortInfo]) -> Option<usize>;
}

/// Result of a grant request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The operator chose a port; it is registered and selected.
    Granted { index: usize, port: PortInfo },
    /// The operator declined. Not an error.
    Cancelled,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Granted ports keyed by path, in grant order.
    entries: IndexMap<String, PortInfo>,
    selected: Option<usize>,
}

/// Tracks granted ports, the operator's selection, and open handles that can
/// be adopted.
pub struct ChannelRegistry {
    scanner: Box<dyn PortScanner>,
    picker: Option<Box<dyn PortPicker>>,
    state: RwLock<RegistryState>,
    live: Mutex<IndexMap<String, ChannelHandle>>,
    grant_lock: tokio::sync::Mutex<()>,
}

impl ChannelRegistry {
    /// Create a registry that discovers ports with `scanner`.
    pub fn new(scanner: impl PortScanner + 'static) -> Self {
        Self {
            scanner: Box::new(scanner),
            picker: None,
            state: RwLock::new(RegistryState::default()),
            live: Mutex::new(IndexMap::new()),
            grant_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry backed by the system's port enumeration.
    pub fn system() -> Self {
        Self::new(SystemScanner)
    }

    /// Registry with no ports to discover.
    pub fn empty() -> Self {
        Self::new(StaticScanner::default())
    }

    /// Install the consent step used by [`request_new_grant`](Self::request_new_grant).
    pub fn with_picker(mut self, picker: impl PortPicker + 'static) -> Self {
        self.picker = Some(Box::new(picker));
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, IndexMap<String, ChannelHandle>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Granted ports in grant order.
    pub fn list_granted(&self) -> Vec<PortInfo> {
        self.read().entries.values().cloned().collect()
    }

    /// Number of granted ports.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Register a port directly, e.g. one remembered from a previous run.
    ///
    /// Returns its index. Registering a known path keeps the original entry.
    pub fn register(&self, port: PortInfo) -> usize {
        let mut state = self.write();
        if let Some(index) = state.entries.get_index_of(port.descriptor.path()) {
            return index;
        }
        debug!("registered port {}", port);
        let (index, _) = state
            .entries
            .insert_full(port.descriptor.path().to_string(), port);
        index
    }

    /// Register every present port matching `filter`.
    ///
    /// Returns how many entries are new.
    pub async fn discover(&self, filter: &PortFilter) -> Result<usize> {
        let _grant = self.grant_lock.lock().await;
        let found = self.scanner.scan()?;
        let before = self.len();
        for port in found.into_iter().filter(|p| filter.matches(p)) {
            self.register(port);
        }
        let added = self.len() - before;
        if added > 0 {
            info!("discovered {} serial port(s)", added);
        }
        Ok(added)
    }

    /// Ask the operator to grant access to a port matching `filter`.
    ///
    /// Grant requests are serialized. A granted port becomes the selection.
    pub async fn request_new_grant(&self, filter: &PortFilter) -> Result<GrantOutcome> {
        let picker = self.picker.as_ref().ok_or(RegistryError::NoPicker)?;
        let _grant = self.grant_lock.lock().await;

        let candidates: Vec<PortInfo> = self
            .scanner
            .scan()?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        if candidates.is_empty() {
            debug!("no ports match the grant filter");
            return Ok(GrantOutcome::Cancelled);
        }

        let Some(choice) = picker.pick(&candidates).await else {
            debug!("port grant declined");
            return Ok(GrantOutcome::Cancelled);
        };
        let Some(port) = candidates.get(choice).cloned() else {
            return Err(RegistryError::InvalidIndex {
                index: choice,
                len: candidates.len(),
            }
            .into());
        };

        let index = self.register(port.clone());
        self.write().selected = Some(index);
        info!("granted serial port {}", port);
        Ok(GrantOutcome::Granted { index, port })
    }

    /// Select the granted port at `index`.
    pub fn select(&self, index: usize) -> Result<PortInfo> {
        let mut state = self.write();
        let len = state.entries.len();
        let port = state
            .entries
            .get_index(index)
            .map(|(_, port)| port.clone())
            .ok_or(RegistryError::InvalidIndex { index, len })?;
        state.selected = Some(index);
        Ok(port)
    }

    /// The port a session should use when none is passed explicitly.
    ///
    /// This is the explicit selection, or the only entry when exactly one
    /// exists. It never guesses among several.
    pub fn selected(&self) -> Option<PortDescriptor> {
        let state = self.read();
        let index = match state.selected {
            Some(index) => index,
            None if state.entries.len() == 1 => 0,
            None => return None,
        };
        state
            .entries
            .get_index(index)
            .map(|(_, port)| port.descriptor.clone())
    }

    /// Index of the explicit selection.
    pub fn selected_index(&self) -> Option<usize> {
        self.read().selected
    }

    /// Record an open handle so it can be adopted later.
    pub(crate) fn attach(&self, handle: &ChannelHandle) {
        self.live()
            .insert(handle.port().path().to_string(), handle.clone());
    }

    /// Forget a handle that has been closed.
    pub(crate) fn detach(&self, handle: &ChannelHandle) {
        let mut live = self.live();
        let path = handle.port().path();
        if live.get(path).is_some_and(|h| h.same_handle(handle)) {
            live.shift_remove(path);
        }
    }

    /// Find an open, readable, unclaimed handle and claim it.
    ///
    /// A handle on `preferred` is tried first.
    pub(crate) fn find_adoptable(&self, preferred: &PortDescriptor) -> Option<ChannelHandle> {
        let mut live = self.live();
        live.retain(|_, handle| handle.is_readable());

        if let Some(handle) = live.get(preferred.path()) {
            if handle.try_claim() {
                return Some(handle.clone());
            }
        }
        live.values().find(|handle| handle.try_claim()).cloned()
    }
}
