//! Requests parked by the parent while another content process takes them over.

use pd_channel::ActorKey;
use pd_channel::ProcessId;
use pd_core::NetError;
use pd_net::NetworkRequest;
use pd_privacy::LoadContext;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarError {
    Unknown,
    /// The id was registered for a different destination process.
    WrongProcess,
    AlreadyClaimed,
}

pub struct PendingRedirect {
    pub origin: ActorKey,
    pub destination: ProcessId,
    request: Option<Box<dyn NetworkRequest>>,
    load_context: Option<LoadContext>,
}

impl fmt::Debug for PendingRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRedirect")
            .field("origin", &self.origin)
            .field("destination", &self.destination)
            .field("claimed", &self.request.is_none())
            .finish_non_exhaustive()
    }
}

impl PendingRedirect {
    /// The request, if the destination never connected to it.
    pub fn take_request(&mut self) -> Option<Box<dyn NetworkRequest>> {
        self.request.take()
    }
}

#[derive(Debug, Default)]
pub struct RedirectRegistrar {
    next_id: u64,
    entries: BTreeMap<u64, PendingRedirect>,
}

impl RedirectRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(
        &mut self,
        origin: ActorKey,
        destination: ProcessId,
        request: Box<dyn NetworkRequest>,
        load_context: Option<LoadContext>,
    ) -> u64 {
        self.next_id += 1;
        self.entries.insert(
            self.next_id,
            PendingRedirect {
                origin,
                destination,
                request: Some(request),
                load_context,
            },
        );
        self.next_id
    }

    /// Hands the parked request to the actor `process` connected for it.
    pub fn claim(
        &mut self,
        registrar_id: u64,
        process: ProcessId,
    ) -> Result<(Box<dyn NetworkRequest>, Option<LoadContext>), RegistrarError> {
        let entry = self
            .entries
            .get_mut(&registrar_id)
            .ok_or(RegistrarError::Unknown)?;
        if entry.destination != process {
            return Err(RegistrarError::WrongProcess);
        }
        let request = entry
            .request
            .take()
            .ok_or(RegistrarError::AlreadyClaimed)?;
        Ok((request, entry.load_context.clone()))
    }

    /// Removes the entry once the destination reports the outcome.
    pub fn finish(
        &mut self,
        registrar_id: u64,
        process: ProcessId,
    ) -> Result<PendingRedirect, RegistrarError> {
        let entry = self
            .entries
            .get(&registrar_id)
            .ok_or(RegistrarError::Unknown)?;
        if entry.destination != process {
            return Err(RegistrarError::WrongProcess);
        }
        self.entries
            .remove(&registrar_id)
            .ok_or(RegistrarError::Unknown)
    }

    /// Removes every entry waiting on `process`.
    pub fn drain_destination(&mut self, process: ProcessId) -> Vec<PendingRedirect> {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.destination == process)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

/// Cancels a parked request that will never be connected.
pub fn abandon(mut entry: PendingRedirect, status: NetError) {
    if let Some(mut request) = entry.take_request() {
        request.cancel(status);
    }
}
