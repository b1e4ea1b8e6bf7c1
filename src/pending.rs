//! In-flight invocation table.

use crate::{connection::error::ClientError, invocation::InvocationRequest};
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;

/// Pending invocations keyed by id, guarded together with the session's
/// "active" signal. Because inserts observe the signal under the same lock
/// that shutdown cancels it, no entry can slip in once shutdown has begun.
pub(crate) struct PendingCalls {
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    active: CancellationToken,
    calls: HashMap<String, Arc<InvocationRequest>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        // Not live until the first activate().
        let active = CancellationToken::new();
        active.cancel();
        PendingCalls {
            inner: Mutex::new(PendingInner {
                active,
                calls: HashMap::new(),
            }),
        }
    }

    /// Installs a fresh active signal for a new session.
    pub fn activate(&self) {
        self.inner.lock().unwrap().active = CancellationToken::new();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().unwrap().active.is_cancelled()
    }

    pub fn insert(&self, request: Arc<InvocationRequest>) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.is_cancelled() {
            return Err(ClientError::ConnectionTerminated);
        }
        match inner.calls.entry(request.invocation_id().to_owned()) {
            Entry::Occupied(entry) => Err(ClientError::DuplicateInvocationId {
                id: entry.key().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    pub fn remove(&self, invocation_id: &str) -> Option<Arc<InvocationRequest>> {
        self.inner.lock().unwrap().calls.remove(invocation_id)
    }

    pub fn lookup(&self, invocation_id: &str) -> Option<Arc<InvocationRequest>> {
        self.inner.lock().unwrap().calls.get(invocation_id).cloned()
    }

    /// Cancels the active signal, then resolves every entry exactly once with
    /// the shutdown error (or a normal empty completion when there is none)
    /// and clears the table.
    pub fn shutdown(&self, error: Option<ClientError>) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.cancel();
        for (_, request) in inner.calls.drain() {
            match &error {
                Some(error) => request.fail(error.clone()),
                None => request.succeed(None),
            }
            request.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn unary(id: &str) -> (Arc<InvocationRequest>, flume::Receiver<crate::invocation::UnaryOutcome>) {
        let (request, receiver) = InvocationRequest::unary(id.into(), CancellationToken::new());
        (Arc::new(request), receiver)
    }

    #[test]
    fn duplicate_ids_are_rejected_and_the_first_stays_pending() {
        let pending = PendingCalls::new();
        pending.activate();

        let (first, _rx1) = unary("1");
        let (second, _rx2) = unary("1");
        pending.insert(first).unwrap();
        let error = pending.insert(second).unwrap_err();

        assert!(matches!(error, ClientError::DuplicateInvocationId { id } if id == "1"));
        assert!(pending.lookup("1").is_some());
    }

    #[test]
    fn inserts_after_shutdown_fail() {
        let pending = PendingCalls::new();
        pending.activate();
        pending.shutdown(None);

        let (request, _rx) = unary("1");
        let error = pending.insert(request).unwrap_err();
        assert!(matches!(error, ClientError::ConnectionTerminated));
    }

    #[test]
    fn shutdown_fails_every_entry_and_empties_the_table() {
        let pending = PendingCalls::new();
        pending.activate();

        let (first, rx1) = unary("1");
        let (second, rx2) = unary("2");
        pending.insert(first).unwrap();
        pending.insert(second).unwrap();

        pending.shutdown(Some(ClientError::ServerTimeout));

        assert!(matches!(rx1.try_recv().unwrap(), Err(ClientError::ServerTimeout)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(ClientError::ServerTimeout)));
        assert!(pending.lookup("1").is_none());
        assert!(pending.lookup("2").is_none());
    }

    #[test]
    fn clean_shutdown_completes_entries_normally() {
        let pending = PendingCalls::new();
        pending.activate();

        let (request, receiver) = unary("1");
        pending.insert(request).unwrap();
        pending.shutdown(None);

        assert_eq!(receiver.try_recv().unwrap(), Ok(None));
    }
}
