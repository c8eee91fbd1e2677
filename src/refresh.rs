use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use crate::aggregate::Aggregation;
use crate::error::ListingError;
use crate::remote::FetchReport;
use crate::scope::Scope;
use crate::store::SourcesSignature;

/// Who asked for the work. Only user-initiated failures surface as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Background,
    User,
    /// Follow-up after a missing-sample fetch; the view is rebuilt from the
    /// merged cache instead of patched.
    MissingFetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started,
    AlreadyInFlight,
}

/// Messages from background workers back to the owning thread.
#[derive(Debug)]
pub enum Completion {
    Refreshed {
        scope: Scope,
        trigger: Trigger,
        signature: SourcesSignature,
        result: Result<Aggregation, ListingError>,
    },
    MissingFetched {
        subgroup_ids: Vec<String>,
        report: FetchReport,
    },
    /// A queued cache write finished; carries the persisted row count.
    CacheSaved {
        result: Result<usize, ListingError>,
    },
}

/// Single-flight launcher for background aggregations, one per scope key.
/// Workers never touch the table or the cache; they only send a
/// [`Completion`].
#[derive(Debug)]
pub struct RefreshCoordinator {
    in_flight: HashMap<String, Scope>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            in_flight: HashMap::new(),
            sender,
            receiver,
        }
    }

    pub fn sender(&self) -> Sender<Completion> {
        self.sender.clone()
    }

    pub fn is_in_flight(&self, scope: &Scope) -> bool {
        self.in_flight.contains_key(&scope.key())
    }

    /// Whether any running aggregation covers a subgroup of `scope`.
    pub fn overlaps(&self, scope: &Scope) -> bool {
        self.in_flight.values().any(|running| running.overlaps(scope))
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn request<F>(
        &mut self,
        scope: Scope,
        trigger: Trigger,
        signature: SourcesSignature,
        work: F,
    ) -> Result<RequestOutcome, ListingError>
    where
        F: FnOnce(Option<&[String]>) -> Result<Aggregation, ListingError> + Send + 'static,
    {
        let key = scope.key();
        if self.in_flight.contains_key(&key) {
            tracing::debug!(scope = %key, "refresh already in flight, dropping trigger");
            return Ok(RequestOutcome::AlreadyInFlight);
        }

        let sender = self.sender.clone();
        let running = scope.clone();
        let spawned = thread::Builder::new()
            .name("listing-refresh".to_string())
            .spawn(move || {
                let result = work(scope.subgroup_ids.as_deref());
                let _ = sender.send(Completion::Refreshed {
                    scope,
                    trigger,
                    signature,
                    result,
                });
            });
        spawned.map_err(|err| ListingError::RefreshFailed(err.to_string()))?;

        tracing::info!(scope = %key, ?trigger, "refresh started");
        self.in_flight.insert(key, running);
        Ok(RequestOutcome::Started)
    }

    /// Next completion without blocking.
    pub fn poll(&mut self) -> Option<Completion> {
        match self.receiver.try_recv() {
            Ok(completion) => Some(self.settle(completion)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => Some(self.settle(completion)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    fn settle(&mut self, completion: Completion) -> Completion {
        if let Completion::Refreshed { scope, result, .. } = &completion {
            self.in_flight.remove(&scope.key());
            match result {
                Ok(aggregation) => {
                    tracing::info!(scope = %scope.key(), rows = aggregation.rows.len(), "refresh finished")
                }
                Err(err) => tracing::warn!(scope = %scope.key(), error = %err, "refresh failed"),
            }
        }
        completion
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use super::*;

    #[test]
    fn second_trigger_for_same_scope_is_dropped() {
        let mut coordinator = RefreshCoordinator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Barrier::new(2));

        let scope = Scope {
            subgroup_ids: Some(vec!["g1".to_string()]),
            subgroup_order: Vec::new(),
        };

        let (first_runs, first_gate) = (Arc::clone(&runs), Arc::clone(&gate));
        let first = coordinator
            .request(scope.clone(), Trigger::Background, SourcesSignature::default(), move |_| {
                first_runs.fetch_add(1, Ordering::SeqCst);
                first_gate.wait();
                Ok(Aggregation::default())
            })
            .unwrap();

        let second_runs = Arc::clone(&runs);
        let second = coordinator
            .request(scope.clone(), Trigger::User, SourcesSignature::default(), move |_| {
                second_runs.fetch_add(1, Ordering::SeqCst);
                Ok(Aggregation::default())
            })
            .unwrap();

        assert_eq!(first, RequestOutcome::Started);
        assert_eq!(second, RequestOutcome::AlreadyInFlight);
        assert!(coordinator.overlaps(&Scope::all(Vec::new())));

        gate.wait();
        let completion = coordinator.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(completion, Completion::Refreshed { trigger: Trigger::Background, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!coordinator.overlaps(&scope));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn failure_returns_to_idle() {
        let mut coordinator = RefreshCoordinator::new();
        let scope = Scope::all(Vec::new());
        coordinator
            .request(scope.clone(), Trigger::User, SourcesSignature::default(), |_| {
                Err(ListingError::RefreshFailed("boom".to_string()))
            })
            .unwrap();

        let completion = coordinator.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(completion, Completion::Refreshed { result: Err(_), .. }));
        assert!(!coordinator.is_in_flight(&scope));
    }
}
