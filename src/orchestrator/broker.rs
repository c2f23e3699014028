//! Compute-once broadcast of stack outcomes.
//!
//! One producer task per distinct stack version publishes exactly one
//! outcome; any number of planning units wait on it. A unit registers at
//! most once: a second wait for the same batch ID means the pipeline is
//! awaiting the same dependency twice and is rejected.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::stack::Stack;

/// What a producer publishes: the ready stack or why it is not coming.
pub type StackOutcome = Result<Stack, String>;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("batch {0} is already waiting for its stack")]
    AlreadyWaiting(String),

    #[error("stack {0} was already published")]
    AlreadyPublished(String),

    #[error("stack {version} failed: {message}")]
    Failed { version: String, message: String },

    #[error("no stack {version} after {limit:?}")]
    Timeout { version: String, limit: Duration },

    #[error("cancelled while waiting for stack {0}")]
    Cancelled(String),
}

#[derive(Debug, Default)]
pub struct StackBroker {
    slots: Mutex<HashMap<String, watch::Sender<Option<StackOutcome>>>>,
    waiting: Mutex<HashSet<String>>,
}

impl StackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<StackOutcome>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, version: &str) -> watch::Sender<Option<StackOutcome>> {
        self.slots()
            .entry(version.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Publishes the single outcome for `version`.
    pub fn publish(&self, version: &str, outcome: StackOutcome) -> BrokerResult<()> {
        let slot = self.slot(version);
        let mut published = false;
        slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            published = true;
            true
        });
        if published {
            Ok(())
        } else {
            Err(BrokerError::AlreadyPublished(version.to_string()))
        }
    }

    /// Outcome for `version` if it has been published.
    pub fn published(&self, version: &str) -> Option<StackOutcome> {
        self.slots()
            .get(version)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Waits for the stack `batch_id` depends on.
    pub async fn wait_for(
        &self,
        batch_id: &str,
        version: &str,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> BrokerResult<Stack> {
        let registered = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch_id.to_string());
        if !registered {
            return Err(BrokerError::AlreadyWaiting(batch_id.to_string()));
        }

        let mut rx = self.slot(version).subscribe();
        let outcome = tokio::select! {
            res = tokio::time::timeout(limit, rx.wait_for(Option::is_some)) => match res {
                Ok(Ok(value)) => value.clone(),
                // The sender lives in `slots`, so the channel cannot close
                // while the broker exists.
                Ok(Err(_)) | Err(_) => None,
            },
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled(version.to_string())),
        };

        match outcome {
            Some(Ok(stack)) => Ok(stack),
            Some(Err(message)) => Err(BrokerError::Failed {
                version: version.to_string(),
                message,
            }),
            None => Err(BrokerError::Timeout {
                version: version.to_string(),
                limit,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;

    fn stack(version: &str) -> Stack {
        Stack {
            id: version.replace('.', ""),
            provisioner: "stateful".to_string(),
            version: version.to_string(),
            ready: true,
            elasticsearch: "https://es.example".to_string(),
            kibana: "https://kb.example".to_string(),
            username: "elastic".to_string(),
            password: "secret".to_string(),
            internal: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_later_publication() {
        let broker = Arc::new(StackBroker::new());
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let broker = broker.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    broker
                        .wait_for(id, "8.10.0", Duration::from_secs(5), &cancel)
                        .await
                })
            })
            .collect();

        tokio::task::yield_now().await;
        broker.publish("8.10.0", Ok(stack("8.10.0"))).unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().version, "8.10.0");
        }
    }

    #[tokio::test]
    async fn test_published_outcome_is_returned_immediately() {
        let broker = StackBroker::new();
        broker.publish("8.10.0", Err("quota exceeded".to_string())).unwrap();
        assert!(matches!(broker.published("8.10.0"), Some(Err(_))));

        let err = broker
            .wait_for("a", "8.10.0", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BrokerError::Failed {
                version: "8.10.0".to_string(),
                message: "quota exceeded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_second_wait_for_same_batch_is_rejected() {
        let broker = StackBroker::new();
        let cancel = CancellationToken::new();
        broker.publish("8.10.0", Ok(stack("8.10.0"))).unwrap();

        broker
            .wait_for("a", "8.10.0", Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let err = broker
            .wait_for("a", "8.10.0", Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::AlreadyWaiting("a".to_string()));
    }

    #[tokio::test]
    async fn test_second_publication_is_rejected() {
        let broker = StackBroker::new();
        broker.publish("8.10.0", Ok(stack("8.10.0"))).unwrap();
        assert_eq!(
            broker.publish("8.10.0", Err("late".to_string())),
            Err(BrokerError::AlreadyPublished("8.10.0".to_string()))
        );
        assert!(matches!(broker.published("8.10.0"), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let broker = StackBroker::new();
        let err = broker
            .wait_for("a", "9.0.0", Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let broker = StackBroker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = broker
            .wait_for("a", "9.0.0", Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Cancelled("9.0.0".to_string()));
    }
}
