// src/agent.rs
//! Transaction registry: matches responses to in-flight requests and
//! expires the ones whose deadline has passed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{StunError, StunResult};
use crate::message::{Message, TransactionId};

/// Terminal outcome of a transaction, delivered to its handler exactly
/// once.
#[derive(Debug)]
pub enum Event {
    /// A response with a matching transaction ID arrived.
    Success {
        transaction_id: TransactionId,
        message: Message,
    },
    /// The transaction resolved without a response: timed out, stopped,
    /// or torn down with the agent.
    Failure {
        transaction_id: TransactionId,
        error: StunError,
    },
}

impl Event {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Self::Success { transaction_id, .. } => *transaction_id,
            Self::Failure { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Callback receiving the terminal [`Event`] of a transaction.
///
/// Handlers run on the task that resolved the transaction and must not
/// block.
pub type Handler = Arc<dyn Fn(Event) + Send + Sync>;

/// The five operations the client needs from a transaction registry.
/// Abstracted so tests can substitute their own implementation.
pub trait ClientAgent: Send + Sync {
    /// Register a transaction. Fails with [`StunError::AgentClosed`] or
    /// [`StunError::TransactionExists`].
    fn start(&self, id: TransactionId, deadline: Instant, handler: Handler) -> StunResult<()>;

    /// Remove a transaction, resolving it with
    /// [`StunError::TransactionStopped`].
    fn stop(&self, id: TransactionId) -> StunResult<()>;

    /// Resolve the transaction matching `message` with a success event.
    /// Returns [`StunError::TransactionNotExists`] for unmatched
    /// messages, which callers are free to ignore.
    fn process(&self, message: Message) -> StunResult<()>;

    /// Resolve every transaction whose deadline is at or before `now`
    /// with [`StunError::TransactionTimedOut`].
    fn collect(&self, now: Instant) -> StunResult<()>;

    /// Resolve all remaining transactions with
    /// [`StunError::AgentClosed`] and reject further operations.
    fn close(&self) -> StunResult<()>;
}

struct AgentTransaction {
    deadline: Instant,
    handler: Handler,
}

#[derive(Default)]
struct AgentInner {
    transactions: HashMap<TransactionId, AgentTransaction>,
    closed: bool,
}

/// Default [`ClientAgent`]: a map guarded by a mutex.
///
/// Handlers are always invoked after the lock is released, so a handler
/// may call back into the agent.
#[derive(Default)]
pub struct Agent {
    inner: Mutex<AgentInner>,
}

impl Agent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientAgent for Agent {
    fn start(&self, id: TransactionId, deadline: Instant, handler: Handler) -> StunResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StunError::AgentClosed);
        }
        if inner.transactions.contains_key(&id) {
            return Err(StunError::TransactionExists);
        }
        inner
            .transactions
            .insert(id, AgentTransaction { deadline, handler });
        Ok(())
    }

    fn stop(&self, id: TransactionId) -> StunResult<()> {
        let transaction = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StunError::AgentClosed);
            }
            inner
                .transactions
                .remove(&id)
                .ok_or(StunError::TransactionNotExists)?
        };
        (transaction.handler)(Event::Failure {
            transaction_id: id,
            error: StunError::TransactionStopped,
        });
        Ok(())
    }

    fn process(&self, message: Message) -> StunResult<()> {
        let id = message.transaction_id;
        let transaction = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StunError::AgentClosed);
            }
            inner
                .transactions
                .remove(&id)
                .ok_or(StunError::TransactionNotExists)?
        };
        (transaction.handler)(Event::Success {
            transaction_id: id,
            message,
        });
        Ok(())
    }

    fn collect(&self, now: Instant) -> StunResult<()> {
        let expired: Vec<(TransactionId, AgentTransaction)> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StunError::AgentClosed);
            }
            let ids: Vec<TransactionId> = inner
                .transactions
                .iter()
                .filter(|(_, t)| t.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.transactions.remove(&id).map(|t| (id, t)))
                .collect()
        };
        for (id, transaction) in expired {
            (transaction.handler)(Event::Failure {
                transaction_id: id,
                error: StunError::TransactionTimedOut,
            });
        }
        Ok(())
    }

    fn close(&self) -> StunResult<()> {
        let remaining = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StunError::AgentClosed);
            }
            inner.closed = true;
            std::mem::take(&mut inner.transactions)
        };
        for (id, transaction) in remaining {
            (transaction.handler)(Event::Failure {
                transaction_id: id,
                error: StunError::AgentClosed,
            });
        }
        Ok(())
    }
}
