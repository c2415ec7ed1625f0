//! Per-system priority queue of pending calls.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::IntegrationError;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased outbound call. `attempt` may run several times; the first success or
/// the call to `fail` resolves the caller exactly once.
pub(crate) trait Job: Send + Sync {
    fn attempt(&self) -> BoxFuture<'_, Result<(), IntegrationError>>;

    fn fail(&self, err: IntegrationError);
}

pub(crate) struct ActionJob<T, F> {
    action: F,
    reply: Mutex<Option<oneshot::Sender<Result<T, IntegrationError>>>>,
}

impl<T, F> ActionJob<T, F> {
    pub(crate) fn new(action: F, reply: oneshot::Sender<Result<T, IntegrationError>>) -> Self {
        Self {
            action,
            reply: Mutex::new(Some(reply)),
        }
    }

    fn resolve(&self, result: Result<T, IntegrationError>) {
        let sender = match self.reply.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            // The caller may have stopped waiting.
            let _ = sender.send(result);
        }
    }
}

impl<T, F, Fut> Job for ActionJob<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, IntegrationError>> + Send + 'static,
{
    fn attempt(&self) -> BoxFuture<'_, Result<(), IntegrationError>> {
        let pending = (self.action)();
        Box::pin(async move {
            let value = pending.await?;
            self.resolve(Ok(value));
            Ok(())
        })
    }

    fn fail(&self, err: IntegrationError) {
        self.resolve(Err(err));
    }
}

pub(crate) struct QueuedCall {
    pub id: Uuid,
    /// Enqueue order; retries keep their original value.
    pub seq: u64,
    pub priority: i32,
    pub tenant_id: Option<Uuid>,
    pub enqueued_at: Instant,
    pub attempts: u32,
    pub job: Box<dyn Job>,
}

impl QueuedCall {
    pub(crate) fn new(seq: u64, priority: i32, tenant_id: Option<Uuid>, job: Box<dyn Job>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            priority,
            tenant_id,
            enqueued_at: Instant::now(),
            attempts: 0,
            job,
        }
    }
}

impl PartialEq for QueuedCall {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedCall {}

impl PartialOrd for QueuedCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCall {
    /// Max-heap order: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct CallQueue {
    heap: BinaryHeap<QueuedCall>,
    pub paused: bool,
    /// Set once the worker has drained the queue on shutdown.
    pub closed: bool,
}

impl CallQueue {
    /// Returns the call back when the queue is closed.
    pub(crate) fn push(&mut self, call: QueuedCall) -> Result<(), QueuedCall> {
        if self.closed {
            return Err(call);
        }
        self.heap.push(call);
        Ok(())
    }

    pub(crate) fn peek(&self) -> Option<&QueuedCall> {
        self.heap.peek()
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedCall> {
        self.heap.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn close(&mut self) -> Vec<QueuedCall> {
        self.closed = true;
        self.heap.drain().collect()
    }
}
