//! Bounded hand-off between sessions and the durable queue
//!
//! Sessions submit an [`Envelope`] and wait for the outcome; a fixed number of
//! workers validate and persist submissions. When every worker is busy and the
//! channel is full, `submit` waits.

use super::envelope::Envelope;
use super::store::DurableQueue;
use crate::error::{RelayError, Result};
use crate::utils::extract_address;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

struct EnqueueJob {
    envelope: Envelope,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable sender side, held by every session
#[derive(Clone)]
pub struct EnqueueHandle {
    tx: mpsc::Sender<EnqueueJob>,
}

pub struct EnqueuePool;

impl EnqueuePool {
    /// Spawn `workers` tasks sharing a channel of `capacity` pending jobs
    ///
    /// Workers exit once every [`EnqueueHandle`] has been dropped.
    pub fn start(queue: Arc<dyn DurableQueue>, workers: usize, capacity: usize) -> EnqueueHandle {
        let (tx, rx) = mpsc::channel::<EnqueueJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                debug!("Enqueue worker {} started", worker_id);
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };

                    let result = persist(queue.as_ref(), &job.envelope).await;
                    if let Err(ref e) = result {
                        warn!("Enqueue worker {}: envelope rejected: {}", worker_id, e);
                    }
                    // The session may have gone away in the meantime
                    let _ = job.reply.send(result);
                }
                debug!("Enqueue worker {} stopped", worker_id);
            });
        }

        info!("Enqueue pool started: {} workers, capacity {}", workers, capacity);
        EnqueueHandle { tx }
    }
}

async fn persist(queue: &dyn DurableQueue, envelope: &Envelope) -> Result<()> {
    extract_address(&envelope.from)?;
    extract_address(&envelope.to)?;

    let payload = envelope.to_json()?;
    queue.push_back(payload).await.map_err(|e| {
        error!("Failed to persist envelope: {}", e);
        RelayError::QueuePersistence(e.to_string())
    })
}

impl EnqueueHandle {
    /// Hand an envelope to the pool and wait until it is persisted or rejected
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        let (reply, outcome) = oneshot::channel();

        self.tx
            .send(EnqueueJob { envelope, reply })
            .await
            .map_err(|_| RelayError::QueuePersistence("enqueue pool is closed".to_string()))?;

        outcome.await.map_err(|_| {
            RelayError::QueuePersistence("enqueue worker dropped the job".to_string())
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::{MemoryQueue, QueuedRecord};

    fn envelope(from: &str, to: &str) -> Envelope {
        Envelope {
            from: from.to_string(),
            to: to.to_string(),
            data: "Subject: test\r\n\r\nbody\r\n".to_string(),
            subject: "test".to_string(),
            username: String::new(),
            authenticated: false,
        }
    }

    struct BrokenQueue;

    #[async_trait::async_trait]
    impl DurableQueue for BrokenQueue {
        async fn push_back(&self, _payload: String) -> Result<()> {
            Err(RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
        async fn peek_front(&self) -> Result<Option<QueuedRecord>> {
            Ok(None)
        }
        async fn remove(&self, _id: i64) -> Result<()> {
            Ok(())
        }
        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_submit_persists_envelope() {
        let queue = Arc::new(MemoryQueue::new());
        let handle = EnqueuePool::start(queue.clone(), 3, 5);

        handle
            .submit(envelope("<alice@example.com>", "<bob@example.org>"))
            .await
            .unwrap();

        let stored = queue.snapshot().await;
        assert_eq!(stored.len(), 1);
        let restored = Envelope::from_json(&stored[0]).unwrap();
        assert_eq!(restored.from, "<alice@example.com>");
        assert_eq!(restored.to, "<bob@example.org>");
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_persisted() {
        let queue = Arc::new(MemoryQueue::new());
        let handle = EnqueuePool::start(queue.clone(), 1, 1);

        let result = handle.submit(envelope("user@@bad host", "<bob@example.org>")).await;
        assert!(matches!(result, Err(RelayError::InvalidAddress(_))));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_worker_alive() {
        let handle = EnqueuePool::start(Arc::new(BrokenQueue), 1, 1);

        for _ in 0..3 {
            let result = handle.submit(envelope("a@example.com", "b@example.com")).await;
            assert!(matches!(result, Err(RelayError::QueuePersistence(_))));
        }
    }

    #[tokio::test]
    async fn test_concurrent_submissions() {
        let queue = Arc::new(MemoryQueue::new());
        let handle = EnqueuePool::start(queue.clone(), 3, 2);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .submit(envelope("a@example.com", &format!("user{}@example.org", i)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(queue.len().await.unwrap(), 10);
    }
}
