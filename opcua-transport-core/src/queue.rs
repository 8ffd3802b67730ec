//! A single-consumer task that serializes every encode (and every decode) onto one secure
//! channel, so chunk sequence numbers stay strictly ordered even when many callers submit
//! concurrently. Grounded on `opcua_client::transport::channel::AsyncSecureChannel`, which
//! drives its socket writes through one task behind an `mpsc` channel rather than taking a
//! lock per send.

use tokio::sync::{mpsc, oneshot};

use opcua_transport_types::{Error, StatusCode};

/// One unit of work submitted to the serialization queue: bytes to write, plus a promise
/// resolved once the write (not the eventual response) completes or fails.
struct Job {
    payload: Vec<u8>,
    done: oneshot::Sender<Result<(), Error>>,
}

/// Handle callers use to submit work; cheap to clone, so every request path can hold one.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<Job>,
}

/// Error returned once the queue has been paused and no longer accepts new submissions.
#[derive(Debug)]
pub struct QueueClosed;

impl QueueHandle {
    /// Submit `payload` for writing and await the write's own completion (not the
    /// application-level response, which arrives separately through the correlator).
    pub async fn submit(&self, payload: Vec<u8>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Job { payload, done: tx })
            .await
            .map_err(|_| Error::new(StatusCode::BadConnectionClosed, "the serialization queue has been paused"))?;
        rx.await
            .map_err(|_| Error::new(StatusCode::BadConnectionClosed, "the serialization queue was dropped before confirming the write"))?
    }
}

/// The consumer side: drains jobs in submission order and hands each to `write`. Built by
/// [`channel`]; run it on its own task with [`SerializationQueue::run`].
pub struct SerializationQueue {
    receiver: mpsc::Receiver<Job>,
}

impl SerializationQueue {
    /// Drive the queue until the writer reports a fatal error or every handle is dropped.
    /// `write` is given each payload in the order it was submitted; once `write` returns
    /// `Err`, the queue drains remaining jobs with that same error rather than attempting
    /// further writes, matching a paused channel's "reject everything until reconnected"
    /// behavior.
    pub async fn run<W, Fut>(mut self, mut write: W)
    where
        W: FnMut(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        let mut poisoned: Option<StatusCode> = None;
        while let Some(job) = self.receiver.recv().await {
            let result = match poisoned {
                Some(status) => Err(Error::new(status, "the secure channel is no longer accepting writes")),
                None => write(job.payload).await,
            };
            if let Err(err) = &result {
                if poisoned.is_none() {
                    poisoned = Some(err.status());
                }
            }
            let _ = job.done.send(result);
        }
    }
}

/// Build a fresh serialization queue with the given backlog capacity.
pub fn channel(capacity: usize) -> (QueueHandle, SerializationQueue) {
    let (sender, receiver) = mpsc::channel(capacity);
    (QueueHandle { sender }, SerializationQueue { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_are_written_in_submission_order() {
        let (handle, queue) = channel(8);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let writer_order = order.clone();
        tokio::spawn(queue.run(move |payload| {
            let order = writer_order.clone();
            async move {
                order.lock().push(payload[0]);
                Ok(())
            }
        }));

        for n in 0..5u8 {
            handle.submit(vec![n]).await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn a_write_failure_poisons_the_queue_for_subsequent_submissions() {
        let (handle, queue) = channel(8);
        let attempts = Arc::new(AtomicUsize::new(0));
        let writer_attempts = attempts.clone();
        tokio::spawn(queue.run(move |payload| {
            let attempts = writer_attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if payload[0] == 0 {
                    Err(Error::new(StatusCode::BadConnectionClosed, "socket reset"))
                } else {
                    Ok(())
                }
            }
        }));

        assert!(handle.submit(vec![0]).await.is_err());
        assert!(handle.submit(vec![1]).await.is_err());
        // the second job never reaches the writer once poisoned.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_every_handle_lets_the_consumer_task_exit() {
        let (handle, queue) = channel(1);
        let task = tokio::spawn(queue.run(|_| async { Ok(()) }));
        drop(handle);
        task.await.unwrap();
    }
}
