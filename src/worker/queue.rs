//! The task queue.
//!
//! Unbounded so producers never wait on device I/O. Exactly one
//! [`TaskReceiver`] exists and it is owned by the command worker.

use super::task::Task;
use crate::error::{AppResult, HvError};
use tokio::sync::mpsc;

/// Create a connected sender/receiver pair.
///
/// ```
/// # tokio_test::block_on(async {
/// use hv_bias::worker::{task_queue, Task};
///
/// let (tx, mut rx) = task_queue();
/// tx.enqueue(Task::monitor(1)).unwrap();
/// assert_eq!(rx.recv().await.map(|t| t.port_id), Some(1));
/// # });
/// ```
pub fn task_queue() -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskSender { tx }, TaskReceiver { rx })
}

/// Producer side; cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskSender {
    /// Append a task to the queue.
    ///
    /// # Errors
    /// [`HvError::QueueClosed`] once the worker has stopped.
    pub fn enqueue(&self, task: Task) -> AppResult<()> {
        self.tx.send(task).map_err(|_| HvError::QueueClosed)
    }

    /// Returns `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TaskReceiver {
    /// Next task in FIFO order, or `None` when every sender is gone.
    pub async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Next task if one is already queued.
    pub fn try_recv(&mut self) -> Option<Task> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::CommandKind;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let (tx, mut rx) = task_queue();
        let other = tx.clone();
        tx.enqueue(Task::monitor(1)).unwrap();
        other.enqueue(Task::new(2, CommandKind::TurnOn)).unwrap();
        tx.enqueue(Task::monitor(3)).unwrap();

        let ports: Vec<_> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|t| t.unwrap().port_id)
            .collect();
        assert_eq!(ports, vec![1, 2, 3]);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn enqueue_fails_after_receiver_dropped() {
        let (tx, rx) = task_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.enqueue(Task::monitor(1)), Err(HvError::QueueClosed)));
    }
}
