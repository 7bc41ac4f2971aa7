//! Per-task fan-out of events to subscribers.

use futures::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::event::TaskEvent;
use crate::task::TaskId;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivers each task's events, in order, to every current subscriber.
///
/// Publishing never blocks the control loop. A subscriber that falls more
/// than `capacity` events behind loses the oldest ones and should fall back
/// to reading the task record.
pub struct Broadcaster {
    channels: Mutex<HashMap<TaskId, broadcast::Sender<TaskEvent>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the events of `task_id` published from now on.
    pub fn subscribe(&self, task_id: TaskId) -> EventStream {
        let mut channels = lock(&self.channels);
        let sender = channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        EventStream {
            task_id,
            rx: sender.subscribe(),
            finished: false,
        }
    }

    /// Send `event` to the current subscribers of `task_id`.
    pub fn publish(&self, task_id: TaskId, event: TaskEvent) {
        let channels = lock(&self.channels);
        match channels.get(&task_id) {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!(task_id = %task_id, "No subscribers for task event");
                }
            }
            None => debug!(task_id = %task_id, "No channel for task event"),
        }
    }

    /// Drop the channel of `task_id`; subscribers see the end of the stream
    /// once they have read what was already published.
    pub fn close(&self, task_id: TaskId) {
        lock(&self.channels).remove(&task_id);
    }

    pub(crate) fn sink(self: &Arc<Self>, task_id: TaskId) -> EventSink {
        EventSink {
            broadcaster: self.clone(),
            task_id,
        }
    }
}

/// The publishing end handed to a task's control loop.
#[derive(Clone)]
pub struct EventSink {
    broadcaster: Arc<Broadcaster>,
    task_id: TaskId,
}

impl EventSink {
    pub fn emit(&self, event: TaskEvent) {
        debug!(task_id = %self.task_id, event = event.kind(), "Emitting task event");
        self.broadcaster.publish(self.task_id, event);
    }
}

/// Ordered events of one task, ending after the first closing event.
pub struct EventStream {
    task_id: TaskId,
    rx: broadcast::Receiver<TaskEvent>,
    finished: bool,
}

impl EventStream {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Next event, or `None` once a closing event has been delivered or the
    /// run has ended.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    self.finished = event.is_closing();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(task_id = %self.task_id, skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Read events up to and including the closing one.
    pub async fn collect(mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }
}
