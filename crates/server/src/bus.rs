//! Process-wide scan event bus.
//!
//! Topics are keyed by task id. Fan-out rides a single broadcast channel
//! whose capacity bounds every subscriber's backlog: a slow consumer loses
//! the oldest events and observes the loss through its `dropped_count`,
//! never by blocking a publisher. A bounded history is replayed to new
//! stream subscribers, seeded under the same lock as registration so the
//! replay/live boundary has no duplicates and no holes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use eidolon_core::event::{FrameStatus, ScanEvent, TaskEvent};

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Replayed-history bound.
const HISTORY_CAPACITY: usize = 256;

/// Collector name stamped on every frame this bus publishes.
pub const COLLECTOR: &str = "network";

#[derive(Debug)]
struct TopicState {
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct BusState {
    tx: Option<broadcast::Sender<TaskEvent>>,
    topics: HashMap<Uuid, TopicState>,
    history: VecDeque<TaskEvent>,
}

/// Publish/subscribe broker for scan task events.
#[derive(Debug, Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(BusState {
                tx: Some(tx),
                topics: HashMap::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            })),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().expect("event bus mutex poisoned")
    }

    /// Register a topic so publishes on it are accepted.
    pub fn open_topic(&self, task_id: Uuid) {
        self.lock().topics.entry(task_id).or_insert(TopicState {
            next_seq: 1,
            closed: false,
        });
    }

    /// Publish an event on its task's topic.
    ///
    /// Non-blocking. The bus assigns the task's next sequence number and
    /// returns it, or `None` when the topic is closed, unknown, or the bus
    /// has shut down; a terminal frame closes its topic so nothing can be
    /// published after it.
    pub fn publish(
        &self,
        task_id: Uuid,
        status: FrameStatus,
        event: ScanEvent,
        events_processed: u64,
        total_events: Option<u64>,
    ) -> Option<u64> {
        let mut state = self.lock();
        let tx = state.tx.as_ref()?.clone();

        let topic = state.topics.get_mut(&task_id)?;
        if topic.closed {
            return None;
        }
        let seq = topic.next_seq;
        topic.next_seq += 1;
        if status != FrameStatus::Progress {
            topic.closed = true;
        }

        let frame = TaskEvent {
            task_id,
            seq,
            status,
            collector: COLLECTOR.to_string(),
            events_processed,
            total_events,
            event,
            timestamp: Utc::now(),
        };

        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(frame.clone());

        // Receivers past capacity lag and account the loss themselves
        let _ = tx.send(frame);
        Some(seq)
    }

    /// Mark a topic complete without publishing; used on shutdown paths
    /// where the terminal frame was already emitted.
    pub fn close_topic(&self, task_id: Uuid) {
        if let Some(topic) = self.lock().topics.get_mut(&task_id) {
            topic.closed = true;
        }
    }

    pub fn is_closed(&self, task_id: Uuid) -> bool {
        self.lock()
            .topics
            .get(&task_id)
            .map(|t| t.closed)
            .unwrap_or(false)
    }

    /// Subscribe to a single task's topic.
    pub fn subscribe(&self, task_id: Uuid) -> Subscription {
        self.subscribe_inner(Some(task_id))
    }

    /// Subscribe to every topic, past and future.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe_inner(None)
    }

    fn subscribe_inner(&self, filter: Option<Uuid>) -> Subscription {
        let state = self.lock();
        let replay: VecDeque<TaskEvent> = state
            .history
            .iter()
            .filter(|frame| filter.map(|id| frame.task_id == id).unwrap_or(true))
            .cloned()
            .collect();
        let rx = state.tx.as_ref().map(|tx| tx.subscribe());
        debug!(?filter, replay = replay.len(), "subscription created");
        Subscription {
            filter,
            replay,
            rx,
            dropped: 0,
            done: false,
        }
    }

    /// Shut the bus down: all subscriptions drain their backlog and then
    /// terminate.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.tx = None;
        for topic in state.topics.values_mut() {
            topic.closed = true;
        }
    }

    /// Queue capacity subscribers are bounded to.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One subscriber's queued view onto the bus.
///
/// Dropping the subscription unsubscribes it; doing so twice is trivially
/// idempotent. Events arrive in publish order per task; sequence numbers
/// are strictly increasing with gaps only where events were dropped.
#[derive(Debug)]
pub struct Subscription {
    filter: Option<Uuid>,
    replay: VecDeque<TaskEvent>,
    rx: Option<broadcast::Receiver<TaskEvent>>,
    dropped: u64,
    done: bool,
}

impl Subscription {
    /// Next event, FIFO. Suspends until one is available; returns `None`
    /// once the subscription is terminal: after the task's terminal frame
    /// for task-scoped subscriptions, or after bus shutdown drains.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.done {
            return None;
        }

        if let Some(frame) = self.replay.pop_front() {
            self.note_terminal(&frame);
            return Some(frame);
        }

        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => {
                self.done = true;
                return None;
            }
        };

        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if let Some(id) = self.filter {
                        if frame.task_id != id {
                            continue;
                        }
                    }
                    self.note_terminal(&frame);
                    return Some(frame);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    fn note_terminal(&mut self, frame: &TaskEvent) {
        if self.filter == Some(frame.task_id) && frame.status != FrameStatus::Progress {
            self.done = true;
        }
    }

    /// Events lost to this subscriber's queue bound.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(done: u64) -> ScanEvent {
        ScanEvent::ProgressTick { done, total: 100 }
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order_with_increasing_seq() {
        let bus = EventBus::new(64);
        let task = Uuid::new_v4();
        bus.open_topic(task);
        let mut sub = bus.subscribe(task);

        for i in 0..5 {
            bus.publish(task, FrameStatus::Progress, tick(i), i, None);
        }

        let mut last_seq = 0;
        for i in 0..5 {
            let frame = sub.next().await.unwrap();
            assert_eq!(frame.event, tick(i));
            assert!(frame.seq > last_seq);
            last_seq = frame.seq;
        }
    }

    #[tokio::test]
    async fn test_terminal_frame_closes_the_topic() {
        let bus = EventBus::new(64);
        let task = Uuid::new_v4();
        bus.open_topic(task);
        let mut sub = bus.subscribe(task);

        bus.publish(task, FrameStatus::Progress, tick(1), 1, None);
        let seq = bus.publish(
            task,
            FrameStatus::Complete,
            ScanEvent::LogLine {
                line: "done".into(),
            },
            1,
            Some(1),
        );
        assert!(seq.is_some());

        // Nothing can follow the terminal frame
        assert_eq!(
            bus.publish(task, FrameStatus::Progress, tick(2), 2, None),
            None
        );

        assert_eq!(sub.next().await.unwrap().status, FrameStatus::Progress);
        assert_eq!(sub.next().await.unwrap().status, FrameStatus::Complete);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_counts_gaps() {
        let capacity = 32;
        let published = 100u64;
        let bus = EventBus::new(capacity);
        let task = Uuid::new_v4();
        bus.open_topic(task);
        let mut sub = bus.subscribe(task);

        for i in 0..published {
            bus.publish(task, FrameStatus::Progress, tick(i), i, None);
        }
        bus.shutdown();

        let mut delivered = 0u64;
        let mut gaps = 0u64;
        let mut last_seq: Option<u64> = None;
        while let Some(frame) = sub.next().await {
            delivered += 1;
            if let Some(last) = last_seq {
                assert!(frame.seq > last);
                gaps += frame.seq - last - 1;
            } else {
                gaps += frame.seq - 1;
            }
            last_seq = Some(frame.seq);
        }

        assert!(delivered <= capacity as u64);
        assert_eq!(sub.dropped_count(), published - delivered);
        assert_eq!(gaps, sub.dropped_count());
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_history() {
        let bus = EventBus::new(64);
        let task = Uuid::new_v4();
        bus.open_topic(task);

        bus.publish(task, FrameStatus::Progress, tick(1), 1, None);
        bus.publish(task, FrameStatus::Progress, tick(2), 2, None);

        let mut sub = bus.subscribe(task);
        assert_eq!(sub.next().await.unwrap().event, tick(1));
        assert_eq!(sub.next().await.unwrap().event, tick(2));

        // Live events continue seamlessly after the replay
        bus.publish(task, FrameStatus::Progress, tick(3), 3, None);
        assert_eq!(sub.next().await.unwrap().event, tick(3));
    }

    #[tokio::test]
    async fn test_subscribe_all_interleaves_topics_without_cross_task_order() {
        let bus = EventBus::new(64);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        bus.open_topic(a);
        bus.open_topic(b);
        let mut sub = bus.subscribe_all();

        bus.publish(a, FrameStatus::Progress, tick(1), 1, None);
        bus.publish(b, FrameStatus::Progress, tick(1), 1, None);
        bus.publish(a, FrameStatus::Progress, tick(2), 2, None);
        bus.shutdown();

        let mut per_task: HashMap<Uuid, Vec<u64>> = HashMap::new();
        while let Some(frame) = sub.next().await {
            per_task.entry(frame.task_id).or_default().push(frame.seq);
        }
        assert_eq!(per_task[&a], vec![1, 2]);
        assert_eq!(per_task[&b], vec![1]);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic_is_rejected() {
        let bus = EventBus::new(64);
        assert_eq!(
            bus.publish(Uuid::new_v4(), FrameStatus::Progress, tick(1), 1, None),
            None
        );
    }
}
