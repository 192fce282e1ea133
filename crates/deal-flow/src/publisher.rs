//! Event publisher: turns bridge traffic and lifecycle transitions into the
//! ordered event sequence subscribers observe.

use crate::bridge::{BridgeItem, BridgeReceiver, Received};
use crate::state::{Applied, CancelFlag};
use chrono::Utc;
use deal_protocol::{EventEnvelope, StageName, WorkflowEvent, WorkflowId};
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug)]
struct StageRun {
    stage: StageName,
    open: bool,
}

#[derive(Debug, Default)]
struct HubInner {
    seq: u64,
    run: Option<StageRun>,
    closed: bool,
    replay: Vec<EventEnvelope>,
}

/// Per-workflow event fan-out.
///
/// Every publish happens under one lock, so sequence numbers, the replay
/// backlog and the broadcast order always agree.
#[derive(Debug)]
pub struct EventHub {
    workflow_id: WorkflowId,
    inner: Mutex<HubInner>,
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventHub {
    /// Create a hub buffering up to `capacity` events per subscriber
    pub fn new(workflow_id: WorkflowId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            workflow_id,
            inner: Mutex::new(HubInner::default()),
            sender,
        }
    }

    /// Open a new stage run and publish its `status` event.
    ///
    /// Returns false when the workflow already ended.
    pub fn begin_stage(&self, stage: StageName, attempt: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.run = Some(StageRun { stage, open: true });
        inner.replay.clear();
        let message = if attempt > 1 {
            format!("Refining {} (attempt {})", stage.title(), attempt)
        } else {
            format!("Starting {}", stage.title())
        };
        self.publish(
            &mut inner,
            WorkflowEvent::Status {
                stage,
                attempt,
                message,
            },
        );
        true
    }

    /// Publish a fragment of the open run
    pub fn chunk(&self, stage: StageName, content: String) -> bool {
        let mut inner = self.inner.lock();
        if !Self::run_open(&inner, stage) {
            return false;
        }
        self.publish(&mut inner, WorkflowEvent::Chunk { stage, content });
        true
    }

    /// Publish a progress milestone of the open run
    pub fn progress(&self, stage: StageName, percent: u8, message: String) -> bool {
        let mut inner = self.inner.lock();
        if !Self::run_open(&inner, stage) {
            return false;
        }
        self.publish(
            &mut inner,
            WorkflowEvent::Progress {
                stage,
                percent,
                message,
            },
        );
        true
    }

    /// Close the open run with `step_complete` or `error`.
    pub fn finish_stage(&self, event: WorkflowEvent) -> bool {
        let mut inner = self.inner.lock();
        let Some(stage) = event.stage() else {
            return false;
        };
        if !event.ends_stage() || event.ends_workflow() || !Self::run_open(&inner, stage) {
            return false;
        }
        if let Some(run) = inner.run.as_mut() {
            run.open = false;
        }
        // Chunks of a closed run are never replayed.
        inner.replay.truncate(1);
        self.publish(&mut inner, event);
        true
    }

    /// Publish `cancelled` or `completed`; nothing is published afterwards.
    pub fn close(&self, event: WorkflowEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || !event.ends_workflow() {
            return false;
        }
        inner.closed = true;
        let was_open = inner
            .run
            .as_mut()
            .is_some_and(|run| std::mem::replace(&mut run.open, false));
        if was_open {
            inner.replay.truncate(1);
        }
        self.publish(&mut inner, event);
        true
    }

    /// Subscribe, receiving the replay backlog first.
    pub fn subscribe(&self) -> EventSubscription {
        let inner = self.inner.lock();
        EventSubscription {
            backlog: inner.replay.iter().cloned().collect(),
            rx: self.sender.subscribe(),
            last_seq: 0,
            done: false,
        }
    }

    fn run_open(inner: &HubInner, stage: StageName) -> bool {
        !inner.closed
            && inner
                .run
                .as_ref()
                .is_some_and(|run| run.open && run.stage == stage)
    }

    fn publish(&self, inner: &mut HubInner, event: WorkflowEvent) {
        inner.seq += 1;
        let envelope = EventEnvelope {
            workflow_id: self.workflow_id,
            seq: inner.seq,
            timestamp: Utc::now(),
            event,
        };
        inner.replay.push(envelope.clone());
        // No receivers is fine; the replay covers late subscribers.
        let _ = self.sender.send(envelope);
    }
}

/// A live view of one workflow's events
#[derive(Debug)]
pub struct EventSubscription {
    backlog: VecDeque<EventEnvelope>,
    rx: broadcast::Receiver<EventEnvelope>,
    last_seq: u64,
    done: bool,
}

impl EventSubscription {
    /// Next event, or `None` once the workflow ended
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if self.done {
            return None;
        }
        let envelope = match self.backlog.pop_front() {
            Some(envelope) => envelope,
            None => loop {
                match self.rx.recv().await {
                    Ok(envelope) if envelope.seq <= self.last_seq => continue,
                    Ok(envelope) => break envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        };
        self.last_seq = envelope.seq;
        if envelope.event.ends_workflow() {
            self.done = true;
        }
        Some(envelope)
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = EventEnvelope> + Send {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|envelope| (envelope, sub))
        })
    }
}

/// Drain one stage run's bridge into the hub.
///
/// Stops at the sentinel, or as soon as the workflow is cancelled.
pub(crate) async fn consume(
    hub: Arc<EventHub>,
    stage: StageName,
    mut receiver: BridgeReceiver,
    cancel: CancelFlag,
    poll_interval: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(stage = %stage, "Publisher stopping after cancel");
            return;
        }
        match receiver.poll(poll_interval).await {
            Received::Item(BridgeItem::Fragment(content)) => {
                hub.chunk(stage, content);
            }
            Received::Item(BridgeItem::Progress { percent, message }) => {
                hub.progress(stage, percent, message);
            }
            Received::Item(BridgeItem::Done(outcome)) => {
                match outcome {
                    Applied::Completed => {
                        hub.finish_stage(WorkflowEvent::StepComplete { stage });
                    }
                    Applied::Failed(message) => {
                        hub.finish_stage(WorkflowEvent::Error { stage, message });
                    }
                    Applied::Discarded => {
                        debug!(stage = %stage, "Stage result discarded");
                    }
                }
                return;
            }
            Received::Idle => {}
            Received::Disconnected => {
                warn!(stage = %stage, "Stage worker went away without a result");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deal_core::StageEmitter;
    use pretty_assertions::assert_eq;

    fn names(events: &[EventEnvelope]) -> Vec<&'static str> {
        events.iter().map(|e| e.event.name()).collect()
    }

    async fn drain(sub: &mut EventSubscription) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Ok(Some(e)) =
            tokio::time::timeout(Duration::from_millis(50), sub.next()).await
        {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_no_chunk_outside_open_run() {
        let hub = EventHub::new(WorkflowId::new(), 16);
        assert!(!hub.chunk(StageName::Research, "early".into()));
        assert!(hub.begin_stage(StageName::Research, 1));
        assert!(!hub.chunk(StageName::Memo, "wrong stage".into()));
        assert!(hub.chunk(StageName::Research, "a".into()));
        assert!(hub.finish_stage(WorkflowEvent::StepComplete {
            stage: StageName::Research
        }));
        assert!(!hub.chunk(StageName::Research, "late".into()));
        assert!(!hub.finish_stage(WorkflowEvent::StepComplete {
            stage: StageName::Research
        }));
    }

    #[tokio::test]
    async fn test_replay_of_open_run_includes_chunks() {
        let hub = EventHub::new(WorkflowId::new(), 16);
        hub.begin_stage(StageName::Research, 1);
        hub.chunk(StageName::Research, "a".into());
        hub.progress(StageName::Research, 40, "competitors".into());

        let mut sub = hub.subscribe();
        hub.chunk(StageName::Research, "b".into());
        let events = drain(&mut sub).await;
        assert_eq!(names(&events), vec!["status", "chunk", "progress", "chunk"]);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_replay_of_closed_run_drops_stale_chunks() {
        let hub = EventHub::new(WorkflowId::new(), 16);
        hub.begin_stage(StageName::RiskScan, 1);
        hub.chunk(StageName::RiskScan, "a".into());
        hub.finish_stage(WorkflowEvent::Error {
            stage: StageName::RiskScan,
            message: "boom".into(),
        });

        let mut sub = hub.subscribe();
        let events = drain(&mut sub).await;
        assert_eq!(names(&events), vec!["status", "error"]);
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let hub = EventHub::new(WorkflowId::new(), 16);
        let mut sub = hub.subscribe();
        hub.begin_stage(StageName::Memo, 1);
        hub.chunk(StageName::Memo, "draft".into());
        assert!(hub.close(WorkflowEvent::Cancelled {
            stage: Some(StageName::Memo)
        }));
        assert!(!hub.chunk(StageName::Memo, "after".into()));
        assert!(!hub.begin_stage(StageName::Memo, 2));
        assert!(!hub.close(WorkflowEvent::Completed));

        let events = drain(&mut sub).await;
        assert_eq!(names(&events), vec!["status", "chunk", "cancelled"]);
        assert!(sub.next().await.is_none());

        let mut late = hub.subscribe();
        assert_eq!(names(&drain(&mut late).await), vec!["status", "cancelled"]);
    }

    #[tokio::test]
    async fn test_consume_stops_at_sentinel() {
        let hub = Arc::new(EventHub::new(WorkflowId::new(), 16));
        let mut sub = hub.subscribe();
        hub.begin_stage(StageName::Research, 1);

        let flag = CancelFlag::default();
        let (tx, rx) = crate::bridge::channel(flag.clone());
        tx.emit("one".into());
        tx.emit("two".into());
        tx.finish(Applied::Completed);
        tx.emit("ignored".into());

        consume(
            hub.clone(),
            StageName::Research,
            rx,
            flag,
            Duration::from_millis(20),
        )
        .await;

        let events = drain(&mut sub).await;
        assert_eq!(
            names(&events),
            vec!["status", "chunk", "chunk", "step_complete"]
        );
    }
}
