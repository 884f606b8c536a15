//! The inbound dispatch pipeline.
//!
//! Stage A runs on the WebSocket receive task: parse the envelope, build a
//! task record, and `try_send` it onto the bounded dispatch queue, never
//! blocking and dropping with a metric when the queue is full. Stage B is the
//! single dispatcher task that owns the blocking side: ping short-circuit,
//! scheduler submission with bounded retries, then the persistence side
//! effect. Stage C is the worker pool in `acp-scheduler`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use acp_core::blocks::{Block, decode_envelope};
use acp_core::config::DispatchConfig;
use acp_core::errors::AcpError;
use acp_metrics::MetricsCollector;
use acp_scheduler::{HandlerTask, MessageScheduler};
use acp_session::SessionManager;
use acp_store::Store;
use acp_wire::commands::SessionMessage;

use crate::handlers::{HandlerRegistry, InboundMessage, Selection};

/// Submission retries performed by the dispatcher.
const DISPATCH_SUBMIT_RETRIES: u32 = 3;

/// Shared state of the dispatch pipeline.
pub(crate) struct Pipeline {
    pub(crate) agent_id: String,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) store: Arc<Store>,
    pub(crate) scheduler: Mutex<Arc<MessageScheduler>>,
    pub(crate) manager: Mutex<Option<Arc<SessionManager>>>,
    pub(crate) dispatch_tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    pub(crate) config: DispatchConfig,
}

impl Pipeline {
    /// Current dispatch queue depth (capacity minus free slots).
    pub(crate) fn queue_depth(&self) -> usize {
        self.dispatch_tx
            .lock()
            .as_ref()
            .map(|tx| self.config.dispatch_queue_size.saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    /// Stage A: parse and enqueue one inbound `session_message`.
    ///
    /// Runs synchronously on the transport receive task; the only failure
    /// modes are drop-with-metric.
    pub(crate) fn enqueue(self: &Arc<Self>, raw: SessionMessage) {
        self.metrics.record_received();

        let blocks = match decode_envelope(&raw.message) {
            Ok(blocks) => blocks,
            Err(e) => {
                error!(
                    agent_id = %self.agent_id,
                    message_id = %raw.message_id,
                    error = %e,
                    "inbound envelope undecodable, dropped"
                );
                self.metrics.record_dispatch_failure();
                return;
            }
        };
        let instruction = raw
            .instruction
            .clone()
            .and_then(|value| serde_json::from_value(value).ok());
        let is_stream_message = blocks.first().is_some_and(Block::is_stream_pointer);
        let record = InboundMessage {
            raw,
            blocks: Arc::new(blocks),
            instruction,
            is_stream_message,
        };

        let tx = self.dispatch_tx.lock().clone();
        let Some(tx) = tx else {
            self.metrics.record_dispatch_failure();
            warn!(agent_id = %self.agent_id, "dispatcher not running, message dropped");
            return;
        };
        if let Err(e) = tx.try_send(record) {
            // Queue full (or dispatcher stopping): drop, count, no retry.
            self.metrics.record_dispatch_failure();
            error!(
                agent_id = %self.agent_id,
                capacity = self.config.dispatch_queue_size,
                error = %e,
                "dispatch queue full, message dropped"
            );
        }
    }

    /// Start the dispatcher task, replacing the dispatch queue.
    pub(crate) fn start_dispatcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(self.config.dispatch_queue_size);
        *self.dispatch_tx.lock() = Some(tx);
        info!(agent_id = %self.agent_id, "message dispatcher started");
        tokio::spawn(dispatcher_main(self.clone(), rx, cancel))
    }

    /// Drop the queue reference and any messages still inside it.
    pub(crate) fn drain_queue(&self) {
        *self.dispatch_tx.lock() = None;
    }
}

async fn dispatcher_main(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            record = rx.recv() => record,
            () = cancel.cancelled() => break,
        };
        let Some(record) = record else { break };

        // Liveness probes are answered here; user handlers never see them.
        if record.blocks.first().is_some_and(Block::is_ping) {
            reply_ping(&pipeline, &record).await;
            continue;
        }

        let dispatch_start = Instant::now();
        let scheduler = pipeline.scheduler.lock().clone();
        let mut submitted = false;
        for attempt in 0..DISPATCH_SUBMIT_RETRIES {
            let task = invocation_task(&pipeline, record.clone());
            match scheduler.submit(task).await {
                Ok(()) => {
                    submitted = true;
                    break;
                }
                Err(e) => {
                    if attempt + 1 < DISPATCH_SUBMIT_RETRIES {
                        let wait = acp_core::retry::backoff_delay(
                            attempt,
                            Duration::from_millis(50),
                            2.0,
                            Duration::from_millis(200),
                        );
                        warn!(attempt = attempt + 1, error = %e, ?wait, "scheduler submit retrying");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        if submitted {
            let latency_ms = dispatch_start.elapsed().as_secs_f64() * 1000.0;
            pipeline.metrics.record_dispatch_success(latency_ms);
        } else {
            pipeline.metrics.record_dispatch_failure();
            error!(
                agent_id = %pipeline.agent_id,
                message_id = %record.raw.message_id,
                session_id = %record.raw.session_id,
                "message submission failed after retries, dropped"
            );
            continue;
        }

        // Persistence runs after successful hand-off; its failures are
        // logged and never affect dispatch accounting.
        if !record.is_stream_message {
            if let Err(e) = persist(&pipeline, &record) {
                warn!(
                    agent_id = %pipeline.agent_id,
                    message_id = %record.raw.message_id,
                    error = %e,
                    "message persistence failed after dispatch"
                );
            }
        }
    }
    info!(agent_id = %pipeline.agent_id, "message dispatcher stopped");
}

fn invocation_task(pipeline: &Arc<Pipeline>, record: InboundMessage) -> HandlerTask {
    let registry = pipeline.registry.clone();
    let metrics = pipeline.metrics.clone();
    let handler_timeout = pipeline.config.handler_timeout();
    Box::pin(async move {
        let started = Instant::now();
        let selection = registry.select(
            &record.raw.session_id,
            record.instruction.as_ref().map(|i| i.cmd.as_str()),
        );
        let outcome =
            tokio::time::timeout(handler_timeout, run_selection(selection, record)).await;
        let success = matches!(outcome, Ok(Ok(())));
        if success {
            metrics.record_handler_success(started.elapsed().as_secs_f64() * 1000.0);
        } else {
            metrics.record_handler_failure();
        }
        success
    })
}

async fn run_selection(selection: Selection, record: InboundMessage) -> Result<(), AcpError> {
    match selection {
        Selection::Session(handler) | Selection::Command(handler) => handler(record).await,
        Selection::Global(handlers) => {
            let invocations = handlers
                .iter()
                .map(|handler| handler(record.clone()))
                .collect::<Vec<_>>();
            let results = futures::future::join_all(invocations).await;
            let mut first_error = None;
            for result in results {
                if let Err(e) = result {
                    warn!(error = %e, "global handler failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}

fn persist(pipeline: &Arc<Pipeline>, record: &InboundMessage) -> Result<(), AcpError> {
    let raw = &record.raw;
    let instruction_json = record
        .instruction
        .as_ref()
        .and_then(|i| serde_json::to_string(i).ok())
        .unwrap_or_default();

    match pipeline.store.get_message_by_id(&raw.session_id, &raw.message_id)? {
        None => {
            let content = serde_json::to_string(record.blocks.as_ref()).unwrap_or_default();
            let _ = pipeline.store.insert_message(
                "assistant",
                &raw.session_id,
                &raw.sender,
                &raw.ref_msg_id,
                &raw.receiver,
                &instruction_json,
                &content,
                "text",
                "success",
                &raw.message_id,
            )?;
        }
        Some(existing) => {
            // Append the new blocks to the stored content array.
            let mut stored: Vec<serde_json::Value> =
                serde_json::from_str(&existing.content).unwrap_or_default();
            for block in record.blocks.iter() {
                stored.push(serde_json::to_value(block).unwrap_or(serde_json::Value::Null));
            }
            let content = serde_json::to_string(&stored).unwrap_or_default();
            let _ = pipeline.store.update_message_content(
                &raw.session_id,
                &raw.message_id,
                &content,
                None,
            )?;
        }
    }
    Ok(())
}

async fn reply_ping(pipeline: &Arc<Pipeline>, record: &InboundMessage) {
    debug!(
        agent_id = %pipeline.agent_id,
        session_id = %record.raw.session_id,
        "answering ping"
    );
    let manager = pipeline.manager.lock().clone();
    let Some(manager) = manager else {
        warn!("ping received while offline, ignored");
        return;
    };
    let reply = [Block::content("ping_result")];
    if let Err(e) = manager
        .send_msg(
            &record.raw.session_id,
            &reply,
            &record.raw.sender,
            &record.raw.message_id,
            "",
            None,
        )
        .await
    {
        warn!(error = %e, "ping reply not delivered");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use acp_core::blocks::encode_envelope;
    use acp_core::config::SchedulerConfig;

    use super::*;
    use crate::handlers::MessageHandler;

    fn test_pipeline() -> Arc<Pipeline> {
        let scheduler = Arc::new(MessageScheduler::new(
            SchedulerConfig {
                core_workers: 2,
                worker_queue_size: 64,
                ..Default::default()
            },
            Duration::from_secs(5),
        ));
        Arc::new(Pipeline {
            agent_id: "a.corp.example".to_owned(),
            registry: Arc::new(HandlerRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            store: Arc::new(Store::in_memory("a.corp.example").unwrap()),
            scheduler: Mutex::new(scheduler),
            manager: Mutex::new(None),
            dispatch_tx: Mutex::new(None),
            config: DispatchConfig::default(),
        })
    }

    fn inbound(session_id: &str, message_id: &str, blocks: &[Block]) -> SessionMessage {
        SessionMessage {
            message_id: message_id.to_owned(),
            session_id: session_id.to_owned(),
            ref_msg_id: String::new(),
            sender: "b.corp.example".into(),
            receiver: "a.corp.example".into(),
            message: encode_envelope(blocks),
            timestamp: "1".into(),
            instruction: None,
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn message_flows_to_global_handler_and_store() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.registry.add_global(counting_handler(calls.clone()));

        pipeline.enqueue(inbound("s1", "m1", &[Block::content("hello")]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let summary = pipeline.metrics.summary();
        assert_eq!(summary.received_total, 1);
        assert_eq!(summary.dispatched_success, 1);
        assert_eq!(summary.handler_success, 1);

        // The persistence side effect recorded the inbound row.
        let row = pipeline
            .store
            .get_message_by_id("s1", "m1")
            .unwrap()
            .unwrap();
        assert_eq!(row.role, "assistant");
        assert!(row.content.contains("hello"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn session_scope_precedence_end_to_end() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let global_calls = Arc::new(AtomicUsize::new(0));
        let session_calls = Arc::new(AtomicUsize::new(0));
        pipeline.registry.add_global(counting_handler(global_calls.clone()));
        pipeline
            .registry
            .set_session_handler("sid", counting_handler(session_calls.clone()));

        // One message in the scoped session, one elsewhere.
        pipeline.enqueue(inbound("sid", "m1", &[Block::content("a")]));
        pipeline.enqueue(inbound("other", "m2", &[Block::content("b")]));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // S ran exactly once (for sid); G ran exactly once (for other).
        assert_eq!(session_calls.load(Ordering::SeqCst), 1);
        assert_eq!(global_calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn command_scope_matches_instruction() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let command_calls = Arc::new(AtomicUsize::new(0));
        pipeline
            .registry
            .set_command_handler("weather.lookup", counting_handler(command_calls.clone()));

        let mut raw = inbound("s1", "m1", &[Block::content("x")]);
        raw.instruction = Some(serde_json::json!({"cmd": "weather.lookup"}));
        pipeline.enqueue(raw);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(command_calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn failing_handler_counts_failure() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        pipeline.registry.add_global(Arc::new(|_msg| {
            Box::pin(async { Err(AcpError::internal("BOOM", "handler exploded")) })
        }));
        pipeline.enqueue(inbound("s1", "m1", &[Block::content("x")]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let summary = pipeline.metrics.summary();
        assert_eq!(summary.handler_failed, 1);
        assert_eq!(summary.handler_success, 0);
        // Dispatch itself succeeded.
        assert_eq!(summary.dispatched_success, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn queue_full_drops_with_metric() {
        let pipeline = Arc::new(Pipeline {
            config: DispatchConfig {
                dispatch_queue_size: 1,
                ..Default::default()
            },
            ..pipeline_parts()
        });
        // No dispatcher running: install a tiny queue manually.
        let (tx, _rx) = mpsc::channel(1);
        *pipeline.dispatch_tx.lock() = Some(tx);

        pipeline.enqueue(inbound("s1", "m1", &[Block::content("a")]));
        pipeline.enqueue(inbound("s1", "m2", &[Block::content("b")]));

        let summary = pipeline.metrics.summary();
        assert_eq!(summary.received_total, 2);
        assert_eq!(summary.dispatched_failed, 1);
    }

    fn pipeline_parts() -> Pipeline {
        Pipeline {
            agent_id: "a.corp.example".to_owned(),
            registry: Arc::new(HandlerRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            store: Arc::new(Store::in_memory("a.corp.example").unwrap()),
            scheduler: Mutex::new(Arc::new(MessageScheduler::new(
                SchedulerConfig {
                    core_workers: 1,
                    ..Default::default()
                },
                Duration::from_secs(5),
            ))),
            manager: Mutex::new(None),
            dispatch_tx: Mutex::new(None),
            config: DispatchConfig::default(),
        }
    }

    #[tokio::test]
    async fn undecodable_envelope_dropped() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let mut raw = inbound("s1", "m1", &[]);
        raw.message = "%7Bnot-json".into();
        pipeline.enqueue(raw);

        let summary = pipeline.metrics.summary();
        assert_eq!(summary.received_total, 1);
        assert_eq!(summary.dispatched_failed, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn repeated_message_id_appends_content() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        pipeline.enqueue(inbound("s1", "m1", &[Block::content("first")]));
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.enqueue(inbound("s1", "m1", &[Block::content("second")]));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let row = pipeline
            .store
            .get_message_by_id("s1", "m1")
            .unwrap()
            .unwrap();
        let content: Vec<serde_json::Value> = serde_json::from_str(&row.content).unwrap();
        assert_eq!(content.len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn ping_short_circuits_handlers() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.registry.add_global(counting_handler(calls.clone()));

        pipeline.enqueue(inbound("s1", "m1", &[Block::ping()]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // No user handler ran and nothing was dispatched to the pool.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let summary = pipeline.metrics.summary();
        assert_eq!(summary.dispatched_success, 0);
        assert_eq!(summary.received_total, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn stream_messages_skip_persistence() {
        let pipeline = test_pipeline();
        let cancel = CancellationToken::new();
        let _task = pipeline.start_dispatcher(cancel.clone());

        let stream_block = Block::TextEventStream {
            status: "success".into(),
            timestamp: 1,
            content: "https://ts/pull?id=1".into(),
            extra: None,
        };
        pipeline.enqueue(inbound("s1", "m-stream", &[stream_block]));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(
            pipeline
                .store
                .get_message_by_id("s1", "m-stream")
                .unwrap()
                .is_none()
        );
        assert_eq!(pipeline.metrics.summary().dispatched_success, 1);
        cancel.cancel();
    }
}
