//! Dispatcher: turns flushed payloads into requests and routes the answers
//! back as per-record outcomes.
//!
//! A single worker task owns the whiteboard. Payloads arrive over an
//! unbounded queue and are posted one at a time, so every response is
//! applied to the whiteboard in dispatch order.

use crate::error::{Error, Result, UploadError};
use crate::upload::channel::{
    batching_mode_channel, payload_job_channel, PayloadJob, PayloadJobReceiver,
    PayloadJobSender, UploadStats,
};
use crate::upload::payload::Payload;
use crate::upload::request::build_request;
use crate::upload::response::{PayloadOutcome, ResponseInterpreter};
use crate::upload::timestamp::Timestamp;
use crate::upload::transport::{StoreDelegate, Transport};
use crate::upload::whiteboard::{BatchingMode, Whiteboard};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Handle to the worker task of one upload session.
pub struct Dispatcher {
    tx: PayloadJobSender,
    mode_rx: watch::Receiver<BatchingMode>,
    handle: JoinHandle<UploadStats>,
}

impl Dispatcher {
    /// Start the worker on the current tokio runtime.
    pub fn spawn<T: Transport>(
        transport: Arc<T>,
        delegate: Arc<dyn StoreDelegate>,
        collection: Url,
        abort_on_failure: bool,
    ) -> Self {
        Self::spawn_on(
            &Handle::current(),
            transport,
            delegate,
            collection,
            abort_on_failure,
        )
    }

    /// Start the worker on a caller-supplied runtime.
    pub fn spawn_on<T: Transport>(
        runtime: &Handle,
        transport: Arc<T>,
        delegate: Arc<dyn StoreDelegate>,
        collection: Url,
        abort_on_failure: bool,
    ) -> Self {
        let (tx, rx) = payload_job_channel();
        let (mode_tx, mode_rx) = batching_mode_channel();

        let worker = PayloadWorker {
            transport,
            delegate,
            collection,
            whiteboard: Whiteboard::new(),
            mode_tx,
            stats: UploadStats::new(),
            abort_on_failure,
            aborted: false,
            completed: false,
        };
        let handle = runtime.spawn(worker.run(rx));

        Self {
            tx,
            mode_rx,
            handle,
        }
    }

    /// Hand a flushed payload to the worker.
    pub fn queue(&self, payload: Payload, is_commit: bool, is_last: bool) -> Result<()> {
        self.queue_job(PayloadJob::from_payload(payload, is_commit, is_last))
    }

    pub fn queue_job(&self, job: PayloadJob) -> Result<()> {
        debug!(
            records = job.ids.len(),
            is_commit = job.is_commit,
            is_last = job.is_last,
            mode = ?job.mode,
            "Queueing payload"
        );
        self.tx.send(job).map_err(|_| Error::WorkerGone)
    }

    /// Batching support as observed by the worker.
    pub fn batching_mode(&self) -> watch::Receiver<BatchingMode> {
        self.mode_rx.clone()
    }

    /// Close the queue and wait for every queued payload to be processed.
    pub async fn finish(self) -> Result<UploadStats> {
        drop(self.tx);
        Ok(self.handle.await?)
    }
}

/// Worker side: owns the whiteboard and talks to the delegate.
struct PayloadWorker<T> {
    transport: Arc<T>,
    delegate: Arc<dyn StoreDelegate>,
    collection: Url,
    whiteboard: Whiteboard,
    mode_tx: watch::Sender<BatchingMode>,
    stats: UploadStats,
    abort_on_failure: bool,
    /// A payload failed and later payloads are not sent
    aborted: bool,
    /// `on_store_completed` already fired
    completed: bool,
}

impl<T: Transport> PayloadWorker<T> {
    async fn run(mut self, mut rx: PayloadJobReceiver) -> UploadStats {
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }

        if !self.completed {
            // Queue closed with a batch still open: its records never commit.
            self.fail_buffered(&UploadError::Aborted);
            if self.aborted {
                self.stats.finished_cleanly = false;
            }
            self.finished(self.stats.last_modified);
        }

        self.stats.batching_mode = self.whiteboard.mode();
        self.stats
    }

    async fn process(&mut self, job: PayloadJob) {
        // The caller may switch batching off; it never switches it back on.
        if job.mode.is_disabled() && !self.whiteboard.mode().is_disabled() {
            debug!("Batching disabled by the uploader");
            self.whiteboard.set_mode(BatchingMode::Disabled);
            self.publish_mode();
        }

        if self.aborted {
            debug!(records = job.ids.len(), "Skipping payload after earlier failure");
            for id in &job.ids {
                self.record_failed(&UploadError::Aborted, id);
            }
            self.fail_buffered(&UploadError::Aborted);
            if job.is_last {
                self.last_payload_failed();
            }
            return;
        }

        // The closing empty commit is only meaningful for a batching server,
        // which may not have been known when it was queued.
        if job.is_empty() && job.is_commit && self.whiteboard.mode().is_disabled() {
            debug!("Server does not batch; skipping empty commit");
            self.stats.payloads_skipped += 1;
            if job.is_last {
                self.finished(self.stats.last_modified);
            }
            return;
        }

        let request = build_request(&job.records, job.is_commit, &self.whiteboard, &self.collection);
        debug!(
            uri = %request.uri,
            records = job.ids.len(),
            bytes = request.body.len(),
            "Posting payload"
        );
        self.stats.payloads_sent += 1;

        let interpreter = ResponseInterpreter::new(&job.ids, job.is_commit, job.is_last);
        let outcome = match self.transport.post(request).await {
            Ok(response) => interpreter.interpret(&response, &mut self.whiteboard),
            Err(e) => interpreter.handle_request_error(&e),
        };
        self.publish_mode();

        match outcome {
            PayloadOutcome::Succeeded {
                succeeded,
                failed,
                timestamp,
            } => {
                for (id, reason) in failed {
                    self.record_failed(&UploadError::Rejected(reason), &id);
                }
                self.payload_succeeded(succeeded, timestamp, job.is_commit, job.is_last);
            }
            PayloadOutcome::Failed(error) => {
                for id in &job.ids {
                    self.record_failed(&error, id);
                }
                let abort = self.abort_on_failure || error.is_protocol_violation();
                // Successes buffered for this batch only become durable at
                // its commit, which will now never happen.
                if job.is_commit || abort {
                    self.fail_buffered(&error);
                }
                self.payload_failed(job.is_last, abort);
            }
        }

        if job.is_commit && !job.is_last {
            self.whiteboard = self.whiteboard.next_batch();
        }
    }

    /// Records the server confirmed. They are reported once durable: at the
    /// batch commit, or straight away when the server does not batch.
    fn payload_succeeded(
        &mut self,
        ids: Vec<String>,
        timestamp: Timestamp,
        is_commit: bool,
        is_last: bool,
    ) {
        for id in &ids {
            if let Err(e) = self.whiteboard.record_succeeded(id) {
                warn!(error = %e, "Dropping invalid success identifier");
            }
        }

        if is_commit || !self.whiteboard.mode().is_enabled() {
            for id in self.whiteboard.take_success_ids() {
                self.delegate.on_record_store_succeeded(&id);
                self.stats.records_succeeded += 1;
            }
        }

        if is_commit {
            self.stats.batches_committed += 1;
        }

        self.stats.last_modified = self.stats.last_modified.max(Some(timestamp));

        if is_last {
            self.finished(self.stats.last_modified);
        }
    }

    fn record_failed(&mut self, error: &UploadError, id: &str) {
        warn!(id, %error, "Record failed to store");
        self.stats.records_failed += 1;
        self.delegate.on_record_store_failed(error, id);
    }

    /// Fail records the server accepted into a batch that will not commit.
    fn fail_buffered(&mut self, error: &UploadError) {
        for id in self.whiteboard.take_success_ids() {
            self.record_failed(error, &id);
        }
    }

    fn payload_failed(&mut self, is_last: bool, abort: bool) {
        self.stats.payloads_failed += 1;
        if abort {
            self.aborted = true;
        }
        if is_last {
            self.last_payload_failed();
        }
    }

    /// The terminal payload failed: the session did not finish cleanly.
    fn last_payload_failed(&mut self) {
        self.stats.finished_cleanly = false;
        self.finished(self.stats.last_modified);
    }

    fn finished(&mut self, timestamp: Option<Timestamp>) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            succeeded = self.stats.records_succeeded,
            failed = self.stats.records_failed,
            payloads = self.stats.payloads_sent,
            clean = self.stats.finished_cleanly,
            "Upload session finished"
        );
        self.delegate.on_store_completed(timestamp);
    }

    fn publish_mode(&self) {
        let mode = self.whiteboard.mode();
        self.mode_tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::request::PostRequest;
    use crate::upload::transport::{HttpResponse, TransportError, LAST_MODIFIED_HEADER};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and remembers every request.
    struct Scripted {
        responses: Mutex<VecDeque<std::result::Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<PostRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<std::result::Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn post(
            &self,
            request: PostRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Request("no scripted response".into())))
        }
    }

    #[derive(Default)]
    struct Recorder {
        succeeded: Mutex<Vec<String>>,
        failed: Mutex<Vec<(String, UploadError)>>,
        completed: Mutex<Vec<Option<Timestamp>>>,
    }

    impl StoreDelegate for Recorder {
        fn on_record_store_succeeded(&self, id: &str) {
            self.succeeded.lock().unwrap().push(id.to_string());
        }

        fn on_record_store_failed(&self, error: &UploadError, id: &str) {
            self.failed.lock().unwrap().push((id.to_string(), error.clone()));
        }

        fn on_store_completed(&self, timestamp: Option<Timestamp>) {
            self.completed.lock().unwrap().push(timestamp);
        }
    }

    fn payload(ids: &[&str]) -> Payload {
        let mut payload = Payload::new(4096, 100, 0.5);
        for id in ids {
            let bytes = Bytes::from(format!(r#"{{"id":"{}"}}"#, id));
            let delta = bytes.len() + 1;
            payload
                .add_and_estimate_if_full(delta, bytes, id.to_string())
                .unwrap();
        }
        payload
    }

    fn ok(status: u16, ts: &str, body: &str) -> std::result::Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(status)
            .with_header(LAST_MODIFIED_HEADER, ts)
            .with_body(body))
    }

    fn collection() -> Url {
        Url::parse("https://example.com/storage/forms").unwrap()
    }

    #[tokio::test]
    async fn test_batch_successes_reported_at_commit() {
        let transport = Scripted::new(vec![
            ok(202, "10.0", r#"{"batch":"abc","success":["a","b"]}"#),
            ok(200, "11.0", r#"{"success":["c"]}"#),
        ]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport.clone(), recorder.clone(), collection(), true);

        dispatcher.queue(payload(&["a", "b"]), false, false).unwrap();
        dispatcher.queue(payload(&["c"]), true, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        assert_eq!(*recorder.succeeded.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(recorder.failed.lock().unwrap().is_empty());
        assert_eq!(
            *recorder.completed.lock().unwrap(),
            vec![Some(Timestamp::from_millis(11_000))]
        );
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.batching_mode, BatchingMode::Enabled);
        assert!(stats.finished_cleanly);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].uri.query(), Some("batch=true"));
        assert_eq!(requests[0].if_unmodified_since, None);
        assert_eq!(requests[1].uri.query(), Some("batch=abc&commit=true"));
        assert_eq!(requests[1].if_unmodified_since.as_deref(), Some("10.000"));
    }

    #[tokio::test]
    async fn test_non_2xx_fails_every_record() {
        let transport = Scripted::new(vec![Ok(HttpResponse::new(500))]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport, recorder.clone(), collection(), true);

        dispatcher.queue(payload(&["a", "b"]), false, false).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        let failed = recorder.failed.lock().unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed
            .iter()
            .all(|(_, e)| *e == UploadError::RecordNotProcessed { status: 500 }));
        // not terminal: completion fires at shutdown
        assert_eq!(recorder.completed.lock().unwrap().len(), 1);
        assert!(!stats.finished_cleanly);
    }

    #[tokio::test]
    async fn test_terminal_failure_marks_session_unclean() {
        let transport = Scripted::new(vec![Err(TransportError::Request("reset".into()))]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport, recorder.clone(), collection(), false);

        dispatcher.queue(payload(&["a", "b"]), true, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        assert_eq!(recorder.failed.lock().unwrap().len(), 2);
        assert_eq!(*recorder.completed.lock().unwrap(), vec![None]);
        assert!(!stats.finished_cleanly);
        assert_eq!(stats.payloads_failed, 1);
    }

    #[tokio::test]
    async fn test_abort_skips_later_payloads() {
        let transport = Scripted::new(vec![
            ok(202, "10.0", r#"{"batch":"abc","success":["a"]}"#),
            ok(202, "10.0", r#"{"batch":"xyz","success":["b"]}"#),
        ]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport.clone(), recorder.clone(), collection(), true);

        dispatcher.queue(payload(&["a"]), false, false).unwrap();
        dispatcher.queue(payload(&["b"]), false, false).unwrap();
        dispatcher.queue(payload(&["c"]), true, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        let failed = recorder.failed.lock().unwrap();
        let ids: Vec<&str> = failed.iter().map(|(id, _)| id.as_str()).collect();
        // b was rejected, a was staged in the batch that can no longer commit
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(matches!(failed[0].1, UploadError::TokenConflict { .. }));
        assert!(matches!(failed[1].1, UploadError::TokenConflict { .. }));
        assert_eq!(failed[2], ("c".to_string(), UploadError::Aborted));
        assert!(recorder.succeeded.lock().unwrap().is_empty());
        assert_eq!(transport.requests.lock().unwrap().len(), 2);
        assert!(!stats.finished_cleanly);
    }

    #[tokio::test]
    async fn test_record_level_failures_do_not_affect_siblings() {
        let transport = Scripted::new(vec![ok(
            200,
            "10.0",
            r#"{"success":["a"],"failed":{"b":"quota"}}"#,
        )]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport, recorder.clone(), collection(), true);

        dispatcher.queue(payload(&["a", "b"]), true, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        assert_eq!(*recorder.succeeded.lock().unwrap(), vec!["a"]);
        assert_eq!(
            *recorder.failed.lock().unwrap(),
            vec![("b".to_string(), UploadError::Rejected("quota".into()))]
        );
        assert!(stats.finished_cleanly);
    }

    #[tokio::test]
    async fn test_empty_commit_skipped_without_batching() {
        let transport = Scripted::new(vec![ok(200, "10.0", r#"{"success":["a"]}"#)]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport.clone(), recorder.clone(), collection(), true);
        let mut mode = dispatcher.batching_mode();

        dispatcher.queue(payload(&["a"]), false, false).unwrap();
        dispatcher.queue(payload(&[]), true, true).unwrap();

        mode.changed().await.unwrap();
        assert_eq!(*mode.borrow(), BatchingMode::Disabled);

        let stats = dispatcher.finish().await.unwrap();
        assert_eq!(stats.payloads_sent, 1);
        assert_eq!(stats.payloads_skipped, 1);
        assert_eq!(*recorder.succeeded.lock().unwrap(), vec!["a"]);
        assert_eq!(
            *recorder.completed.lock().unwrap(),
            vec![Some(Timestamp::from_millis(10_000))]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_fails_staged_records() {
        let transport = Scripted::new(vec![
            ok(202, "10.0", r#"{"batch":"abc","success":["a","b"]}"#),
            Ok(HttpResponse::new(500)),
            ok(200, "11.0", r#"{"success":["e"]}"#),
        ]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport, recorder.clone(), collection(), false);

        dispatcher.queue(payload(&["a", "b"]), false, false).unwrap();
        dispatcher.queue(payload(&["c", "d"]), true, false).unwrap();
        dispatcher.queue(payload(&["e"]), true, true).unwrap();
        dispatcher.finish().await.unwrap();

        let failed = recorder.failed.lock().unwrap();
        let ids: Vec<&str> = failed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
        assert!(failed
            .iter()
            .all(|(_, e)| *e == UploadError::RecordNotProcessed { status: 500 }));
        assert_eq!(*recorder.succeeded.lock().unwrap(), vec!["e"]);
    }

    #[tokio::test]
    async fn test_protocol_violation_aborts_even_when_continuing() {
        let transport = Scripted::new(vec![
            ok(202, "10.0", r#"{"success":["a"]}"#),
            ok(200, "11.0", r#"{"success":["b"]}"#),
        ]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport.clone(), recorder.clone(), collection(), false);

        dispatcher.queue(payload(&["a"]), false, false).unwrap();
        dispatcher.queue(payload(&["b"]), true, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        let failed = recorder.failed.lock().unwrap();
        assert_eq!(failed[0], ("a".to_string(), UploadError::MissingBatchToken));
        assert_eq!(failed[1], ("b".to_string(), UploadError::Aborted));
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
        assert!(!stats.finished_cleanly);
    }

    #[tokio::test]
    async fn test_forced_mode_drops_batch_parameters() {
        let transport = Scripted::new(vec![
            ok(200, "10.0", r#"{"success":["a"]}"#),
            ok(200, "11.0", r#"{"success":["b"]}"#),
        ]);
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::spawn(transport.clone(), recorder.clone(), collection(), true);

        let job = PayloadJob::from_payload(payload(&["a"]), false, false)
            .with_mode(BatchingMode::Disabled);
        dispatcher.queue_job(job).unwrap();
        dispatcher.queue(payload(&["b"]), false, true).unwrap();
        let stats = dispatcher.finish().await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].uri.query(), None);
        assert_eq!(requests[1].uri.query(), None);
        assert_eq!(*recorder.succeeded.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(stats.batching_mode, BatchingMode::Disabled);
        assert!(stats.finished_cleanly);
    }
}
