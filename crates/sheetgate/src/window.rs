//! Time-boxed batch window.
//!
//! Submissions go through a bounded channel to one background task. The task
//! waits for the first intent, keeps collecting until the window deadline or
//! the size cap, then flushes everything it holds through [`Pipeline::run`].
//! Windows flush one after another, so a caller's writes to one object finish
//! in submission order.

use crate::cancel::CancelToken;
use crate::config::BatchConfig;
use crate::error::{GateError, Result};
use crate::executor::IntentOutcome;
use crate::intent::Intent;
use crate::pipeline::Pipeline;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

struct Submission {
    intent: Intent,
    cancel: Option<CancelToken>,
    reply: oneshot::Sender<Result<IntentOutcome>>,
}

impl Submission {
    fn abandoned(&self) -> bool {
        self.reply.is_closed() || self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

#[derive(Debug)]
pub struct BatchWindow {
    tx: mpsc::Sender<Submission>,
    shutdown: CancelToken,
    task: Mutex<Option<JoinHandle<()>>>,
    flushes: Arc<AtomicU64>,
}

impl BatchWindow {
    /// Start the window task. Must be called inside a tokio runtime.
    pub fn spawn(pipeline: Arc<Pipeline>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancelToken::new();
        let flushes = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(collect(
            pipeline,
            config,
            rx,
            shutdown.clone(),
            flushes.clone(),
        ));
        Self {
            tx,
            shutdown,
            task: Mutex::new(Some(task)),
            flushes,
        }
    }

    /// Queue `intent` and wait for its outcome. If `cancel` fires first the
    /// caller stops waiting; an intent not yet flushed is dropped.
    pub async fn submit(&self, intent: Intent, cancel: Option<&CancelToken>) -> Result<IntentOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(GateError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        let submission = Submission {
            intent,
            cancel: cancel.cloned(),
            reply,
        };
        self.tx
            .send(submission)
            .await
            .map_err(|_| GateError::Closed)?;
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(GateError::Cancelled),
                    outcome = rx => outcome.unwrap_or(Err(GateError::Closed)),
                }
            }
            None => rx.await.unwrap_or(Err(GateError::Closed)),
        }
    }

    /// Windows flushed so far.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Stop accepting intents, flush what is pending and wait for the task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(_e) = task.await {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_e, "batch window task failed");
            }
        }
    }
}

async fn collect(
    pipeline: Arc<Pipeline>,
    config: BatchConfig,
    mut rx: mpsc::Receiver<Submission>,
    shutdown: CancelToken,
    flushes: Arc<AtomicU64>,
) {
    let mut next_seq = 0u64;
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            next = rx.recv() => next,
        };
        let Some(first) = first else {
            break;
        };
        let mut pending = vec![first];
        let deadline = Instant::now() + config.window();
        while pending.len() < config.max_intents {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                next = rx.recv() => match next {
                    Some(s) => pending.push(s),
                    None => break,
                },
            }
        }
        flush(&pipeline, pending, &mut next_seq).await;
        flushes.fetch_add(1, Ordering::Relaxed);
        let _purged = pipeline.executor().purge_expired();
        #[cfg(feature = "tracing")]
        {
            if _purged > 0 {
                tracing::trace!(purged = _purged, "expired entries dropped");
            }
        }
    }

    rx.close();
    let mut rest = Vec::new();
    while let Ok(s) = rx.try_recv() {
        rest.push(s);
    }
    if !rest.is_empty() {
        flush(&pipeline, rest, &mut next_seq).await;
        flushes.fetch_add(1, Ordering::Relaxed);
    }
}

async fn flush(pipeline: &Pipeline, pending: Vec<Submission>, next_seq: &mut u64) {
    #[cfg(feature = "tracing")]
    let span = tracing::info_span!("flush_window", intents = pending.len());

    let mut replies = rustc_hash::FxHashMap::default();
    let mut items = Vec::with_capacity(pending.len());
    let mut shared: Option<CancelToken> = None;
    let mut uniform = true;
    for submission in pending {
        if submission.abandoned() {
            continue;
        }
        // Dispatch is abandoned on cancellation only when every member of the
        // flush asked for it with the same token.
        match &submission.cancel {
            Some(token) if items.is_empty() => shared = Some(token.clone()),
            Some(token) => uniform &= shared.as_ref().is_some_and(|held| held.same_as(token)),
            None => uniform = false,
        }
        let seq = *next_seq;
        *next_seq += 1;
        items.push((seq, submission.intent));
        replies.insert(seq, submission.reply);
    }
    if items.is_empty() {
        return;
    }

    let cancel = shared.filter(|_| uniform);
    let run = pipeline.run(items, cancel.as_ref());
    #[cfg(feature = "tracing")]
    let run = tracing::Instrument::instrument(run, span);
    for (seq, outcome) in run.await {
        if let Some(reply) = replies.remove(&seq) {
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}
