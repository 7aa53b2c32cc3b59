//! Capture pipe
//!
//! A dedicated OS thread drives the frame source through the segmenter and
//! pushes finished utterances onto a bounded queue; the foreground loop
//! drains the queue with a timeout. The producer side is allowed to apply
//! backpressure (audio is already gated by the segmenter), unlike broker
//! delivery which must never block.
//!
//! This is a thread rather than a tokio task because cpal streams are not
//! `Send`: the microphone source must be constructed on the thread that
//! reads it, so [`CapturePipe::start`] takes a factory closure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::voice::capture::FrameSource;
use crate::voice::segmenter::{PauseHandle, Utterance, UtteranceSegmenter};
use crate::{Error, Result};

/// Outcome of one foreground receive attempt
#[derive(Debug)]
pub enum Recv {
    /// A spoken segment arrived
    Utterance(Utterance),
    /// Nothing arrived within the timeout; retry
    Empty,
    /// The capture thread ended and nothing more will arrive
    Closed,
}

/// Running capture thread plus the consumer end of the utterance queue
pub struct CapturePipe {
    utterances: mpsc::Receiver<Utterance>,
    pause: PauseHandle,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CapturePipe {
    /// Spawn the capture thread and wait for the source to come up
    ///
    /// The factory runs on the capture thread and receives the shutdown
    /// flag; a source that blocks waiting for audio must watch it and
    /// report end-of-stream once cleared.
    ///
    /// # Errors
    ///
    /// Returns the factory's error if the audio source cannot be opened;
    /// startup is the one point where an audio fault is fatal.
    pub async fn start<S, F>(
        factory: F,
        segmenter: UtteranceSegmenter,
        queue_capacity: usize,
    ) -> Result<Self>
    where
        S: FrameSource + 'static,
        F: FnOnce(Arc<AtomicBool>) -> Result<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));
        let pause = segmenter.pause_handle();

        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let mut source = match factory(Arc::clone(&flag)) {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut segmenter = segmenter;
                capture_loop(&mut source, &mut segmenter, &tx, &flag);
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("capture thread died during startup".to_string()))??;

        tracing::info!("capture pipeline started");

        Ok(Self {
            utterances: rx,
            pause,
            running,
            thread: Some(thread),
        })
    }

    /// Handle controlling the segmenter's pause flag
    #[must_use]
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Wait up to `timeout` for the next utterance
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.utterances.recv()).await {
            Ok(Some(utterance)) => Recv::Utterance(utterance),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    /// Stop the capture thread and release the audio source
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CapturePipe {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Drive the source until shutdown or end of stream
fn capture_loop<S: FrameSource>(
    source: &mut S,
    segmenter: &mut UtteranceSegmenter,
    tx: &mpsc::Sender<Utterance>,
    running: &AtomicBool,
) {
    while running.load(Ordering::Relaxed) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                if let Some(utterance) = segmenter.process(&frame) {
                    // Bounded queue: block here rather than drop speech
                    if tx.blocking_send(utterance).is_err() {
                        tracing::debug!("utterance queue closed, stopping capture");
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::info!("audio source ended");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed, continuing");
            }
        }
    }
    tracing::debug!("capture loop exited");
}
