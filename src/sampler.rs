// Error sampler
// Probabilistic capture of failing requests into a bounded queue, drained
// by a dedicated writer that publishes to the event bus
//
// Numan Thabit 2025 Nov

use crate::config::SamplerConfig;
use crate::metrics;
use crate::store::EventBus;
use crate::types::ErrorEvent;
use crate::util;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the pipeline observed about a failing response; the sampler turns
/// it into an [`ErrorEvent`] only when the capture coin-flip succeeds.
#[derive(Debug, Clone)]
pub struct SampledFailure {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub method: String,
    pub path: String,
    pub service_name: String,
    pub status_code: u16,
    pub error_message: String,
    pub stack_trace: Vec<String>,
}

/// Unbiased Bernoulli sampler over failing responses. Enqueue never
/// blocks the request path: a full queue drops the event and bumps the
/// dropped counter.
pub struct ErrorSampler {
    sampling_rate: f64,
    tx: mpsc::Sender<ErrorEvent>,
    rng: Mutex<StdRng>,
}

impl ErrorSampler {
    pub fn new(config: &SamplerConfig) -> (Self, mpsc::Receiver<ErrorEvent>) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        (
            Self {
                sampling_rate: config.sampling_rate,
                tx,
                rng: Mutex::new(StdRng::from_entropy()),
            },
            rx,
        )
    }

    #[cfg(test)]
    pub(crate) fn with_seed(config: &SamplerConfig, seed: u64) -> (Self, mpsc::Receiver<ErrorEvent>) {
        let (mut sampler, rx) = Self::new(config);
        sampler.rng = Mutex::new(StdRng::seed_from_u64(seed));
        (sampler, rx)
    }

    /// Capture with probability `sampling_rate`. Returns whether the
    /// event was enqueued.
    pub fn sample(&self, failure: SampledFailure) -> bool {
        if !self.should_sample() {
            metrics::ERRORS_SKIPPED.inc();
            return false;
        }

        let event = ErrorEvent {
            event_id: util::generate_id(),
            trace_id: failure.trace_id.unwrap_or_else(util::generate_id),
            span_id: failure.span_id.unwrap_or_else(|| util::generate_id()[..16].to_string()),
            request_path: failure.path,
            method: failure.method,
            service_name: failure.service_name,
            status_code: failure.status_code,
            error_message: failure.error_message,
            stack_trace: failure.stack_trace,
            timestamp: chrono::Utc::now(),
            cluster_id: String::new(),
        };

        match self.tx.try_send(event) {
            Ok(()) => {
                metrics::ERRORS_SAMPLED.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::ERRORS_DROPPED.inc();
                debug!("sampler queue full; event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::ERRORS_DROPPED.inc();
                warn!("sampler drainer gone; event dropped");
                false
            }
        }
    }

    fn should_sample(&self) -> bool {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        rng.gen::<f64>() < self.sampling_rate
    }
}

/// Dedicated writer: drains the queue and publishes each event to the
/// bus. Publish failures are logged and counted, never retried inline —
/// the bus is at-least-once best-effort from this side.
pub fn spawn_drainer(
    mut rx: mpsc::Receiver<ErrorEvent>,
    bus: Arc<dyn EventBus>,
    topic: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // flush whatever is already queued, then exit
                    while let Ok(event) = rx.try_recv() {
                        publish(bus.as_ref(), &topic, event).await;
                    }
                    info!("error sampler drainer stopped");
                    return;
                }
                received = rx.recv() => {
                    match received {
                        Some(event) => publish(bus.as_ref(), &topic, event).await,
                        None => return,
                    }
                }
            }
        }
    })
}

async fn publish(bus: &dyn EventBus, topic: &str, event: ErrorEvent) {
    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize error event");
            return;
        }
    };

    if let Err(err) = bus.publish(topic, &event.event_id, payload).await {
        metrics::BUS_PUBLISH_ERRORS.inc();
        warn!(error = %err, event_id = %event.event_id, "failed to publish error event");
    }
}
