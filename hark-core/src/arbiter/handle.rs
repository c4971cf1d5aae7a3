use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::{
    arbiter::{ArbiterInput, MicrophoneArbiter, PipelineState, RecognitionState},
    ipc::events::PipelineStateEvent,
    wake::WakeDeviceState,
};

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// How long `WakeDetected`, or a `Processing` the recognizer has gone
    /// quiet in, may wait before falling back to wake listening. Default: 8 s.
    pub wake_detected_timeout: Duration,
    /// Buffered state events for slow subscribers. Default: 64.
    pub event_capacity: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            wake_detected_timeout: Duration::from_secs(8),
            event_capacity: 64,
        }
    }
}

/// Downstream speech-to-text consumer of the microphone.
pub trait SpeechRecognizer: Send + Sync {
    fn start_listening(&self);
    fn stop_listening(&self);
}

/// Cloneable front of the arbiter task.
///
/// Inputs are queued on an unbounded channel and applied in order by one
/// task. Reads go to a snapshot that the task updates after each transition.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::UnboundedSender<ArbiterInput>,
    snapshot: Arc<RwLock<PipelineState>>,
    events: broadcast::Sender<PipelineStateEvent>,
}

impl std::fmt::Debug for ArbiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterHandle")
            .field("state", &*self.snapshot.read())
            .finish_non_exhaustive()
    }
}

impl ArbiterHandle {
    /// Spawn the arbiter task on the current tokio runtime.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn(config: ArbiterConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let snapshot = Arc::new(RwLock::new(PipelineState::Idle));

        let task = tokio::spawn(run(
            rx,
            Arc::clone(&snapshot),
            events.clone(),
            config.wake_detected_timeout,
        ));

        (
            Self {
                tx,
                snapshot,
                events,
            },
            task,
        )
    }

    fn send(&self, input: ArbiterInput) {
        if self.tx.send(input).is_err() {
            debug!("arbiter task has stopped; input dropped");
        }
    }

    pub fn report_wake(&self, state: WakeDeviceState) {
        self.send(ArbiterInput::Wake(state));
    }

    pub fn report_recognition(&self, state: RecognitionState) {
        self.send(ArbiterInput::Recognition(state));
    }

    pub fn notify_wake_detected(&self) {
        self.send(ArbiterInput::WakeDetected);
    }

    pub fn state(&self) -> PipelineState {
        self.snapshot.read().clone()
    }

    pub fn can_wake_detector_capture(&self) -> bool {
        self.snapshot.read().can_wake_detector_capture()
    }

    pub fn can_recognizer_capture(&self) -> bool {
        self.snapshot.read().can_recognizer_capture()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineStateEvent> {
        self.events.subscribe()
    }

    /// Start `recognizer` if it may take the microphone now.
    pub fn start_recognition(&self, recognizer: &dyn SpeechRecognizer) -> bool {
        let state = self.state();
        if !state.can_recognizer_capture() {
            debug!(?state, "recognizer start refused");
            return false;
        }
        recognizer.start_listening();
        true
    }

    pub fn stop_recognition(&self, recognizer: &dyn SpeechRecognizer) {
        recognizer.stop_listening();
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<ArbiterInput>,
    snapshot: Arc<RwLock<PipelineState>>,
    events: broadcast::Sender<PipelineStateEvent>,
    wake_detected_timeout: Duration,
) {
    let mut machine = MicrophoneArbiter::new();
    let mut seq = 0u64;
    let mut deadline: Option<Instant> = None;

    loop {
        let input = tokio::select! {
            next = rx.recv() => match next {
                Some(input) => input,
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ArbiterInput::WakeDetectedTimeout
            }
        };

        let label = input.label();
        let detected = input == ArbiterInput::WakeDetected;
        let prior = machine.state().clone();
        let next = machine.apply(input).clone();

        // A fresh wake or a new stalled state restarts the clock.
        if machine.is_stalled() {
            if deadline.is_none() || detected || prior != next {
                deadline = Some(Instant::now() + wake_detected_timeout);
            }
        } else {
            deadline = None;
        }

        if next == prior {
            continue;
        }

        *snapshot.write() = next.clone();
        match &next {
            PipelineState::Error { cause } => warn!(input = %label, %cause, "pipeline error"),
            PipelineState::WakeListening if label == "wakeDetectedTimeout" => {
                warn!("recognizer never claimed the microphone; back to wake listening")
            }
            _ => info!(input = %label, from = ?prior, to = ?next, "pipeline state"),
        }
        seq += 1;
        let _ = events.send(PipelineStateEvent {
            seq,
            detail: match &next {
                PipelineState::Error { cause } => Some(cause.clone()),
                _ => Some(label),
            },
            state: next,
        });
    }
    debug!("arbiter task finished");
}
