//! Microphone ownership between the wake detector and the speech recognizer.
//!
//! [`MicrophoneArbiter`] is the pure transition function; [`ArbiterHandle`]
//! runs it on a single tokio task so every update is serialised.
//!
//! ```text
//!           wake Loaded               event                recognition Available
//!   Idle ───────────────► WakeListening ───► WakeDetected ───────────────────────► Processing
//!    ▲                         ▲                  │ timeout                         │
//!    │                         └──────────────────┘                                 │ Listening
//!    │                                                                              ▼
//!    └──────────────── recognition Available (wake not Loaded) ◄──── RecognitionListening
//! ```

pub mod handle;

pub use handle::{ArbiterConfig, ArbiterHandle, SpeechRecognizer};

use serde::{Deserialize, Serialize};

use crate::wake::WakeDeviceState;

/// Who currently owns the microphone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    WakeListening,
    WakeDetected,
    RecognitionListening,
    Processing,
    Error { cause: String },
}

impl PipelineState {
    pub fn can_wake_detector_capture(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::WakeListening)
    }

    pub fn can_recognizer_capture(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::WakeDetected)
    }
}

/// Lifecycle of the downstream speech recognizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecognitionState {
    NotAvailable,
    Loading,
    Available,
    Listening,
    Error { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterInput {
    Wake(WakeDeviceState),
    Recognition(RecognitionState),
    WakeDetected,
    /// The task's stall timer fired: nobody claimed the microphone after a
    /// wake, either in `WakeDetected` or in a `Processing` the recognizer
    /// has gone quiet in.
    WakeDetectedTimeout,
}

impl ArbiterInput {
    /// Short label for logs and state events.
    pub fn label(&self) -> String {
        fn kind<T: Serialize>(value: &T) -> String {
            serde_json::to_value(value)
                .ok()
                .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string))
                .unwrap_or_default()
        }
        match self {
            ArbiterInput::Wake(s) => format!("wake:{}", kind(s)),
            ArbiterInput::Recognition(s) => format!("recognition:{}", kind(s)),
            ArbiterInput::WakeDetected => "wakeDetected".into(),
            ArbiterInput::WakeDetectedTimeout => "wakeDetectedTimeout".into(),
        }
    }
}

/// Pure pipeline state machine. Holds the latest level of each input stream.
#[derive(Debug, Clone)]
pub struct MicrophoneArbiter {
    state: PipelineState,
    wake: WakeDeviceState,
    recognition: Option<RecognitionState>,
}

impl Default for MicrophoneArbiter {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            wake: WakeDeviceState::NotLoaded,
            recognition: None,
        }
    }
}

impl MicrophoneArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn wake_state(&self) -> &WakeDeviceState {
        &self.wake
    }

    pub fn recognition_state(&self) -> Option<&RecognitionState> {
        self.recognition.as_ref()
    }

    pub fn can_wake_detector_capture(&self) -> bool {
        self.state.can_wake_detector_capture()
    }

    pub fn can_recognizer_capture(&self) -> bool {
        self.state.can_recognizer_capture()
    }

    /// Record `input` and move to the next state.
    pub fn apply(&mut self, input: ArbiterInput) -> &PipelineState {
        match &input {
            ArbiterInput::Wake(s) => self.wake = s.clone(),
            ArbiterInput::Recognition(s) => self.recognition = Some(s.clone()),
            ArbiterInput::WakeDetected | ArbiterInput::WakeDetectedTimeout => {}
        }
        self.state = self.next_state(&input);
        &self.state
    }

    /// No consumer is on its way to the microphone: the recognizer was not
    /// started after a wake, or reported `Available` without listening.
    pub fn is_stalled(&self) -> bool {
        match self.state {
            PipelineState::WakeDetected => true,
            PipelineState::Processing => {
                matches!(self.recognition, None | Some(RecognitionState::Available))
            }
            _ => false,
        }
    }

    fn settled(&self) -> PipelineState {
        if self.wake.is_loaded() {
            PipelineState::WakeListening
        } else {
            PipelineState::Idle
        }
    }

    fn next_state(&self, input: &ArbiterInput) -> PipelineState {
        use PipelineState as P;
        use RecognitionState as R;

        let prior = &self.state;

        // Errors are levels: they hold until the failing side reports otherwise.
        if let Some(cause) = self.wake.error_cause() {
            return P::Error {
                cause: cause.to_string(),
            };
        }
        if let Some(R::Error { cause }) = &self.recognition {
            return P::Error {
                cause: cause.clone(),
            };
        }

        match self.recognition {
            Some(R::Listening) => return P::RecognitionListening,
            Some(R::Loading) => return P::Processing,
            _ => {}
        }

        // Only the report itself counts, not a stale Available level.
        if let ArbiterInput::Recognition(R::Available) = input {
            match prior {
                P::WakeDetected => return P::Processing,
                P::RecognitionListening => return self.settled(),
                _ => {}
            }
        }

        match input {
            ArbiterInput::WakeDetected => return P::WakeDetected,
            ArbiterInput::WakeDetectedTimeout if self.is_stalled() => return self.settled(),
            _ => {}
        }

        let recognizer_busy = matches!(prior, P::RecognitionListening | P::Processing);
        if self.wake.is_loaded() {
            if !recognizer_busy && *prior != P::WakeDetected {
                return P::WakeListening;
            }
        } else if !recognizer_busy {
            return P::Idle;
        }

        // Recognizer went quiet without passing through Available.
        if recognizer_busy && matches!(self.recognition, None | Some(R::Available | R::NotAvailable))
        {
            return self.settled();
        }

        prior.clone()
    }
}
