//! Event types broadcast to host applications.
//!
//! | Event | Source |
//! |-------|--------|
//! | `WakeEvent` | `HarkEngine::subscribe_wake` |
//! | `PipelineStateEvent` | `ArbiterHandle::subscribe` |
//! | `WakeDeviceStateEvent` | `WakeDeviceRegistry::subscribe` |
//! | `EngineStatusEvent` | `HarkEngine::subscribe_status` |

use serde::{Deserialize, Serialize};

use crate::{
    arbiter::PipelineState,
    wake::{WakeDeviceKind, WakeDeviceState},
};

// ---------------------------------------------------------------------------
// Wake events
// ---------------------------------------------------------------------------

/// Emitted when the active detector's score crosses its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Classifier score of the triggering frame.
    pub score: f32,
    /// Index of the triggering frame since the engine started.
    pub frame_index: u64,
}

// ---------------------------------------------------------------------------
// Pipeline / device state events
// ---------------------------------------------------------------------------

/// Emitted by the arbiter task after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStateEvent {
    pub seq: u64,
    pub state: PipelineState,
    /// The input that caused the change, or the error cause.
    pub detail: Option<String>,
}

/// Emitted for every lifecycle change of the active wake device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeDeviceStateEvent {
    pub kind: WakeDeviceKind,
    pub state: WakeDeviceState,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Capture lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Microphone open, pipeline running.
    Listening,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Pipeline or device failure; restart required.
    Error,
}
