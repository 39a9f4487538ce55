use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Phase of one acquisition run, surfaced with every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquisitionPhase {
    Checking,
    Downloading,
    Validating,
    Initializing,
    Ready,
}

/// Single progress signal shown to the presentation layer. Percent is the
/// combined 0-100 scale; the phase says which sub-step produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: AcquisitionPhase,
    pub percent: f32,
    pub message: String,
}

/// Combined-scale band each sub-phase maps into.
pub const DOWNLOAD_BAND: (f32, f32) = (0.0, 70.0);
pub const VALIDATE_BAND: (f32, f32) = (70.0, 85.0);
pub const ENGINE_BAND: (f32, f32) = (85.0, 100.0);

/// Linearly rescales a sub-phase's 0-100 progress into `[lo, hi]`.
#[must_use]
pub fn remap(raw: f32, lo: f32, hi: f32) -> f32 {
    let raw = raw.clamp(0.0, 100.0);
    lo + (hi - lo) * (raw / 100.0)
}

/// Clamps emissions to a high-water mark so the combined signal never moves
/// backwards across phase transitions.
pub struct ProgressGuard<'a> {
    sink: &'a (dyn Fn(ProgressEvent) + Send + Sync),
    // percent scaled by 100 so it fits an atomic
    high_water: AtomicU32,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(sink: &'a (dyn Fn(ProgressEvent) + Send + Sync)) -> Self {
        Self {
            sink,
            high_water: AtomicU32::new(0),
        }
    }

    pub fn emit(&self, phase: AcquisitionPhase, percent: f32, message: impl Into<String>) {
        let scaled = (percent.clamp(0.0, 100.0) * 100.0).round() as u32;
        let floor = self
            .high_water
            .fetch_max(scaled, Ordering::Relaxed)
            .max(scaled);
        (self.sink)(ProgressEvent {
            phase,
            percent: floor as f32 / 100.0,
            message: message.into(),
        });
    }
}
