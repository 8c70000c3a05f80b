use serde::{Deserialize, Serialize};

use crate::config::SampleMethod;

/// Architecture family of a loaded diffusion model, detected at context
/// construction and immutable for the context's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVersion {
    Sd1,
    Sd1Inpaint,
    Sd2,
    Sd2Inpaint,
    Sdxl,
    SdxlInpaint,
    SdxlRefiner,
    Sd3,
    Flux,
    FluxFill,
}

serde_plain::derive_display_from_serialize!(ModelVersion);

/// Sampling defaults a model family starts from when the user left the
/// corresponding request field unset. Never overrides an explicit value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionDefaults {
    pub strength: f32,
    pub sample_method: SampleMethod,
    pub sampling_steps: i32,
    pub cfg_scale: f32,
    pub height: i32,
    pub width: i32,
}

impl ModelVersion {
    pub const ALL: [ModelVersion; 10] = [
        ModelVersion::Sd1,
        ModelVersion::Sd1Inpaint,
        ModelVersion::Sd2,
        ModelVersion::Sd2Inpaint,
        ModelVersion::Sdxl,
        ModelVersion::SdxlInpaint,
        ModelVersion::SdxlRefiner,
        ModelVersion::Sd3,
        ModelVersion::Flux,
        ModelVersion::FluxFill,
    ];

    pub fn is_inpaint(self) -> bool {
        matches!(
            self,
            ModelVersion::Sd1Inpaint
                | ModelVersion::Sd2Inpaint
                | ModelVersion::SdxlInpaint
                | ModelVersion::FluxFill
        )
    }

    /// Family defaults, one row per version.
    pub fn defaults(self) -> VersionDefaults {
        use ModelVersion::*;
        use SampleMethod::{Euler, EulerA};

        match self {
            Sd1 => row(0.75, EulerA, 20, 9.0, 512),
            Sd1Inpaint => row(1.0, EulerA, 50, 9.0, 512),
            Sd2 => row(0.75, EulerA, 20, 9.0, 512),
            Sd2Inpaint => row(1.0, Euler, 50, 9.0, 512),
            Sdxl => row(0.75, Euler, 25, 5.0, 1024),
            SdxlInpaint => row(1.0, Euler, 50, 5.0, 512),
            SdxlRefiner => row(0.75, Euler, 25, 5.0, 1024),
            Sd3 => row(0.75, Euler, 20, 4.5, 1024),
            Flux => row(0.75, Euler, 20, 1.0, 1024),
            FluxFill => row(1.0, Euler, 50, 3.5, 1024),
        }
    }
}

fn row(
    strength: f32,
    sample_method: SampleMethod,
    sampling_steps: i32,
    cfg_scale: f32,
    edge: i32,
) -> VersionDefaults {
    VersionDefaults {
        strength,
        sample_method,
        sampling_steps,
        cfg_scale,
        height: edge,
        width: edge,
    }
}
