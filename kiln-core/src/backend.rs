use std::any::Any;

use thiserror::Error;

use crate::config::{DiffusionParams, LoraAdapter, SampleMethod, ScheduleMethod};
use crate::version::ModelVersion;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to construct backend context: {0}")]
    Construct(String),
    #[error("backend rejected generation parameters: {0}")]
    Rejected(String),
    #[error("failed to apply lora adapters: {0}")]
    LoraApply(String),
}

/// An owned raw-pixel buffer. Ownership transfers at every hand-off:
/// whichever stage created a buffer is the one that releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

/// Fully resolved sampling parameters for one stream, after version defaults
/// have been filled in and the seed sentinel translated.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub clip_skip: i32,
    pub cfg_scale: f32,
    pub guidance: f32,
    pub width: i32,
    pub height: i32,
    pub sample_method: SampleMethod,
    pub schedule_method: ScheduleMethod,
    pub sampling_steps: i32,
    pub strength: f32,
    /// -1 = backend chooses.
    pub seed: i64,
    pub control_strength: f32,
    pub control_canny: bool,
    pub slg_skip_layers: Vec<i32>,
    pub slg_scale: f32,
    pub slg_start: f32,
    pub slg_end: f32,
}

/// Reference images for an image-to-image stream. The buffers are owned and
/// move into the backend with the call.
#[derive(Debug)]
pub struct InitImages {
    pub init: PixelBuffer,
    pub mask: Option<PixelBuffer>,
    pub control: Option<PixelBuffer>,
}

/// Opaque per-stream backend state. Dropping the box releases the native
/// stream exactly once.
pub trait SamplingCursor: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One loaded diffusion model. `begin_stream` with `images` set runs
/// image-to-image, otherwise text-to-image.
pub trait DiffusionExecutor: Send + Sync {
    fn version(&self) -> ModelVersion;

    fn begin_stream(
        &self,
        request: StreamRequest,
        images: Option<InitImages>,
    ) -> Result<Box<dyn SamplingCursor>, BackendError>;

    /// Advances one denoising step; false once the stream is done or failed.
    fn sample(&self, cursor: &mut dyn SamplingCursor) -> bool;

    /// (steps sampled, steps total).
    fn progress(&self, cursor: &dyn SamplingCursor) -> (usize, usize);

    /// Intermediate decode of the current latent, if one is available.
    fn preview(&self, cursor: &dyn SamplingCursor, faster: bool) -> Option<PixelBuffer>;

    /// Final decoded image; None until the stream completed, and on failure.
    fn result(&self, cursor: &dyn SamplingCursor) -> Option<PixelBuffer>;

    /// Textual generation-parameters record for embedding into the result.
    fn parameters_text(&self, cursor: &dyn SamplingCursor) -> String;

    /// Replaces the adapter set on the live context. Mutates shared weights:
    /// the caller serializes this against in-flight sampling.
    fn apply_lora_adapters(&self, adapters: &[LoraAdapter]) -> Result<(), BackendError>;
}

/// One loaded upscaler model.
pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &PixelBuffer, factor: u32) -> Option<PixelBuffer>;
}

/// Constructs backend contexts from the diffusion block of the resolved
/// configuration.
pub trait DiffusionFactory {
    fn new_executor(
        &self,
        params: &DiffusionParams,
    ) -> Result<Box<dyn DiffusionExecutor>, BackendError>;

    fn new_upscaler(
        &self,
        model_path: &str,
        n_threads: i32,
        tensor_split: &[f32],
    ) -> Result<Box<dyn Upscaler>, BackendError>;
}
