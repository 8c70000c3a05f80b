use tracing::{info, warn};

use crate::backend::{
    BackendError, DiffusionExecutor, DiffusionFactory, InitImages, SamplingCursor, StreamRequest,
    Upscaler,
};
use crate::config::{
    DiffusionParams, DiffusionSamplingParams, LoraAdapter, SampleMethod, ScheduleMethod,
    DEFAULT_SEED,
};
use crate::encode_png;
use crate::version::ModelVersion;

/// Each upscaler pass scales by this factor.
const UPSCALE_FACTOR: u32 = 4;

/// One in-flight image synthesis: the resolved request (a private copy, so
/// concurrent requests never alias) plus the opaque backend cursor.
///
/// Created by [`DiffusionContext::generate`], advanced by repeated
/// [`DiffusionContext::sample`] calls, read through `progress`/`preview`,
/// finished with `result`. Closing (or dropping) releases the cursor exactly
/// once; a closed stream reads as completed-with-nothing.
pub struct SamplingStream {
    request: StreamRequest,
    cursor: Option<Box<dyn SamplingCursor>>,
}

impl SamplingStream {
    /// The fully resolved parameters this stream is sampling with.
    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_none()
    }

    /// Releases the native stream state. Idempotent.
    pub fn close(&mut self) {
        self.cursor = None;
    }
}

/// Owns one diffusion backend context plus an optional upscaler context and
/// drives sampling streams against them. Construction, LoRA application and
/// warm-up follow the configured diffusion block; per-request state lives on
/// the [`SamplingStream`], so many streams may share one context.
pub struct DiffusionContext {
    executor: Box<dyn DiffusionExecutor>,
    upscaler: Option<Box<dyn Upscaler>>,
    params: DiffusionParams,
}

impl DiffusionContext {
    /// Builds the diffusion context and, if an upscale model is configured,
    /// the upscaler context. If the upscaler fails, the diffusion context
    /// built before it is released before the error surfaces; nothing leaks
    /// on a partial failure.
    pub fn new(
        factory: &dyn DiffusionFactory,
        params: DiffusionParams,
    ) -> Result<Self, BackendError> {
        let executor = factory.new_executor(&params)?;

        let upscaler = if params.upscale_model.is_empty() {
            None
        } else {
            match factory.new_upscaler(&params.upscale_model, params.n_threads, &params.tensor_split)
            {
                Ok(upscaler) => Some(upscaler),
                // `executor` drops here, releasing the context already built.
                Err(err) => return Err(err),
            }
        };

        if !params.lora_init_without_apply && !params.lora_adapters.is_empty() {
            executor.apply_lora_adapters(&params.lora_adapters)?;
        }

        let context = Self {
            executor,
            upscaler,
            params,
        };

        if context.params.warmup {
            context.warmup();
        }

        Ok(context)
    }

    pub fn version(&self) -> ModelVersion {
        self.executor.version()
    }

    pub fn params(&self) -> &DiffusionParams {
        &self.params
    }

    /// Replaces the adapter set on the live context. Takes `&mut self`:
    /// adapter application mutates shared weights and must never overlap an
    /// in-flight `sample` on a stream borrowing this context.
    pub fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<(), BackendError> {
        self.executor.apply_lora_adapters(adapters)
    }

    /// Starts one stream. With `images` set the request is image-to-image,
    /// otherwise text-to-image. Sampling fields the caller left unset fall
    /// back to this model version's defaults; seed 0 means the backend picks
    /// one. Fails only if the backend rejects the parameters, in which case
    /// no stream exists.
    pub fn generate(
        &self,
        prompt: &str,
        sparams: &DiffusionSamplingParams,
        images: Option<InitImages>,
    ) -> Result<SamplingStream, BackendError> {
        let defaults = self.executor.version().defaults();
        let request = StreamRequest {
            prompt: prompt.to_string(),
            negative_prompt: sparams.negative_prompt.clone(),
            clip_skip: -1,
            cfg_scale: sparams.cfg_scale.unwrap_or(defaults.cfg_scale),
            guidance: sparams.guidance,
            width: sparams.width,
            height: sparams.height,
            sample_method: sparams.sample_method.unwrap_or(defaults.sample_method),
            schedule_method: sparams.schedule_method,
            sampling_steps: sparams.sampling_steps.unwrap_or(defaults.sampling_steps),
            strength: sparams.strength.unwrap_or(defaults.strength),
            seed: if sparams.seed == DEFAULT_SEED {
                -1
            } else {
                sparams.seed as i64
            },
            control_strength: sparams.control_strength,
            control_canny: sparams.control_canny,
            slg_skip_layers: sparams.slg_skip_layers.clone(),
            slg_scale: sparams.slg_scale,
            slg_start: sparams.slg_start,
            slg_end: sparams.slg_end,
        };

        let cursor = self.executor.begin_stream(request.clone(), images)?;
        Ok(SamplingStream {
            request,
            cursor: Some(cursor),
        })
    }

    /// Advances the stream by exactly one denoising step. Returns whether the
    /// stream is still sampling; false means completed or failed. Progress is
    /// made only through repeated calls, the context never runs its own loop.
    pub fn sample(&self, stream: &mut SamplingStream) -> bool {
        match stream.cursor.as_mut() {
            Some(cursor) => self.executor.sample(cursor.as_mut()),
            None => false,
        }
    }

    /// (steps sampled, steps total). Non-mutating and always safe to call.
    pub fn progress(&self, stream: &SamplingStream) -> (usize, usize) {
        match stream.cursor.as_ref() {
            Some(cursor) => self.executor.progress(cursor.as_ref()),
            None => (0, 1),
        }
    }

    /// Intermediate decode of the current latent, encoded without metadata.
    /// `faster` trades fidelity for latency. None while nothing is available.
    pub fn preview(&self, stream: &SamplingStream, faster: bool) -> Option<Vec<u8>> {
        let cursor = stream.cursor.as_ref()?;
        let image = self.executor.preview(cursor.as_ref(), faster)?;
        encode_png(&image, None)
    }

    /// Final deliverable: the decoded image, run through the configured
    /// upscale chain, encoded with the generation-parameters record embedded.
    /// None until the stream completed, and on failure.
    pub fn result(&self, stream: &SamplingStream) -> Option<Vec<u8>> {
        let cursor = stream.cursor.as_ref()?;
        let mut image = self.executor.result(cursor.as_ref())?;

        if let Some(upscaler) = &self.upscaler {
            for _ in 0..self.params.upscale_repeats {
                // A failing pass ends the chain; the last good image stands.
                match upscaler.upscale(&image, UPSCALE_FACTOR) {
                    Some(upscaled) => image = upscaled,
                    None => {
                        warn!("failed to upscale image, keeping previous pass");
                        break;
                    }
                }
            }
        }

        let parameters = self.executor.parameters_text(cursor.as_ref());
        encode_png(&image, Some(&parameters))
    }

    /// One throwaway single-step generation to force lazy allocations before
    /// the first real request. The output is discarded.
    fn warmup(&self) {
        info!("warming up the model with an empty run (--no-warmup to disable)");

        let mut wparams = self.params.sampling.clone();
        wparams.sampling_steps = Some(1);
        wparams.sample_method = Some(SampleMethod::Euler);
        wparams.schedule_method = ScheduleMethod::Discrete;

        match self.generate("a lovely cat", &wparams, None) {
            Ok(mut stream) => {
                while self.sample(&mut stream) {}
                let _ = self.result(&stream);
            }
            Err(err) => warn!(%err, "warm-up generation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::backend::PixelBuffer;

    struct MockCursor {
        steps_done: usize,
        steps_total: usize,
        stats: Arc<ExecStats>,
    }

    impl SamplingCursor for MockCursor {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Drop for MockCursor {
        fn drop(&mut self) {
            self.stats.cursor_drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Shared between a factory and the executors it hands out, so tests can
    /// observe what the context did with them.
    #[derive(Default)]
    struct ExecStats {
        requests: Mutex<Vec<StreamRequest>>,
        applied_loras: Mutex<Vec<Vec<LoraAdapter>>>,
        cursor_drops: AtomicUsize,
        executor_drops: AtomicUsize,
    }

    struct MockExecutor {
        version: ModelVersion,
        stats: Arc<ExecStats>,
    }

    impl Drop for MockExecutor {
        fn drop(&mut self) {
            self.stats.executor_drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cursor_of(cursor: &dyn SamplingCursor) -> &MockCursor {
        cursor.as_any().downcast_ref().unwrap()
    }

    impl DiffusionExecutor for MockExecutor {
        fn version(&self) -> ModelVersion {
            self.version
        }

        fn begin_stream(
            &self,
            request: StreamRequest,
            images: Option<InitImages>,
        ) -> Result<Box<dyn SamplingCursor>, BackendError> {
            if let Some(images) = &images {
                if images.init.is_empty() {
                    return Err(BackendError::Rejected("zero-sized init image".into()));
                }
            }
            let steps_total = request.sampling_steps as usize;
            self.stats.requests.lock().unwrap().push(request);
            Ok(Box::new(MockCursor {
                steps_done: 0,
                steps_total,
                stats: Arc::clone(&self.stats),
            }))
        }

        fn sample(&self, cursor: &mut dyn SamplingCursor) -> bool {
            let cursor: &mut MockCursor = cursor.as_any_mut().downcast_mut().unwrap();
            cursor.steps_done += 1;
            cursor.steps_done < cursor.steps_total
        }

        fn progress(&self, cursor: &dyn SamplingCursor) -> (usize, usize) {
            let cursor = cursor_of(cursor);
            (cursor.steps_done, cursor.steps_total)
        }

        fn preview(&self, cursor: &dyn SamplingCursor, _faster: bool) -> Option<PixelBuffer> {
            if cursor_of(cursor).steps_done == 0 {
                return None;
            }
            Some(PixelBuffer::new(2, 2, 3, vec![1; 12]))
        }

        fn result(&self, cursor: &dyn SamplingCursor) -> Option<PixelBuffer> {
            let cursor = cursor_of(cursor);
            if cursor.steps_done < cursor.steps_total {
                return None;
            }
            Some(PixelBuffer::new(4, 4, 3, vec![2; 48]))
        }

        fn parameters_text(&self, _cursor: &dyn SamplingCursor) -> String {
            "steps: 3, seed: 7".to_string()
        }

        fn apply_lora_adapters(&self, adapters: &[LoraAdapter]) -> Result<(), BackendError> {
            self.stats
                .applied_loras
                .lock()
                .unwrap()
                .push(adapters.to_vec());
            Ok(())
        }
    }

    /// Doubles edge lengths for `passes_before_failure` passes, then fails.
    struct MockUpscaler {
        passes_before_failure: usize,
        passes: AtomicUsize,
    }

    impl Upscaler for MockUpscaler {
        fn upscale(&self, image: &PixelBuffer, _factor: u32) -> Option<PixelBuffer> {
            if self.passes.fetch_add(1, Ordering::SeqCst) >= self.passes_before_failure {
                return None;
            }
            let (width, height) = (image.width * 2, image.height * 2);
            Some(PixelBuffer::new(
                width,
                height,
                image.channels,
                vec![3; (width * height * image.channels as u32) as usize],
            ))
        }
    }

    struct MockFactory {
        version: ModelVersion,
        stats: Arc<ExecStats>,
        upscaler_passes: usize,
        fail_upscaler: bool,
    }

    impl MockFactory {
        fn new() -> Self {
            Self::with_version(ModelVersion::Sd1)
        }

        fn with_version(version: ModelVersion) -> Self {
            Self {
                version,
                stats: Arc::new(ExecStats::default()),
                upscaler_passes: usize::MAX,
                fail_upscaler: false,
            }
        }
    }

    impl DiffusionFactory for MockFactory {
        fn new_executor(
            &self,
            _params: &DiffusionParams,
        ) -> Result<Box<dyn DiffusionExecutor>, BackendError> {
            Ok(Box::new(MockExecutor {
                version: self.version,
                stats: Arc::clone(&self.stats),
            }))
        }

        fn new_upscaler(
            &self,
            _model_path: &str,
            _n_threads: i32,
            _tensor_split: &[f32],
        ) -> Result<Box<dyn Upscaler>, BackendError> {
            if self.fail_upscaler {
                return Err(BackendError::Construct("upscaler model unreadable".into()));
            }
            Ok(Box::new(MockUpscaler {
                passes_before_failure: self.upscaler_passes,
                passes: AtomicUsize::new(0),
            }))
        }
    }

    fn quiet_params() -> DiffusionParams {
        DiffusionParams {
            warmup: false,
            ..DiffusionParams::default()
        }
    }

    fn steps(n: i32) -> DiffusionSamplingParams {
        DiffusionSamplingParams {
            sampling_steps: Some(n),
            ..DiffusionSamplingParams::default()
        }
    }

    #[test]
    fn stream_runs_to_completion_and_yields_bytes() {
        let context = DiffusionContext::new(&MockFactory::new(), quiet_params()).unwrap();
        let mut stream = context.generate("a pond", &steps(3), None).unwrap();

        // result before completion reads as absent.
        assert!(context.result(&stream).is_none());
        assert_eq!(context.progress(&stream), (0, 3));

        let mut rounds = 0;
        while context.sample(&mut stream) {
            rounds += 1;
        }
        assert_eq!(rounds + 1, 3);
        assert_eq!(context.progress(&stream), (3, 3));

        let bytes = context.result(&stream).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn closing_twice_releases_the_cursor_once() {
        let factory = MockFactory::new();
        let stats = Arc::clone(&factory.stats);
        let context = DiffusionContext::new(&factory, quiet_params()).unwrap();

        let mut stream = context.generate("a pond", &steps(2), None).unwrap();
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(!context.sample(&mut stream));
        assert_eq!(context.progress(&stream), (0, 1));
        assert!(context.result(&stream).is_none());
        assert_eq!(stats.cursor_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_parameters_yield_no_stream() {
        let context = DiffusionContext::new(&MockFactory::new(), quiet_params()).unwrap();
        let images = InitImages {
            init: PixelBuffer::new(0, 0, 3, Vec::new()),
            mask: None,
            control: None,
        };
        assert!(matches!(
            context.generate("a pond", &steps(2), Some(images)),
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn seed_sentinel_means_backend_chooses() {
        let context = DiffusionContext::new(&MockFactory::new(), quiet_params()).unwrap();

        let stream = context.generate("a pond", &steps(1), None).unwrap();
        assert_eq!(stream.request().seed, -1);

        let mut sparams = steps(1);
        sparams.seed = 7;
        let stream = context.generate("a pond", &sparams, None).unwrap();
        assert_eq!(stream.request().seed, 7);
    }

    #[test]
    fn unset_fields_fall_back_to_version_defaults() {
        let context = DiffusionContext::new(
            &MockFactory::with_version(ModelVersion::FluxFill),
            quiet_params(),
        )
        .unwrap();

        let stream = context
            .generate("a pond", &DiffusionSamplingParams::default(), None)
            .unwrap();
        assert_eq!(stream.request().strength, 1.0);
        assert_eq!(stream.request().sampling_steps, 50);
        assert_eq!(stream.request().cfg_scale, 3.5);

        let mut sparams = DiffusionSamplingParams::default();
        sparams.strength = Some(0.3);
        let stream = context.generate("a pond", &sparams, None).unwrap();
        assert_eq!(stream.request().strength, 0.3);
    }

    #[test]
    fn upscale_chain_runs_repeat_count_passes() {
        let mut factory = MockFactory::new();
        factory.upscaler_passes = usize::MAX;
        let mut params = quiet_params();
        params.upscale_model = "upscaler.gguf".to_string();
        params.upscale_repeats = 2;
        let context = DiffusionContext::new(&factory, params).unwrap();

        let mut stream = context.generate("a pond", &steps(1), None).unwrap();
        while context.sample(&mut stream) {}
        let bytes = context.result(&stream).unwrap();
        // 4x4 doubled twice: 16x16.
        let decoded = crate::decode_rgb(&bytes).unwrap();
        assert_eq!((decoded.width, decoded.height), (16, 16));
    }

    #[test]
    fn failed_upscale_pass_keeps_the_last_good_image() {
        let mut factory = MockFactory::new();
        factory.upscaler_passes = 1;
        let mut params = quiet_params();
        params.upscale_model = "upscaler.gguf".to_string();
        params.upscale_repeats = 2;
        let context = DiffusionContext::new(&factory, params).unwrap();

        let mut stream = context.generate("a pond", &steps(1), None).unwrap();
        while context.sample(&mut stream) {}
        let decoded = crate::decode_rgb(&context.result(&stream).unwrap()).unwrap();
        // Second pass failed, first pass (4x4 -> 8x8) survives.
        assert_eq!((decoded.width, decoded.height), (8, 8));
    }

    #[test]
    fn upscaler_failure_releases_the_diffusion_context() {
        let mut factory = MockFactory::new();
        factory.fail_upscaler = true;
        let mut params = quiet_params();
        params.upscale_model = "upscaler.gguf".to_string();

        assert!(DiffusionContext::new(&factory, params).is_err());
        assert_eq!(factory.stats.executor_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_only_on_the_final_result() {
        let context = DiffusionContext::new(&MockFactory::new(), quiet_params()).unwrap();
        let mut stream = context.generate("a pond", &steps(2), None).unwrap();

        context.sample(&mut stream);
        let preview = context.preview(&stream, false).unwrap();
        assert!(!contains(&preview, b"parameters"));

        while context.sample(&mut stream) {}
        let result = context.result(&stream).unwrap();
        assert!(contains(&result, b"parameters"));
        assert!(contains(&result, b"steps: 3, seed: 7"));
    }

    #[test]
    fn preview_is_empty_before_the_first_step() {
        let context = DiffusionContext::new(&MockFactory::new(), quiet_params()).unwrap();
        let mut stream = context.generate("a pond", &steps(2), None).unwrap();
        assert!(context.preview(&stream, true).is_none());
        context.sample(&mut stream);
        assert!(context.preview(&stream, true).is_some());
    }

    #[test]
    fn warmup_runs_one_single_step_stream() {
        let factory = MockFactory::new();
        let mut params = quiet_params();
        params.warmup = true;
        let _context = DiffusionContext::new(&factory, params).unwrap();

        let requests = factory.stats.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sampling_steps, 1);
        assert_eq!(requests[0].sample_method, SampleMethod::Euler);
    }

    #[test]
    fn lora_adapters_apply_at_construction_unless_deferred() {
        let adapters = vec![LoraAdapter {
            path: "style.safetensors".to_string(),
            scale: 0.8,
        }];

        let factory = MockFactory::new();
        let mut params = quiet_params();
        params.lora_adapters = adapters.clone();
        let _context = DiffusionContext::new(&factory, params).unwrap();
        assert_eq!(factory.stats.applied_loras.lock().unwrap().len(), 1);

        let factory = MockFactory::new();
        let mut params = quiet_params();
        params.lora_adapters = adapters.clone();
        params.lora_init_without_apply = true;
        let mut context = DiffusionContext::new(&factory, params).unwrap();
        assert!(factory.stats.applied_loras.lock().unwrap().is_empty());

        // explicit apply later.
        context.apply_lora_adapters(&adapters).unwrap();
        assert_eq!(factory.stats.applied_loras.lock().unwrap().len(), 1);
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
