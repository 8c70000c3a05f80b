use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::config::{
    CacheType, ControlVector, CpuMask, KilnParams, KvOverride, KvOverrideValue, LoraAdapter,
    SampleMethod, ScheduleMethod, SplitMode, LOOKUP_NGRAM_MAX, MAX_DEVICES,
};

/// Configuration-resolution failures. Unknown flags are not errors, they are
/// warned and skipped; a malformed or out-of-range value for a recognized
/// flag aborts resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing value for argument {0}")]
    MissingValue(&'static str),
    #[error("invalid value for argument {flag}: {reason}")]
    InvalidValue { flag: &'static str, reason: String },
    #[error("invalid value for environment variable {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },
}

/// Turns a token list plus the process environment into a [`KilnParams`].
///
/// Precedence is a per-field three-tier chain: an explicit flag wins over its
/// environment variable, which wins over the built-in default. The ledger of
/// flag-set fields and the clear-once state of list-valued flags live on the
/// resolver and reset at the start of every resolution, so resolving the same
/// tokens twice yields the same model.
#[derive(Debug, Default)]
pub struct Resolver {
    set: BTreeSet<&'static str>,
    breakers_cleared: bool,
    skip_layers_cleared: bool,
}

impl Resolver {
    /// Resolves against the real process environment.
    pub fn resolve(&mut self, args: &[String]) -> Result<KilnParams, ConfigError> {
        self.resolve_with_env(args, |name| std::env::var(name).ok())
    }

    /// Resolves against an injected environment lookup.
    pub fn resolve_with_env<F>(&mut self, args: &[String], env: F) -> Result<KilnParams, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.set.clear();
        self.breakers_cleared = false;
        self.skip_layers_cleared = false;

        let mut params = KilnParams::default();
        self.apply_args(&mut params, args)?;
        self.apply_env(&mut params, &env)?;
        propagate(&mut params);
        Ok(params)
    }

    fn mark(&mut self, key: &'static str) {
        self.set.insert(key);
    }

    fn flag_set(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    #[allow(clippy::too_many_lines)]
    fn apply_args(&mut self, params: &mut KilnParams, args: &[String]) -> Result<(), ConfigError> {
        let mut it = args.iter();
        while let Some(flag) = it.next() {
            match flag.as_str() {
                // general
                "-v" | "--verbose" | "--log-verbose" => {
                    params.text.verbosity = i32::MAX;
                    self.mark("--verbosity");
                }
                "-lv" | "--verbosity" | "--log-verbosity" => {
                    params.text.verbosity = parse(value(&mut it, "--verbosity")?, "--verbosity")?;
                    self.mark("--verbosity");
                }

                // server
                "--host" => {
                    params.text.hostname = value(&mut it, "--host")?.to_string();
                    self.mark("--host");
                }
                "--port" => {
                    params.text.port = parse(value(&mut it, "--port")?, "--port")?;
                    self.mark("--port");
                }
                "-to" | "--timeout" => {
                    let timeout = parse(value(&mut it, "--timeout")?, "--timeout")?;
                    params.text.timeout_read = timeout;
                    params.text.timeout_write = timeout;
                }
                "--threads-http" => {
                    params.text.n_threads_http =
                        parse(value(&mut it, "--threads-http")?, "--threads-http")?;
                    self.mark("--threads-http");
                }
                "--conn-idle" => {
                    params.conn_idle = parse(value(&mut it, "--conn-idle")?, "--conn-idle")?;
                }
                "--conn-keepalive" => {
                    params.conn_keepalive =
                        parse(value(&mut it, "--conn-keepalive")?, "--conn-keepalive")?;
                }
                "-m" | "--model" => {
                    params.text.model = value(&mut it, "--model")?.to_string();
                    self.mark("--model");
                }
                "-a" | "--alias" => {
                    params.text.model_alias = value(&mut it, "--alias")?.to_string();
                    self.mark("--alias");
                }
                "--lora" => {
                    let path = value(&mut it, "--lora")?.to_string();
                    params.text.lora_adapters.push(LoraAdapter { path, scale: 1.0 });
                }
                "--lora-scaled" => {
                    let path = value(&mut it, "--lora-scaled")?.to_string();
                    let scale = parse(value(&mut it, "--lora-scaled")?, "--lora-scaled")?;
                    params.text.lora_adapters.push(LoraAdapter { path, scale });
                }
                "--lora-init-without-apply" => {
                    params.text.lora_init_without_apply = true;
                }
                "-s" | "--seed" => {
                    params.text.sampling.seed = parse(value(&mut it, "--seed")?, "--seed")?;
                }
                "-fa" | "--flash-attn" => {
                    params.text.flash_attn = true;
                    self.mark("--flash-attn");
                }
                "--images" => {
                    params.endpoint_images = true;
                }
                "--rpc" => {
                    params.text.rpc_servers = value(&mut it, "--rpc")?.to_string();
                }
                "-ts" | "--tensor-split" => {
                    params.text.tensor_split =
                        parse_tensor_split(value(&mut it, "--tensor-split")?, "--tensor-split")?;
                }
                "-ngl" | "--gpu-layers" | "--n-gpu-layers" => {
                    params.text.n_gpu_layers =
                        parse(value(&mut it, "--gpu-layers")?, "--gpu-layers")?;
                    self.mark("--gpu-layers");
                }
                "--warmup" => {
                    params.text.warmup = true;
                }
                "--no-warmup" => {
                    params.text.warmup = false;
                }

                // completion
                "-dev" | "--device" => {
                    params.text.devices = Some(parse_device_list(value(&mut it, "--device")?));
                    self.mark("--device");
                }
                "-sm" | "--split-mode" => {
                    params.text.split_mode =
                        parse_plain::<SplitMode>(value(&mut it, "--split-mode")?, "--split-mode")?;
                }
                "-mg" | "--main-gpu" => {
                    let main_gpu: i32 = parse(value(&mut it, "--main-gpu")?, "--main-gpu")?;
                    if main_gpu < 0 || main_gpu as usize >= MAX_DEVICES {
                        return Err(invalid("--main-gpu", "device index out of range"));
                    }
                    params.text.main_gpu = main_gpu;
                }
                "--override-kv" => {
                    let override_kv =
                        parse_kv_override(value(&mut it, "--override-kv")?, "--override-kv")?;
                    params.text.kv_overrides.push(override_kv);
                }
                "-tps" | "--tokens-per-second" => {
                    params.n_tps =
                        parse(value(&mut it, "--tokens-per-second")?, "--tokens-per-second")?;
                }
                "-t" | "--threads" => {
                    params.text.cpuparams.n_threads =
                        parse(value(&mut it, "--threads")?, "--threads")?;
                    self.mark("--threads");
                }
                "-C" | "--cpu-mask" => {
                    params.text.cpuparams.mask =
                        Some(CpuMask::Hex(value(&mut it, "--cpu-mask")?.to_string()));
                }
                "-Cr" | "--cpu-range" => {
                    params.text.cpuparams.mask =
                        Some(parse_cpu_range(value(&mut it, "--cpu-range")?, "--cpu-range")?);
                }
                "--cpu-strict" => {
                    params.text.cpuparams.strict_cpu =
                        parse_bool01(value(&mut it, "--cpu-strict")?, "--cpu-strict")?;
                }
                "--prio" => {
                    params.text.cpuparams.priority =
                        parse_ranged(value(&mut it, "--prio")?, "--prio", -1, 3)?;
                }
                "--poll" => {
                    params.text.cpuparams.poll =
                        parse_ranged(value(&mut it, "--poll")?, "--poll", 0, 100)?;
                }
                "-tb" | "--threads-batch" => {
                    params.text.cpuparams_batch.n_threads =
                        parse(value(&mut it, "--threads-batch")?, "--threads-batch")?;
                    self.mark("--threads-batch");
                }
                "-Cb" | "--cpu-mask-batch" => {
                    params.text.cpuparams_batch.mask =
                        Some(CpuMask::Hex(value(&mut it, "--cpu-mask-batch")?.to_string()));
                    self.mark("--cpu-mask-batch");
                }
                "-Crb" | "--cpu-range-batch" => {
                    params.text.cpuparams_batch.mask = Some(parse_cpu_range(
                        value(&mut it, "--cpu-range-batch")?,
                        "--cpu-range-batch",
                    )?);
                    self.mark("--cpu-range-batch");
                }
                "--cpu-strict-batch" => {
                    params.text.cpuparams_batch.strict_cpu =
                        parse_bool01(value(&mut it, "--cpu-strict-batch")?, "--cpu-strict-batch")?;
                    self.mark("--cpu-strict-batch");
                }
                "--prio-batch" => {
                    params.text.cpuparams_batch.priority =
                        parse_ranged(value(&mut it, "--prio-batch")?, "--prio-batch", -1, 3)?;
                    self.mark("--prio-batch");
                }
                "--poll-batch" => {
                    params.text.cpuparams_batch.poll =
                        parse_ranged(value(&mut it, "--poll-batch")?, "--poll-batch", 0, 100)?;
                    self.mark("--poll-batch");
                }
                "-c" | "--ctx-size" => {
                    params.text.n_ctx = parse(value(&mut it, "--ctx-size")?, "--ctx-size")?;
                    self.mark("--ctx-size");
                }
                "--no-context-shift" => {
                    params.text.ctx_shift = false;
                }
                "-n" | "--predict" => {
                    params.text.n_predict = parse(value(&mut it, "--predict")?, "--predict")?;
                    self.mark("--predict");
                }
                "-b" | "--batch-size" => {
                    params.text.n_batch = parse(value(&mut it, "--batch-size")?, "--batch-size")?;
                    self.mark("--batch-size");
                }
                "-ub" | "--ubatch-size" => {
                    params.text.n_ubatch =
                        parse(value(&mut it, "--ubatch-size")?, "--ubatch-size")?;
                    self.mark("--ubatch-size");
                }
                "--keep" => {
                    params.text.n_keep = parse(value(&mut it, "--keep")?, "--keep")?;
                }

                // sampling
                "--temp" => {
                    let temp: f32 = parse(value(&mut it, "--temp")?, "--temp")?;
                    params.text.sampling.temp = temp.max(0.0);
                }
                "--top-k" => {
                    params.text.sampling.top_k = parse(value(&mut it, "--top-k")?, "--top-k")?;
                }
                "--top-p" => {
                    params.text.sampling.top_p = parse(value(&mut it, "--top-p")?, "--top-p")?;
                }
                "--min-p" => {
                    params.text.sampling.min_p = parse(value(&mut it, "--min-p")?, "--min-p")?;
                }
                "--xtc-probability" => {
                    params.text.sampling.xtc_probability =
                        parse(value(&mut it, "--xtc-probability")?, "--xtc-probability")?;
                }
                "--xtc-threshold" => {
                    params.text.sampling.xtc_threshold =
                        parse(value(&mut it, "--xtc-threshold")?, "--xtc-threshold")?;
                }
                "--typical" => {
                    params.text.sampling.typ_p = parse(value(&mut it, "--typical")?, "--typical")?;
                }
                "--repeat-last-n" => {
                    let last_n: i32 = parse(value(&mut it, "--repeat-last-n")?, "--repeat-last-n")?;
                    if last_n < -1 {
                        return Err(invalid("--repeat-last-n", "expected a value >= -1"));
                    }
                    params.text.sampling.penalty_last_n = last_n;
                    params.text.sampling.n_prev = params.text.sampling.n_prev.max(last_n);
                }
                "--repeat-penalty" => {
                    params.text.sampling.penalty_repeat =
                        parse(value(&mut it, "--repeat-penalty")?, "--repeat-penalty")?;
                }
                "--presence-penalty" => {
                    params.text.sampling.penalty_present =
                        parse(value(&mut it, "--presence-penalty")?, "--presence-penalty")?;
                }
                "--frequency-penalty" => {
                    params.text.sampling.penalty_freq =
                        parse(value(&mut it, "--frequency-penalty")?, "--frequency-penalty")?;
                }
                "--dry-multiplier" => {
                    params.text.sampling.dry_multiplier =
                        parse(value(&mut it, "--dry-multiplier")?, "--dry-multiplier")?;
                }
                "--dry-base" => {
                    let dry_base: f32 = parse(value(&mut it, "--dry-base")?, "--dry-base")?;
                    if dry_base >= 1.0 {
                        params.text.sampling.dry_base = dry_base;
                    }
                }
                "--dry-allowed-length" => {
                    params.text.sampling.dry_allowed_length =
                        parse(value(&mut it, "--dry-allowed-length")?, "--dry-allowed-length")?;
                }
                "--dry-penalty-last-n" => {
                    let last_n: i32 =
                        parse(value(&mut it, "--dry-penalty-last-n")?, "--dry-penalty-last-n")?;
                    if last_n < -1 {
                        return Err(invalid("--dry-penalty-last-n", "expected a value >= -1"));
                    }
                    params.text.sampling.dry_penalty_last_n = last_n;
                }
                "--dry-sequence-breaker" => {
                    if !self.breakers_cleared {
                        params.text.sampling.dry_sequence_breakers.clear();
                        self.breakers_cleared = true;
                    }
                    let breaker = value(&mut it, "--dry-sequence-breaker")?;
                    if breaker != "none" {
                        params
                            .text
                            .sampling
                            .dry_sequence_breakers
                            .push(breaker.to_string());
                    }
                }
                "--dynatemp-range" => {
                    params.text.sampling.dynatemp_range =
                        parse(value(&mut it, "--dynatemp-range")?, "--dynatemp-range")?;
                }
                "--dynatemp-exp" => {
                    params.text.sampling.dynatemp_exponent =
                        parse(value(&mut it, "--dynatemp-exp")?, "--dynatemp-exp")?;
                }
                "--mirostat" => {
                    params.text.sampling.mirostat =
                        parse(value(&mut it, "--mirostat")?, "--mirostat")?;
                }
                "--mirostat-lr" => {
                    params.text.sampling.mirostat_eta =
                        parse(value(&mut it, "--mirostat-lr")?, "--mirostat-lr")?;
                }
                "--mirostat-ent" => {
                    params.text.sampling.mirostat_tau =
                        parse(value(&mut it, "--mirostat-ent")?, "--mirostat-ent")?;
                }

                // kv cache & batching
                "-nkvo" | "--no-kv-offload" => {
                    params.text.no_kv_offload = true;
                }
                "--no-cache-prompt" => {
                    params.cache_prompt = false;
                    self.mark("--cache-prompt");
                }
                "--cache-reuse" => {
                    params.text.n_cache_reuse =
                        parse(value(&mut it, "--cache-reuse")?, "--cache-reuse")?;
                    if params.text.n_cache_reuse > 0 {
                        params.cache_prompt = true;
                        self.mark("--cache-prompt");
                    }
                    self.mark("--cache-reuse");
                }
                "-ctk" | "--cache-type-k" => {
                    params.text.cache_type_k =
                        parse_plain::<CacheType>(value(&mut it, "--cache-type-k")?, "--cache-type-k")?;
                }
                "-ctv" | "--cache-type-v" => {
                    params.text.cache_type_v =
                        parse_plain::<CacheType>(value(&mut it, "--cache-type-v")?, "--cache-type-v")?;
                }
                "-dt" | "--defrag-thold" => {
                    params.text.defrag_thold =
                        parse(value(&mut it, "--defrag-thold")?, "--defrag-thold")?;
                    self.mark("--defrag-thold");
                }
                "-np" | "--parallel" => {
                    let n_parallel: i32 = parse(value(&mut it, "--parallel")?, "--parallel")?;
                    if n_parallel < 1 {
                        return Err(invalid("--parallel", "expected a value >= 1"));
                    }
                    params.text.n_parallel = n_parallel;
                    self.mark("--parallel");
                }
                "-nocb" | "--no-cont-batching" => {
                    params.text.cont_batching = false;
                    self.mark("--cont-batching");
                }
                "--control-vector" => {
                    let path = value(&mut it, "--control-vector")?.to_string();
                    params.text.control_vectors.push(ControlVector { path, scale: 1.0 });
                }
                "--control-vector-scaled" => {
                    let path = value(&mut it, "--control-vector-scaled")?.to_string();
                    let scale =
                        parse(value(&mut it, "--control-vector-scaled")?, "--control-vector-scaled")?;
                    params.text.control_vectors.push(ControlVector { path, scale });
                }
                "--control-vector-layer-range" => {
                    params.text.control_vector_layer_start = parse(
                        value(&mut it, "--control-vector-layer-range")?,
                        "--control-vector-layer-range",
                    )?;
                    params.text.control_vector_layer_end = parse(
                        value(&mut it, "--control-vector-layer-range")?,
                        "--control-vector-layer-range",
                    )?;
                }

                // speculative
                "--draft" | "--draft-max" | "--draft-n" => {
                    params.text.speculative.n_max =
                        parse(value(&mut it, "--draft-max")?, "--draft-max")?;
                    self.mark("--draft-max");
                }
                "--draft-min" | "--draft-n-min" => {
                    params.text.speculative.n_min =
                        parse(value(&mut it, "--draft-min")?, "--draft-min")?;
                    self.mark("--draft-min");
                }
                "--draft-p-min" => {
                    params.text.speculative.p_min =
                        parse(value(&mut it, "--draft-p-min")?, "--draft-p-min")?;
                    self.mark("--draft-p-min");
                }
                "-md" | "--model-draft" => {
                    params.text.speculative.model = value(&mut it, "--model-draft")?.to_string();
                    self.mark("--model-draft");
                }
                "-devd" | "--device-draft" => {
                    params.text.speculative.devices =
                        Some(parse_device_list(value(&mut it, "--device-draft")?));
                    self.mark("--device-draft");
                }
                "-ngld" | "--gpu-layers-draft" | "--n-gpu-layers-draft" => {
                    params.text.speculative.n_gpu_layers =
                        parse(value(&mut it, "--gpu-layers-draft")?, "--gpu-layers-draft")?;
                    self.mark("--gpu-layers-draft");
                }
                "--lookup-ngram-min" => {
                    params.lookup_ngram_min = parse_ranged(
                        value(&mut it, "--lookup-ngram-min")?,
                        "--lookup-ngram-min",
                        1,
                        LOOKUP_NGRAM_MAX,
                    )?;
                    self.mark("--lookup-ngram-min");
                }
                "-lcs" | "--lookup-cache-static" => {
                    params.text.lookup_cache_static =
                        value(&mut it, "--lookup-cache-static")?.to_string();
                    self.mark("--lookup-cache-static");
                }
                "-lcd" | "--lookup-cache-dynamic" => {
                    params.text.lookup_cache_dynamic =
                        value(&mut it, "--lookup-cache-dynamic")?.to_string();
                    self.mark("--lookup-cache-dynamic");
                }

                // visual
                "--visual-max-image-size" => {
                    let size: i32 =
                        parse(value(&mut it, "--visual-max-image-size")?, "--visual-max-image-size")?;
                    if size != 0 && (size < 224 || size % 14 != 0) {
                        return Err(invalid(
                            "--visual-max-image-size",
                            "expected 0, or a multiple of 14 not below 224",
                        ));
                    }
                    params.max_image_size = size;
                }

                // images
                "--image-max-batch" => {
                    let batch: i32 = parse(value(&mut it, "--image-max-batch")?, "--image-max-batch")?;
                    if batch < 1 {
                        return Err(invalid("--image-max-batch", "expected a value >= 1"));
                    }
                    params.diffusion.max_batch_count = batch;
                }
                "--image-max-height" => {
                    params.diffusion.sampling.height =
                        parse_image_edge(value(&mut it, "--image-max-height")?, "--image-max-height")?;
                }
                "--image-max-width" => {
                    params.diffusion.sampling.width =
                        parse_image_edge(value(&mut it, "--image-max-width")?, "--image-max-width")?;
                }
                "--image-guidance" => {
                    let guidance: f32 = parse(value(&mut it, "--image-guidance")?, "--image-guidance")?;
                    if guidance < 1.0 {
                        return Err(invalid("--image-guidance", "expected a value >= 1.0"));
                    }
                    params.diffusion.sampling.guidance = guidance;
                }
                "--image-strength" => {
                    let strength: f32 = parse(value(&mut it, "--image-strength")?, "--image-strength")?;
                    if !(0.0..=1.0).contains(&strength) {
                        return Err(invalid("--image-strength", "expected a value in [0.0, 1.0]"));
                    }
                    params.diffusion.sampling.strength = Some(strength);
                }
                "--image-sample-method" | "--image-sampler" => {
                    params.diffusion.sampling.sample_method = Some(parse_plain::<SampleMethod>(
                        value(&mut it, "--image-sample-method")?,
                        "--image-sample-method",
                    )?);
                }
                "--image-sampling-steps" | "--image-sample-steps" => {
                    let steps: i32 =
                        parse(value(&mut it, "--image-sampling-steps")?, "--image-sampling-steps")?;
                    if steps < 1 {
                        return Err(invalid("--image-sampling-steps", "expected a value >= 1"));
                    }
                    params.diffusion.sampling.sampling_steps = Some(steps);
                }
                "--image-cfg-scale" => {
                    let cfg: f32 = parse(value(&mut it, "--image-cfg-scale")?, "--image-cfg-scale")?;
                    if cfg < 1.0 {
                        return Err(invalid("--image-cfg-scale", "expected a value >= 1.0"));
                    }
                    params.diffusion.sampling.cfg_scale = Some(cfg);
                }
                "--image-slg-scale" => {
                    let scale: f32 = parse(value(&mut it, "--image-slg-scale")?, "--image-slg-scale")?;
                    if scale < 0.0 {
                        return Err(invalid("--image-slg-scale", "expected a value >= 0.0"));
                    }
                    params.diffusion.sampling.slg_scale = scale;
                }
                "--image-skip-layer" | "--image-slg-skip-layer" => {
                    if !self.skip_layers_cleared {
                        params.diffusion.sampling.slg_skip_layers.clear();
                        self.skip_layers_cleared = true;
                    }
                    let layer: i32 = parse(value(&mut it, "--image-skip-layer")?, "--image-skip-layer")?;
                    if layer < 0 {
                        return Err(invalid("--image-skip-layer", "expected a value >= 0"));
                    }
                    params.diffusion.sampling.slg_skip_layers.push(layer);
                }
                "--image-slg-start" => {
                    let start: f32 = parse(value(&mut it, "--image-slg-start")?, "--image-slg-start")?;
                    if start < 0.0 {
                        return Err(invalid("--image-slg-start", "expected a value >= 0.0"));
                    }
                    params.diffusion.sampling.slg_start = start;
                }
                "--image-slg-end" => {
                    let end: f32 = parse(value(&mut it, "--image-slg-end")?, "--image-slg-end")?;
                    if end < 0.0 {
                        return Err(invalid("--image-slg-end", "expected a value >= 0.0"));
                    }
                    params.diffusion.sampling.slg_end = end;
                }
                "--image-schedule-method" | "--image-schedule" => {
                    params.diffusion.sampling.schedule_method = parse_plain::<ScheduleMethod>(
                        value(&mut it, "--image-schedule-method")?,
                        "--image-schedule-method",
                    )?;
                }
                "--image-no-text-encoder-model-offload" => {
                    params.diffusion.text_encoder_model_offload = false;
                }
                "--image-clip-l-model" => {
                    params.diffusion.clip_l_model =
                        value(&mut it, "--image-clip-l-model")?.to_string();
                }
                "--image-clip-g-model" => {
                    params.diffusion.clip_g_model =
                        value(&mut it, "--image-clip-g-model")?.to_string();
                }
                "--image-t5xxl-model" => {
                    params.diffusion.t5xxl_model = value(&mut it, "--image-t5xxl-model")?.to_string();
                }
                "--image-no-vae-model-offload" => {
                    params.diffusion.vae_model_offload = false;
                }
                "--image-vae-model" => {
                    params.diffusion.vae_model = value(&mut it, "--image-vae-model")?.to_string();
                }
                "--image-vae-tiling" => {
                    params.diffusion.vae_tiling = true;
                }
                "--image-no-vae-tiling" => {
                    params.diffusion.vae_tiling = false;
                }
                "--image-taesd-model" => {
                    params.diffusion.taesd_model = value(&mut it, "--image-taesd-model")?.to_string();
                }
                "--image-upscale-model" => {
                    params.diffusion.upscale_model =
                        value(&mut it, "--image-upscale-model")?.to_string();
                }
                "--image-upscale-repeats" => {
                    let repeats: i32 =
                        parse(value(&mut it, "--image-upscale-repeats")?, "--image-upscale-repeats")?;
                    if repeats < 1 {
                        return Err(invalid("--image-upscale-repeats", "expected a value >= 1"));
                    }
                    params.diffusion.upscale_repeats = repeats;
                }
                "--image-no-control-net-model-offload" => {
                    params.diffusion.control_model_offload = false;
                }
                "--image-control-net-model" => {
                    params.diffusion.control_net_model =
                        value(&mut it, "--image-control-net-model")?.to_string();
                }
                "--image-control-strength" => {
                    let strength: f32 =
                        parse(value(&mut it, "--image-control-strength")?, "--image-control-strength")?;
                    if !(0.0..=1.0).contains(&strength) {
                        return Err(invalid(
                            "--image-control-strength",
                            "expected a value in [0.0, 1.0]",
                        ));
                    }
                    params.diffusion.sampling.control_strength = strength;
                }
                "--image-control-canny" => {
                    params.diffusion.sampling.control_canny = true;
                }
                "--image-free-compute-memory-immediately" => {
                    params.diffusion.free_compute_immediately = true;
                }

                // rpc server
                "--rpc-server-host" => {
                    params.rpc.hostname = value(&mut it, "--rpc-server-host")?.to_string();
                    self.mark("--rpc-server-host");
                }
                "--rpc-server-port" => {
                    params.rpc.port = parse(value(&mut it, "--rpc-server-port")?, "--rpc-server-port")?;
                    self.mark("--rpc-server-port");
                }
                "--rpc-server-main-gpu" => {
                    let main_gpu: i32 =
                        parse(value(&mut it, "--rpc-server-main-gpu")?, "--rpc-server-main-gpu")?;
                    if main_gpu < -1 || main_gpu as usize >= MAX_DEVICES {
                        return Err(invalid("--rpc-server-main-gpu", "device index out of range"));
                    }
                    params.rpc.main_gpu = main_gpu;
                }
                "--rpc-server-reserve-memory" => {
                    params.rpc.reserve_memory = parse(
                        value(&mut it, "--rpc-server-reserve-memory")?,
                        "--rpc-server-reserve-memory",
                    )?;
                }

                unknown => {
                    warn!(flag = unknown, "unrecognized argument, skipping");
                }
            }
        }
        Ok(())
    }

    fn apply_env<F>(&self, params: &mut KilnParams, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &'static str, name: &'static str| -> Option<(String, &'static str)> {
            if self.flag_set(key) {
                return None;
            }
            env(name).map(|raw| (raw, name))
        };

        if let Some((raw, _)) = lookup("--model", "KILN_ARG_MODEL") {
            params.text.model = raw;
        }
        if let Some((raw, _)) = lookup("--alias", "KILN_ARG_MODEL_ALIAS") {
            params.text.model_alias = raw;
        }
        if let Some((raw, name)) = lookup("--threads", "KILN_ARG_THREADS") {
            params.text.cpuparams.n_threads = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--ctx-size", "KILN_ARG_CTX_SIZE") {
            params.text.n_ctx = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--parallel", "KILN_ARG_N_PARALLEL") {
            params.text.n_parallel = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--batch-size", "KILN_ARG_BATCH") {
            params.text.n_batch = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--ubatch-size", "KILN_ARG_UBATCH") {
            params.text.n_ubatch = env_parse(&raw, name)?;
        }
        if let Some((raw, _)) = lookup("--device", "KILN_ARG_DEVICE") {
            params.text.devices = Some(parse_device_list(&raw));
        }
        if let Some((raw, name)) = lookup("--gpu-layers", "KILN_ARG_N_GPU_LAYERS") {
            params.text.n_gpu_layers = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--threads-http", "KILN_ARG_THREADS_HTTP") {
            params.text.n_threads_http = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--cache-prompt", "KILN_ARG_CACHE_PROMPT") {
            params.cache_prompt = env_bool(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--cache-reuse", "KILN_ARG_CACHE_REUSE") {
            params.text.n_cache_reuse = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--predict", "KILN_ARG_N_PREDICT") {
            params.text.n_predict = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--flash-attn", "KILN_ARG_FLASH_ATTN") {
            params.text.flash_attn = env_bool(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--defrag-thold", "KILN_ARG_DEFRAG_THOLD") {
            params.text.defrag_thold = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--cont-batching", "KILN_ARG_CONT_BATCHING") {
            params.text.cont_batching = env_bool(&raw, name)?;
        }
        if let Some((raw, _)) = lookup("--host", "KILN_ARG_HOST") {
            params.text.hostname = raw;
        }
        if let Some((raw, name)) = lookup("--port", "KILN_ARG_PORT") {
            params.text.port = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--draft-max", "KILN_ARG_DRAFT_MAX") {
            params.text.speculative.n_max = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--draft-min", "KILN_ARG_DRAFT_MIN") {
            params.text.speculative.n_min = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--draft-p-min", "KILN_ARG_DRAFT_P_MIN") {
            params.text.speculative.p_min = env_parse(&raw, name)?;
        }
        if let Some((raw, _)) = lookup("--model-draft", "KILN_ARG_MODEL_DRAFT") {
            params.text.speculative.model = raw;
        }
        if let Some((raw, _)) = lookup("--device-draft", "KILN_ARG_DEVICE_DRAFT") {
            params.text.speculative.devices = Some(parse_device_list(&raw));
        }
        if let Some((raw, name)) = lookup("--gpu-layers-draft", "KILN_ARG_N_GPU_LAYERS_DRAFT") {
            params.text.speculative.n_gpu_layers = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--lookup-ngram-min", "KILN_ARG_LOOKUP_NGRAM_MIN") {
            let ngram_min: i32 = env_parse(&raw, name)?;
            if !(1..=LOOKUP_NGRAM_MAX).contains(&ngram_min) {
                return Err(ConfigError::InvalidEnv {
                    name,
                    reason: format!("expected a value in [1, {LOOKUP_NGRAM_MAX}]"),
                });
            }
            params.lookup_ngram_min = ngram_min;
        }
        if let Some((raw, _)) = lookup("--lookup-cache-static", "KILN_ARG_LOOKUP_CACHE_STATIC") {
            params.text.lookup_cache_static = raw;
        }
        if let Some((raw, _)) = lookup("--lookup-cache-dynamic", "KILN_ARG_LOOKUP_CACHE_DYNAMIC") {
            params.text.lookup_cache_dynamic = raw;
        }
        if let Some((raw, _)) = lookup("--rpc-server-host", "KILN_ARG_RPC_SERVER_HOST") {
            params.rpc.hostname = raw;
        }
        if let Some((raw, name)) = lookup("--rpc-server-port", "KILN_ARG_RPC_SERVER_PORT") {
            params.rpc.port = env_parse(&raw, name)?;
        }
        if let Some((raw, name)) = lookup("--verbosity", "KILN_LOG_VERBOSITY") {
            params.text.verbosity = env_parse(&raw, name)?;
        }

        // batch CPU parameters inherit from the interactive ones unless the
        // corresponding batch flag was given.
        if !self.flag_set("--threads-batch") {
            params.text.cpuparams_batch.n_threads = params.text.cpuparams.n_threads;
        }
        if !self.flag_set("--cpu-mask-batch") && !self.flag_set("--cpu-range-batch") {
            params.text.cpuparams_batch.mask = params.text.cpuparams.mask.clone();
        }
        if !self.flag_set("--cpu-strict-batch") {
            params.text.cpuparams_batch.strict_cpu = params.text.cpuparams.strict_cpu;
        }
        if !self.flag_set("--prio-batch") {
            params.text.cpuparams_batch.priority = params.text.cpuparams.priority;
        }
        if !self.flag_set("--poll-batch") {
            params.text.cpuparams_batch.poll = params.text.cpuparams.poll;
        }

        Ok(())
    }
}

/// Cross-block derivations, applied last.
fn propagate(params: &mut KilnParams) {
    if params.text.cpuparams.n_threads <= 0 {
        params.text.cpuparams.n_threads = detected_threads();
    }
    if params.text.cpuparams_batch.n_threads <= 0 {
        params.text.cpuparams_batch.n_threads = detected_threads();
    }

    if params.text.speculative.devices.is_none() {
        params.text.speculative.devices = params.text.devices.clone();
    }

    if let Some(last) = params.text.kv_overrides.last() {
        if !last.is_sentinel() {
            params.text.kv_overrides.push(KvOverride::sentinel());
        }
    }

    // Adapters stay loaded but inert until an explicit apply call.
    if params.text.lora_init_without_apply {
        for adapter in &mut params.text.lora_adapters {
            adapter.scale = 0.0;
        }
    }

    if params.endpoint_images {
        params.diffusion.model = params.text.model.clone();
        params.diffusion.model_alias = params.text.model_alias.clone();
        params.diffusion.seed = params.text.sampling.seed;
        params.diffusion.sampling.seed = params.text.sampling.seed;
        params.diffusion.warmup = params.text.warmup;
        params.diffusion.flash_attn = params.text.flash_attn;
        params.diffusion.n_threads = params.text.cpuparams.n_threads;
        params.diffusion.lora_init_without_apply = params.text.lora_init_without_apply;
        params.diffusion.lora_adapters = params.text.lora_adapters.clone();
        params.diffusion.rpc_servers = params.text.rpc_servers.clone();
        params.diffusion.tensor_split = params.text.tensor_split.clone();
    }
}

fn detected_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

fn value<'a>(
    it: &mut std::slice::Iter<'a, String>,
    flag: &'static str,
) -> Result<&'a str, ConfigError> {
    it.next()
        .map(String::as_str)
        .ok_or(ConfigError::MissingValue(flag))
}

fn invalid(flag: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        flag,
        reason: reason.into(),
    }
}

fn parse<T>(raw: &str, flag: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|err| invalid(flag, format!("{err} ({raw:?})")))
}

/// serde_plain-backed enum spellings give an unhelpful FromStr error, so the
/// accepted token is echoed instead.
fn parse_plain<T>(raw: &str, flag: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    raw.parse()
        .map_err(|_| invalid(flag, format!("unknown value {raw:?}")))
}

fn parse_ranged<T>(raw: &str, flag: &'static str, lo: T, hi: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display,
    T::Err: Display,
{
    let parsed: T = parse(raw, flag)?;
    if parsed < lo || parsed > hi {
        return Err(invalid(flag, format!("expected a value in [{lo}, {hi}]")));
    }
    Ok(parsed)
}

fn parse_bool01(raw: &str, flag: &'static str) -> Result<bool, ConfigError> {
    match raw {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(invalid(flag, format!("expected 0 or 1, got {raw:?}"))),
    }
}

/// "none" means an explicit empty list; anything else is comma-separated.
fn parse_device_list(raw: &str) -> Vec<String> {
    if raw == "none" {
        return Vec::new();
    }
    raw.split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_tensor_split(raw: &str, flag: &'static str) -> Result<Vec<f32>, ConfigError> {
    let mut split = Vec::with_capacity(MAX_DEVICES);
    for part in raw.split([',', '/']) {
        if split.len() == MAX_DEVICES {
            return Err(invalid(flag, format!("at most {MAX_DEVICES} proportions")));
        }
        split.push(parse(part, flag)?);
    }
    split.resize(MAX_DEVICES, 0.0);
    Ok(split)
}

fn parse_cpu_range(raw: &str, flag: &'static str) -> Result<CpuMask, ConfigError> {
    let (lo, hi) = raw
        .split_once('-')
        .ok_or_else(|| invalid(flag, "expected LO-HI"))?;
    let lo: u32 = parse(lo, flag)?;
    let hi: u32 = parse(hi, flag)?;
    if lo > hi {
        return Err(invalid(flag, "range start exceeds range end"));
    }
    Ok(CpuMask::Range(lo, hi))
}

/// Image edges must be multiples of 64, no smaller than 256.
fn parse_image_edge(raw: &str, flag: &'static str) -> Result<i32, ConfigError> {
    let edge: i32 = parse(raw, flag)?;
    if edge < 256 || edge % 64 != 0 {
        return Err(invalid(flag, "expected a multiple of 64 not below 256"));
    }
    Ok(edge)
}

/// `KEY=TYPE:VALUE` with TYPE one of int, float, bool, str.
fn parse_kv_override(raw: &str, flag: &'static str) -> Result<KvOverride, ConfigError> {
    let (key, rest) = raw
        .split_once('=')
        .ok_or_else(|| invalid(flag, "expected KEY=TYPE:VALUE"))?;
    if key.is_empty() {
        return Err(invalid(flag, "empty override key"));
    }
    let (ty, val) = rest
        .split_once(':')
        .ok_or_else(|| invalid(flag, "expected KEY=TYPE:VALUE"))?;
    let value = match ty {
        "int" => KvOverrideValue::Int(parse(val, flag)?),
        "float" => KvOverrideValue::Float(parse(val, flag)?),
        "bool" => KvOverrideValue::Bool(match val {
            "true" => true,
            "false" => false,
            _ => return Err(invalid(flag, format!("expected a boolean, got {val:?}"))),
        }),
        "str" => KvOverrideValue::Str(val.to_string()),
        _ => return Err(invalid(flag, format!("unknown override type {ty:?}"))),
    };
    Ok(KvOverride {
        key: key.to_string(),
        value,
    })
}

fn env_parse<T>(raw: &str, name: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|err| ConfigError::InvalidEnv {
        name,
        reason: format!("{err} ({raw:?})"),
    })
}

fn env_bool(raw: &str, name: &'static str) -> Result<bool, ConfigError> {
    match raw {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            reason: format!("expected a boolean, got {raw:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn tokens(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    fn resolve(args: &[&str]) -> Result<KilnParams, ConfigError> {
        Resolver::default().resolve_with_env(&tokens(args), |_| None)
    }

    fn resolve_env(args: &[&str], env: &[(&str, &str)]) -> Result<KilnParams, ConfigError> {
        let map: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Resolver::default().resolve_with_env(&tokens(args), |name| map.get(name).cloned())
    }

    #[test]
    fn empty_token_list_keeps_defaults() {
        let params = resolve(&[]).unwrap();
        assert_eq!(params.text.port, 8080);
        assert_eq!(params.text.n_ctx, 4096);
        assert!(params.text.model.is_empty());
        assert!(!params.endpoint_images);
        // thread counts are normalized to the detected core count.
        assert!(params.text.cpuparams.n_threads > 0);
        assert_eq!(
            params.text.cpuparams_batch.n_threads,
            params.text.cpuparams.n_threads
        );
    }

    #[test]
    fn short_and_long_spellings_hit_the_same_field() {
        let short = resolve(&["-c", "1024"]).unwrap();
        let long = resolve(&["--ctx-size", "1024"]).unwrap();
        assert_eq!(short.text.n_ctx, 1024);
        assert_eq!(short.text.n_ctx, long.text.n_ctx);

        let short = resolve(&["-ngl", "33"]).unwrap();
        let long = resolve(&["--n-gpu-layers", "33"]).unwrap();
        assert_eq!(short.text.n_gpu_layers, long.text.n_gpu_layers);
    }

    #[test]
    fn unknown_flags_warn_but_do_not_abort() {
        let params = resolve(&["--no-such-flag", "-m", "weights.gguf"]).unwrap();
        assert_eq!(params.text.model, "weights.gguf");
    }

    #[test]
    fn missing_value_aborts() {
        assert!(matches!(
            resolve(&["-m"]),
            Err(ConfigError::MissingValue("--model"))
        ));
    }

    #[test]
    fn image_edge_must_be_a_multiple_of_64_at_least_256() {
        assert!(resolve(&["--image-max-height", "255"]).is_err());
        assert!(resolve(&["--image-max-height", "321"]).is_err());
        let params = resolve(&["--image-max-height", "320"]).unwrap();
        assert_eq!(params.diffusion.sampling.height, 320);
    }

    #[test]
    fn skip_layer_list_clears_once_then_appends() {
        let params =
            resolve(&["--image-skip-layer", "3", "--image-slg-skip-layer", "5"]).unwrap();
        assert_eq!(params.diffusion.sampling.slg_skip_layers, vec![3, 5]);
        assert!(resolve(&["--image-skip-layer", "-1"]).is_err());
    }

    #[test]
    fn sequence_breaker_none_spells_the_empty_list() {
        let params = resolve(&["--dry-sequence-breaker", "none"]).unwrap();
        assert!(params.text.sampling.dry_sequence_breakers.is_empty());

        let params = resolve(&["--dry-sequence-breaker", "::"]).unwrap();
        assert_eq!(params.text.sampling.dry_sequence_breakers, vec!["::"]);
    }

    #[test]
    fn flag_beats_env_beats_default() {
        let env = [("KILN_ARG_CTX_SIZE", "8192")];
        assert_eq!(resolve(&[]).unwrap().text.n_ctx, 4096);
        assert_eq!(resolve_env(&[], &env).unwrap().text.n_ctx, 8192);
        assert_eq!(
            resolve_env(&["--ctx-size", "2048"], &env).unwrap().text.n_ctx,
            2048
        );
    }

    #[test]
    fn env_booleans() {
        let params = resolve_env(&[], &[("KILN_ARG_FLASH_ATTN", "1")]).unwrap();
        assert!(params.text.flash_attn);
        let params = resolve_env(&[], &[("KILN_ARG_CONT_BATCHING", "false")]).unwrap();
        assert!(!params.text.cont_batching);
        assert!(resolve_env(&[], &[("KILN_ARG_FLASH_ATTN", "yes")]).is_err());
    }

    #[test]
    fn re_resolving_the_same_tokens_is_deterministic() {
        let args = tokens(&[
            "--image-skip-layer",
            "3",
            "--image-skip-layer",
            "5",
            "--dry-sequence-breaker",
            ";",
        ]);
        let mut resolver = Resolver::default();
        let first = resolver.resolve_with_env(&args, |_| None).unwrap();
        let second = resolver.resolve_with_env(&args, |_| None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn images_endpoint_propagates_the_text_block() {
        let params = resolve(&[
            "--images",
            "-m",
            "weights.gguf",
            "-a",
            "painter",
            "-s",
            "42",
            "-fa",
            "--no-warmup",
            "--rpc",
            "10.0.0.1:50052",
            "-ts",
            "3,1",
        ])
        .unwrap();
        assert_eq!(params.diffusion.model, params.text.model);
        assert_eq!(params.diffusion.model_alias, params.text.model_alias);
        assert_eq!(params.diffusion.seed, 42);
        assert_eq!(params.diffusion.sampling.seed, 42);
        assert!(!params.diffusion.warmup);
        assert!(params.diffusion.flash_attn);
        assert_eq!(params.diffusion.n_threads, params.text.cpuparams.n_threads);
        assert_eq!(params.diffusion.rpc_servers, params.text.rpc_servers);
        assert_eq!(params.diffusion.tensor_split, params.text.tensor_split);
    }

    #[test]
    fn kv_override_list_gains_a_sentinel_terminator() {
        let params = resolve(&["--override-kv", "general.name=str:kiln"]).unwrap();
        assert_eq!(params.text.kv_overrides.len(), 2);
        assert!(params.text.kv_overrides[1].is_sentinel());
        assert_eq!(
            params.text.kv_overrides[0].value,
            KvOverrideValue::Str("kiln".to_string())
        );

        let params = resolve(&[]).unwrap();
        assert!(params.text.kv_overrides.is_empty());

        assert!(resolve(&["--override-kv", "broken"]).is_err());
        assert!(resolve(&["--override-kv", "k=blob:1"]).is_err());
    }

    #[test]
    fn temperature_clamps_at_zero() {
        let params = resolve(&["--temp", "-0.5"]).unwrap();
        assert_eq!(params.text.sampling.temp, 0.0);
    }

    #[test]
    fn dry_base_never_touches_the_multiplier() {
        let params = resolve(&["--dry-base", "2.5"]).unwrap();
        assert_eq!(params.text.sampling.dry_base, 2.5);
        assert_eq!(params.text.sampling.dry_multiplier, 0.0);

        // sub-1.0 bases are ignored, not errors.
        let params = resolve(&["--dry-base", "0.5"]).unwrap();
        assert_eq!(params.text.sampling.dry_base, 1.75);
    }

    #[test]
    fn visual_max_image_size_is_zero_or_a_patch_multiple() {
        assert_eq!(resolve(&["--visual-max-image-size", "0"]).unwrap().max_image_size, 0);
        assert_eq!(
            resolve(&["--visual-max-image-size", "224"]).unwrap().max_image_size,
            224
        );
        assert_eq!(
            resolve(&["--visual-max-image-size", "238"]).unwrap().max_image_size,
            238
        );
        assert!(resolve(&["--visual-max-image-size", "210"]).is_err());
        assert!(resolve(&["--visual-max-image-size", "225"]).is_err());
    }

    #[test]
    fn lookup_ngram_min_range() {
        assert!(resolve(&["--lookup-ngram-min", "0"]).is_err());
        assert!(resolve(&["--lookup-ngram-min", "5"]).is_err());
        assert_eq!(resolve(&["--lookup-ngram-min", "1"]).unwrap().lookup_ngram_min, 1);
        assert_eq!(resolve(&["--lookup-ngram-min", "4"]).unwrap().lookup_ngram_min, 4);
    }

    #[test]
    fn upscale_repeats_must_be_positive() {
        assert!(resolve(&["--image-upscale-repeats", "0"]).is_err());
        assert_eq!(
            resolve(&["--image-upscale-repeats", "2"]).unwrap().diffusion.upscale_repeats,
            2
        );
    }

    #[test]
    fn batch_cpu_parameters_inherit_unless_overridden() {
        let params = resolve(&["-t", "3", "-Cr", "0-3", "--prio", "2"]).unwrap();
        assert_eq!(params.text.cpuparams_batch.n_threads, 3);
        assert_eq!(params.text.cpuparams_batch.mask, Some(CpuMask::Range(0, 3)));
        assert_eq!(params.text.cpuparams_batch.priority, 2);

        let params = resolve(&["-t", "3", "-tb", "5"]).unwrap();
        assert_eq!(params.text.cpuparams.n_threads, 3);
        assert_eq!(params.text.cpuparams_batch.n_threads, 5);
    }

    #[test]
    fn speculative_devices_inherit_the_main_list() {
        let params = resolve(&["-dev", "cuda0,cuda1"]).unwrap();
        assert_eq!(
            params.text.speculative.devices,
            Some(vec!["cuda0".to_string(), "cuda1".to_string()])
        );

        let params = resolve(&["-dev", "cuda0", "-devd", "none"]).unwrap();
        assert_eq!(params.text.speculative.devices, Some(Vec::new()));

        let params = resolve(&[]).unwrap();
        assert_eq!(params.text.speculative.devices, None);
    }

    #[test]
    fn tensor_split_pads_to_the_device_limit() {
        let params = resolve(&["-ts", "1/2/3"]).unwrap();
        assert_eq!(params.text.tensor_split.len(), MAX_DEVICES);
        assert_eq!(&params.text.tensor_split[..4], &[1.0, 2.0, 3.0, 0.0]);

        let overflow = (0..17).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        assert!(resolve(&["-ts", &overflow]).is_err());
    }

    #[test]
    fn cache_reuse_reenables_prompt_caching() {
        let params = resolve(&["--no-cache-prompt"]).unwrap();
        assert!(!params.cache_prompt);

        let params = resolve(&["--no-cache-prompt", "--cache-reuse", "64"]).unwrap();
        assert!(params.cache_prompt);
        assert_eq!(params.text.n_cache_reuse, 64);
    }

    #[test]
    fn repeat_last_n_raises_the_kept_token_window() {
        let params = resolve(&["--repeat-last-n", "128"]).unwrap();
        assert_eq!(params.text.sampling.penalty_last_n, 128);
        assert_eq!(params.text.sampling.n_prev, 128);

        let params = resolve(&["--repeat-last-n", "16"]).unwrap();
        assert_eq!(params.text.sampling.n_prev, 64);

        assert!(resolve(&["--repeat-last-n", "-2"]).is_err());
    }

    #[test]
    fn deferred_lora_application_zeroes_the_scales() {
        let params = resolve(&[
            "--lora-scaled",
            "style.safetensors",
            "0.5",
            "--lora",
            "detail.safetensors",
            "--lora-init-without-apply",
        ])
        .unwrap();
        assert!(params.text.lora_adapters.iter().all(|a| a.scale == 0.0));
        assert_eq!(params.text.lora_adapters.len(), 2);
    }

    #[test]
    fn ports_and_device_indices_are_range_checked() {
        assert!(resolve(&["--port", "70000"]).is_err());
        assert!(resolve(&["-mg", "16"]).is_err());
        assert_eq!(resolve(&["-mg", "2"]).unwrap().text.main_gpu, 2);
        assert!(resolve(&["--rpc-server-main-gpu", "-2"]).is_err());
        assert_eq!(
            resolve(&["--rpc-server-main-gpu", "-1"]).unwrap().rpc.main_gpu,
            -1
        );
    }

    #[test]
    fn control_vector_layer_range_takes_two_values() {
        let params = resolve(&["--control-vector-layer-range", "4", "30"]).unwrap();
        assert_eq!(params.text.control_vector_layer_start, 4);
        assert_eq!(params.text.control_vector_layer_end, 30);
        assert!(resolve(&["--control-vector-layer-range", "4"]).is_err());
    }

    #[test]
    fn sampler_and_schedule_spellings_resolve() {
        let params = resolve(&[
            "--image-sampler",
            "dpm++2m",
            "--image-schedule",
            "karras",
            "--image-sampling-steps",
            "30",
        ])
        .unwrap();
        assert_eq!(params.diffusion.sampling.sample_method, Some(SampleMethod::Dpmpp2m));
        assert_eq!(params.diffusion.sampling.schedule_method, ScheduleMethod::Karras);
        assert_eq!(params.diffusion.sampling.sampling_steps, Some(30));
        assert!(resolve(&["--image-sampler", "plms"]).is_err());
    }

    #[test]
    fn timeout_sets_both_directions() {
        let params = resolve(&["-to", "120"]).unwrap();
        assert_eq!(params.text.timeout_read, 120);
        assert_eq!(params.text.timeout_write, 120);
    }
}
