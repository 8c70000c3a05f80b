use serde::{Deserialize, Serialize};

/// Maximum number of compute devices a tensor split can address.
pub const MAX_DEVICES: usize = 16;

/// Largest n-gram size the lookup cache supports.
pub const LOOKUP_NGRAM_MAX: i32 = 4;

/// Seed sentinel meaning "let the backend choose".
pub const DEFAULT_SEED: u64 = 0;

/// One LoRA adapter: weight-delta file plus its blend scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub path: String,
    pub scale: f32,
}

/// A control vector applied over a layer range of the text model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlVector {
    pub path: String,
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvOverrideValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// A model-metadata override. The override list handed to the backend is
/// terminated by a sentinel entry with an empty key; the sentinel is appended
/// during propagation, never by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvOverride {
    pub key: String,
    pub value: KvOverrideValue,
}

impl KvOverride {
    pub fn sentinel() -> Self {
        Self {
            key: String::new(),
            value: KvOverrideValue::Bool(false),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    None,
    Layer,
    Row,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "iq4_nl")]
    Iq4Nl,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
}

serde_plain::derive_display_from_serialize!(SplitMode);
serde_plain::derive_fromstr_from_deserialize!(SplitMode);
serde_plain::derive_display_from_serialize!(CacheType);
serde_plain::derive_fromstr_from_deserialize!(CacheType);

/// Diffusion sampler, spelled the way the CLI spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMethod {
    #[serde(rename = "euler_a")]
    EulerA,
    #[serde(rename = "euler")]
    Euler,
    #[serde(rename = "heun")]
    Heun,
    #[serde(rename = "dpm2")]
    Dpm2,
    #[serde(rename = "dpm++2s_a")]
    Dpmpp2sA,
    #[serde(rename = "dpm++2m")]
    Dpmpp2m,
    #[serde(rename = "dpm++2mv2")]
    Dpmpp2mv2,
    #[serde(rename = "ipndm")]
    Ipndm,
    #[serde(rename = "ipndm_v")]
    IpndmV,
    #[serde(rename = "lcm")]
    Lcm,
}

/// Denoiser sigma schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMethod {
    Discrete,
    Karras,
    Exponential,
    Ays,
    Gits,
}

serde_plain::derive_display_from_serialize!(SampleMethod);
serde_plain::derive_fromstr_from_deserialize!(SampleMethod);
serde_plain::derive_display_from_serialize!(ScheduleMethod);
serde_plain::derive_fromstr_from_deserialize!(ScheduleMethod);

/// CPU affinity of one thread pool role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CpuMask {
    /// Arbitrarily long hex mask, e.g. "0xff".
    Hex(String),
    /// Inclusive lo-hi CPU range.
    Range(u32, u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuParams {
    /// Worker thread count; <= 0 resolves to the detected core count.
    pub n_threads: i32,
    pub mask: Option<CpuMask>,
    pub strict_cpu: bool,
    pub priority: i32,
    pub poll: u32,
}

impl Default for CpuParams {
    fn default() -> Self {
        Self {
            n_threads: -1,
            mask: None,
            strict_cpu: false,
            priority: 0,
            poll: 50,
        }
    }
}

/// Speculative-decoding sub-block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeculativeParams {
    pub model: String,
    /// None = unset (inherits the main device list), empty = explicit "none".
    pub devices: Option<Vec<String>>,
    pub n_max: i32,
    pub n_min: i32,
    pub p_min: f32,
    pub n_gpu_layers: i32,
}

impl Default for SpeculativeParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            devices: None,
            n_max: 16,
            n_min: 0,
            p_min: 0.75,
            n_gpu_layers: -1,
        }
    }
}

/// Text-generation sampling hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: u64,
    pub temp: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typ_p: f32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    /// Token window kept for penalty bookkeeping.
    pub n_prev: i32,
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_present: f32,
    pub penalty_freq: f32,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub mirostat: i32,
    pub mirostat_eta: f32,
    pub mirostat_tau: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            temp: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typ_p: 1.0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            n_prev: 64,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_present: 0.0,
            penalty_freq: 0.0,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: vec![
                "\n".to_string(),
                ":".to_string(),
                "\"".to_string(),
                "*".to_string(),
            ],
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            mirostat: 0,
            mirostat_eta: 0.1,
            mirostat_tau: 5.0,
        }
    }
}

/// Text-generation block, including the serving address the HTTP layer binds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextParams {
    pub model: String,
    pub model_alias: String,
    pub hostname: String,
    pub port: u16,
    /// Read/write timeout in seconds.
    pub timeout_read: i32,
    pub timeout_write: i32,
    pub n_threads_http: i32,
    pub verbosity: i32,

    /// None = unset, empty = explicit "none" (no offload).
    pub devices: Option<Vec<String>>,
    pub split_mode: SplitMode,
    pub main_gpu: i32,
    /// Offload proportions, padded with zeros to MAX_DEVICES entries.
    pub tensor_split: Vec<f32>,
    pub n_gpu_layers: i32,
    pub warmup: bool,
    pub flash_attn: bool,

    pub n_ctx: i32,
    pub n_predict: i32,
    pub n_batch: i32,
    pub n_ubatch: i32,
    pub n_keep: i32,
    pub n_parallel: i32,
    pub cont_batching: bool,
    pub ctx_shift: bool,
    pub n_cache_reuse: i32,
    pub no_kv_offload: bool,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
    pub defrag_thold: f32,

    pub sampling: SamplingParams,

    pub lora_adapters: Vec<LoraAdapter>,
    pub lora_init_without_apply: bool,
    pub control_vectors: Vec<ControlVector>,
    pub control_vector_layer_start: i32,
    pub control_vector_layer_end: i32,

    pub speculative: SpeculativeParams,
    pub lookup_cache_static: String,
    pub lookup_cache_dynamic: String,

    pub kv_overrides: Vec<KvOverride>,

    pub cpuparams: CpuParams,
    pub cpuparams_batch: CpuParams,

    /// Comma-separated offload-server addresses.
    pub rpc_servers: String,
}

impl Default for TextParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            model_alias: String::new(),
            hostname: "127.0.0.1".to_string(),
            port: 8080,
            timeout_read: 600,
            timeout_write: 600,
            n_threads_http: -1,
            verbosity: 0,
            devices: None,
            split_mode: SplitMode::Layer,
            main_gpu: 0,
            tensor_split: vec![0.0; MAX_DEVICES],
            n_gpu_layers: -1,
            warmup: true,
            flash_attn: false,
            n_ctx: 4096,
            n_predict: -1,
            n_batch: 2048,
            n_ubatch: 512,
            n_keep: 0,
            n_parallel: 1,
            cont_batching: true,
            ctx_shift: true,
            n_cache_reuse: 0,
            no_kv_offload: false,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
            defrag_thold: 0.1,
            sampling: SamplingParams::default(),
            lora_adapters: Vec::new(),
            lora_init_without_apply: false,
            control_vectors: Vec::new(),
            control_vector_layer_start: -1,
            control_vector_layer_end: -1,
            speculative: SpeculativeParams::default(),
            lookup_cache_static: String::new(),
            lookup_cache_dynamic: String::new(),
            kv_overrides: Vec::new(),
            cpuparams: CpuParams::default(),
            cpuparams_batch: CpuParams::default(),
            rpc_servers: String::new(),
        }
    }
}

/// Offload (RPC) server block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcServerParams {
    pub hostname: String,
    /// 0 = disabled.
    pub port: u16,
    /// -1 = serve from RAM instead of a GPU.
    pub main_gpu: i32,
    /// Memory to reserve, in MiB.
    pub reserve_memory: u64,
}

impl Default for RpcServerParams {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 0,
            main_gpu: 0,
            reserve_memory: 0,
        }
    }
}

/// Per-request diffusion sampling parameters. Fields that the version-default
/// resolver may fill are `None` until the user sets them explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionSamplingParams {
    pub seed: u64,
    pub height: i32,
    pub width: i32,
    pub guidance: f32,
    pub strength: Option<f32>,
    pub sample_method: Option<SampleMethod>,
    pub sampling_steps: Option<i32>,
    pub cfg_scale: Option<f32>,
    pub slg_scale: f32,
    pub slg_skip_layers: Vec<i32>,
    pub slg_start: f32,
    pub slg_end: f32,
    pub schedule_method: ScheduleMethod,
    pub negative_prompt: String,
    pub control_strength: f32,
    pub control_canny: bool,
}

impl Default for DiffusionSamplingParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            height: 1024,
            width: 1024,
            guidance: 3.5,
            strength: None,
            sample_method: None,
            sampling_steps: None,
            cfg_scale: None,
            slg_scale: 0.0,
            slg_skip_layers: vec![7, 8, 9],
            slg_start: 0.01,
            slg_end: 0.2,
            schedule_method: ScheduleMethod::Discrete,
            negative_prompt: String::new(),
            control_strength: 0.9,
            control_canny: false,
        }
    }
}

/// Image-diffusion block. The fields below `seed` are strictly derived from
/// the text block during propagation and are never independently user-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionParams {
    pub max_batch_count: i32,
    pub sampling: DiffusionSamplingParams,
    pub text_encoder_model_offload: bool,
    pub clip_l_model: String,
    pub clip_g_model: String,
    pub t5xxl_model: String,
    pub vae_model_offload: bool,
    pub vae_model: String,
    pub vae_tiling: bool,
    pub taesd_model: String,
    pub upscale_model: String,
    pub upscale_repeats: i32,
    pub control_model_offload: bool,
    pub control_net_model: String,
    pub free_compute_immediately: bool,

    pub model: String,
    pub model_alias: String,
    pub seed: u64,
    pub warmup: bool,
    pub flash_attn: bool,
    pub n_threads: i32,
    pub lora_init_without_apply: bool,
    pub lora_adapters: Vec<LoraAdapter>,
    pub rpc_servers: String,
    pub tensor_split: Vec<f32>,
}

impl Default for DiffusionParams {
    fn default() -> Self {
        Self {
            max_batch_count: 4,
            sampling: DiffusionSamplingParams::default(),
            text_encoder_model_offload: true,
            clip_l_model: String::new(),
            clip_g_model: String::new(),
            t5xxl_model: String::new(),
            vae_model_offload: true,
            vae_model: String::new(),
            vae_tiling: false,
            taesd_model: String::new(),
            upscale_model: String::new(),
            upscale_repeats: 1,
            control_model_offload: true,
            control_net_model: String::new(),
            free_compute_immediately: false,
            model: String::new(),
            model_alias: String::new(),
            seed: DEFAULT_SEED,
            warmup: true,
            flash_attn: false,
            n_threads: -1,
            lora_init_without_apply: false,
            lora_adapters: Vec::new(),
            rpc_servers: String::new(),
            tensor_split: vec![0.0; MAX_DEVICES],
        }
    }
}

/// The whole resolved configuration: one aggregate shared by the text
/// backend, the offload server and the diffusion backend, plus the
/// cross-cutting extension fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilnParams {
    pub text: TextParams,
    pub rpc: RpcServerParams,
    pub diffusion: DiffusionParams,

    pub endpoint_images: bool,
    pub cache_prompt: bool,
    /// Connection idle / keep-alive timeouts in seconds.
    pub conn_idle: i32,
    pub conn_keepalive: i32,
    /// Maximum tokens per second, 0 = unthrottled.
    pub n_tps: i32,
    /// Minimum n-gram size for the lookup cache, 0 = disabled.
    pub lookup_ngram_min: i32,
    /// Maximum vision image edge, 0 = disabled.
    pub max_image_size: i32,
}

impl Default for KilnParams {
    fn default() -> Self {
        Self {
            text: TextParams::default(),
            rpc: RpcServerParams::default(),
            diffusion: DiffusionParams::default(),
            endpoint_images: false,
            cache_prompt: true,
            conn_idle: 60,
            conn_keepalive: 15,
            n_tps: 0,
            lookup_ngram_min: 0,
            max_image_size: 0,
        }
    }
}
