use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use kiln_core::{
    decode_mask, decode_rgb, DiffusionContext, DiffusionSamplingParams, InitImages, KilnParams,
    Resolver,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: kiln-server [options]

general:
  -h,    --help, --usage          print this help and exit
         --version                print the version and exit
  -v,    --verbose                maximum log verbosity
  -lv,   --verbosity N            log verbosity level

server:
         --host HOST              address to bind (default: 127.0.0.1)
         --port PORT              port to listen on (default: 8080)
  -to,   --timeout SECONDS        read/write timeout (default: 600)
         --threads-http N         HTTP worker threads
         --conn-idle SECONDS      connection idle timeout (default: 60)
         --conn-keepalive SECONDS connection keep-alive timeout (default: 15)
  -m,    --model PATH             model path
  -a,    --alias NAME             model alias
         --lora PATH              apply a LoRA adapter
         --lora-scaled PATH SCALE apply a LoRA adapter with a scale
         --lora-init-without-apply
                                  load adapters without applying them
  -s,    --seed N                 RNG seed (default: 0, backend chooses)
  -fa,   --flash-attn             enable flash attention
         --images                 enable the image-generation endpoint
         --rpc SERVERS            comma-separated offload servers
  -ts,   --tensor-split SPLIT     per-device offload proportions
  -ngl,  --gpu-layers N           layers to offload
         --warmup, --no-warmup    toggle the startup warm-up run

completion:
  -dev,  --device LIST            offload devices, or 'none'
  -sm,   --split-mode MODE        none|layer|row (default: layer)
  -mg,   --main-gpu N             main GPU index
         --override-kv KEY=TYPE:VALUE
                                  override model metadata
  -tps,  --tokens-per-second N    throttle, 0 = unthrottled
  -t,    --threads N              worker threads (default: cores)
  -C,    --cpu-mask MASK          CPU affinity mask (hex)
  -Cr,   --cpu-range LO-HI        CPU affinity range
         --cpu-strict 0|1         strict CPU placement
         --prio N                 scheduling priority [-1, 3]
         --poll N                 polling level [0, 100]
  -tb, -Cb, -Crb, --cpu-strict-batch, --prio-batch, --poll-batch
                                  batch-mode equivalents of the above
  -c,    --ctx-size N             context size (default: 4096)
         --no-context-shift       disable context shifting
  -n,    --predict N              tokens to predict (default: -1)
  -b,    --batch-size N           logical batch size (default: 2048)
  -ub,   --ubatch-size N          physical batch size (default: 512)
         --keep N                 tokens to keep from the initial prompt
         --temp, --top-k, --top-p, --min-p, --typical, --xtc-probability,
         --xtc-threshold, --repeat-last-n, --repeat-penalty,
         --presence-penalty, --frequency-penalty, --dry-multiplier,
         --dry-base, --dry-allowed-length, --dry-penalty-last-n,
         --dry-sequence-breaker, --dynatemp-range, --dynatemp-exp,
         --mirostat, --mirostat-lr, --mirostat-ent
                                  sampling parameters
  -nkvo, --no-kv-offload          keep the KV cache in RAM
         --no-cache-prompt        disable prompt caching
         --cache-reuse N          min chunk size to reuse from the cache
  -ctk,  --cache-type-k TYPE      K cache type (default: f16)
  -ctv,  --cache-type-v TYPE      V cache type (default: f16)
  -dt,   --defrag-thold F         KV defrag threshold (default: 0.1)
  -np,   --parallel N             parallel sequences (default: 1)
  -nocb, --no-cont-batching       disable continuous batching
         --control-vector PATH, --control-vector-scaled PATH SCALE,
         --control-vector-layer-range START END
                                  control vectors

speculative:
         --draft-max N, --draft-min N, --draft-p-min F
  -md,   --model-draft PATH       draft model
  -devd, --device-draft LIST      draft offload devices
  -ngld, --gpu-layers-draft N     draft layers to offload
         --lookup-ngram-min N     lookup decoding n-gram size [1, 4]
  -lcs,  --lookup-cache-static PATH
  -lcd,  --lookup-cache-dynamic PATH

visual:
         --visual-max-image-size N
                                  0, or a multiple of 14 not below 224

images:
         --image-max-batch N      images per request (default: 4)
         --image-max-height N, --image-max-width N
                                  canvas maxima, multiples of 64 (default: 1024)
         --image-guidance F, --image-strength F, --image-sampler NAME,
         --image-sampling-steps N, --image-cfg-scale F, --image-schedule NAME
                                  sampling defaults, resolved per model version
         --image-slg-scale F, --image-skip-layer N, --image-slg-start F,
         --image-slg-end F        skip-layer guidance
         --image-clip-l-model, --image-clip-g-model, --image-t5xxl-model,
         --image-vae-model, --image-taesd-model, --image-control-net-model,
         --image-upscale-model PATH
                                  component model paths
         --image-no-text-encoder-model-offload, --image-no-vae-model-offload,
         --image-no-control-net-model-offload
                                  keep a component on the CPU
         --image-vae-tiling, --image-no-vae-tiling
         --image-upscale-repeats N
         --image-control-strength F, --image-control-canny
         --image-free-compute-memory-immediately

rpc server:
         --rpc-server-host HOST   offload-server bind address
         --rpc-server-port PORT   offload-server port, 0 = disabled
         --rpc-server-main-gpu N  -1 serves from RAM
         --rpc-server-reserve-memory MIB
";

#[derive(Deserialize)]
struct ImagesRequest {
    prompt: String,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default)]
    width: Option<i32>,
    #[serde(default)]
    height: Option<i32>,
    #[serde(default)]
    steps: Option<i32>,
    #[serde(default)]
    guidance: Option<f32>,
    #[serde(default)]
    cfg_scale: Option<f32>,
    #[serde(default)]
    strength: Option<f32>,
    #[serde(default)]
    sampler: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
    /// Base64-encoded reference image; presence switches to image-to-image.
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    mask: Option<String>,
    #[serde(default)]
    control: Option<String>,
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
}

#[derive(Clone)]
struct AppState {
    params: Arc<KilnParams>,
    // Empty until a compute engine implementing DiffusionFactory is linked
    // in; the images route answers 503 meanwhile.
    context: Option<Arc<Mutex<DiffusionContext>>>,
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.params.as_ref().clone())
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImagesRequest>,
) -> impl IntoResponse {
    let Some(context) = state.context.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no diffusion backend is linked into this build",
        );
    };

    let (sparams, images) = match request_params(&req, &state.params) {
        Ok(resolved) => resolved,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, &reason),
    };

    let prompt = req.prompt.clone();
    let generated = tokio::task::spawn_blocking(move || {
        let context = context
            .lock()
            .map_err(|_| "diffusion context poisoned".to_string())?;
        let mut stream = context
            .generate(&prompt, &sparams, images)
            .map_err(|err| err.to_string())?;
        while context.sample(&mut stream) {}
        context
            .result(&stream)
            .ok_or_else(|| "generation produced no image".to_string())
    })
    .await;

    match generated {
        Ok(Ok(bytes)) => Json(GenerationResponse {
            image: BASE64_STANDARD.encode(&bytes),
        })
        .into_response(),
        Ok(Err(reason)) => {
            warn!(%reason, "image generation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &reason)
        }
        Err(err) => {
            warn!(%err, "image generation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Maps the request onto the configured sampling defaults, clamping the
/// canvas to the configured maxima.
fn request_params(
    req: &ImagesRequest,
    params: &KilnParams,
) -> Result<(DiffusionSamplingParams, Option<InitImages>), String> {
    let mut sparams = params.diffusion.sampling.clone();

    if let Some(width) = req.width {
        if width < 1 {
            return Err("width must be positive".to_string());
        }
        sparams.width = width.min(params.diffusion.sampling.width);
    }
    if let Some(height) = req.height {
        if height < 1 {
            return Err("height must be positive".to_string());
        }
        sparams.height = height.min(params.diffusion.sampling.height);
    }
    if let Some(steps) = req.steps {
        if steps < 1 {
            return Err("steps must be positive".to_string());
        }
        sparams.sampling_steps = Some(steps);
    }
    if let Some(guidance) = req.guidance {
        sparams.guidance = guidance;
    }
    if let Some(cfg_scale) = req.cfg_scale {
        sparams.cfg_scale = Some(cfg_scale);
    }
    if let Some(strength) = req.strength {
        if !(0.0..=1.0).contains(&strength) {
            return Err("strength must be in [0.0, 1.0]".to_string());
        }
        sparams.strength = Some(strength);
    }
    if let Some(sampler) = &req.sampler {
        sparams.sample_method =
            Some(sampler.parse().map_err(|_| format!("unknown sampler {sampler:?}"))?);
    }
    if let Some(schedule) = &req.schedule {
        sparams.schedule_method = schedule
            .parse()
            .map_err(|_| format!("unknown schedule {schedule:?}"))?;
    }
    if let Some(seed) = req.seed {
        sparams.seed = seed;
    }
    if let Some(negative_prompt) = &req.negative_prompt {
        sparams.negative_prompt = negative_prompt.clone();
    }

    let images = match &req.image {
        Some(encoded) => {
            let init = decode_base64_image(encoded, decode_rgb, "image")?;
            let mask = match &req.mask {
                Some(encoded) => Some(decode_base64_image(encoded, decode_mask, "mask")?),
                None => None,
            };
            let control = match &req.control {
                Some(encoded) => Some(decode_base64_image(encoded, decode_rgb, "control")?),
                None => None,
            };
            Some(InitImages {
                init,
                mask,
                control,
            })
        }
        None => None,
    };

    Ok((sparams, images))
}

fn decode_base64_image<T>(
    encoded: &str,
    decode: impl Fn(&[u8]) -> Option<T>,
    field: &str,
) -> Result<T, String> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|err| format!("malformed base64 in {field}: {err}"))?;
    decode(&bytes).ok_or_else(|| format!("undecodable {field} payload"))
}

fn init_tracing(verbosity: i32) {
    let level = match verbosity {
        i32::MIN..=0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(params: KilnParams) -> Result<()> {
    if params.endpoint_images {
        warn!("image endpoint enabled but no diffusion backend is linked into this build");
    }

    let bind_address = format!("{}:{}", params.text.hostname, params.text.port);
    let state = Arc::new(AppState {
        params: Arc::new(params),
        context: None,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/config", get(config_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(state);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "server listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "-h" || a == "--help" || a == "--usage") {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a == "--version") {
        println!("kiln-server {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let params = match Resolver::default().resolve(&args) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(params.text.verbosity);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(serve(params)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
