pub mod backend;
pub mod config;
pub mod diffusion;
pub mod resolver;
pub mod version;

mod util;

pub use backend::*;
pub use config::*;
pub use diffusion::{DiffusionContext, SamplingStream};
pub use resolver::{ConfigError, Resolver};
pub use util::{decode_mask, decode_rgb, encode_png};
pub use version::{ModelVersion, VersionDefaults};
