use std::path::PathBuf;

use clap::Parser;

pub const HOST: &str = "127.0.0.1";
pub const PORT: u16 = 6379;
pub const SNAPSHOT_PATH: &str = "data-store.json";
/// Largest encoded command accepted from a client, in bytes.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "snapkv", version, about)]
pub struct Config {
    /// The address to bind to
    #[arg(long, env = "SNAPKV_HOST", default_value = HOST)]
    pub host: String,

    /// The port to listen on
    #[arg(short, long, env = "SNAPKV_PORT", default_value_t = PORT)]
    pub port: u16,

    /// Path of the snapshot file holding the whole key space
    #[arg(short, long, env = "SNAPKV_SNAPSHOT", default_value = SNAPSHOT_PATH)]
    pub snapshot: PathBuf,

    /// Maximum size of a single encoded command, in bytes
    #[arg(long, env = "MAX_FRAME_SIZE", default_value_t = MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HOST.to_string(),
            port: PORT,
            snapshot: PathBuf::from(SNAPSHOT_PATH),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}
