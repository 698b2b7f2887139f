use clap::Parser;
use snapkv::config::Config;
use snapkv::{server, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();

    server::run(config).await
}
