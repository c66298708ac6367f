#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use ahash::AHashMap;
use noderpc::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    log::info!("starting node: mode={:?}", config.node.mode);
    noderpc::startup(config, AHashMap::default()).await
}
