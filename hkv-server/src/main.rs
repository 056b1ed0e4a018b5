//! # hkv-server
//!
//! The process entry point: loads configuration, brings up the engine with
//! its AOF sink and pub/sub hub wired in, replays any existing AOF file,
//! and accepts client connections until asked to shut down.

mod cluster;
mod config;
mod connection;
mod metrics;

use std::sync::Arc;

use tracing::{error, info, warn};

use hkv_aof::AofWriter;
use hkv_engine::{Engine, EngineConfig};
use hkv_pubsub::ChannelHub;

use config::Config;
use connection::ServerState;
use metrics::Metrics;

const SHARD_COUNT: usize = 16;
const PUBSUB_SHARD_COUNT: usize = 16;
const TIMER_TICK: std::time::Duration = std::time::Duration::from_secs(1);
const TIMER_SLOT_COUNT: usize = 3600;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "hkv.toml".to_string());
    let config = Config::load(std::path::Path::new(&config_path))?;
    info!(path = %config_path, "loaded configuration");

    std::fs::create_dir_all(&config.dir)?;

    let engine_config = EngineConfig {
        database_count: config.databases,
        shard_count: SHARD_COUNT,
        tick_interval: TIMER_TICK,
        slot_count: TIMER_SLOT_COUNT,
        password: config.requirepass.clone(),
    };
    let mut engine = Engine::new(engine_config);

    let pubsub = Arc::new(ChannelHub::new(PUBSUB_SHARD_COUNT));
    engine.set_pubsub_hub(pubsub.clone());

    let aof = if config.appendonly {
        let path = config.aof_path();
        info!(path = %path.display(), "replaying append-only file");
        if let Err(e) = AofWriter::load(&path, None, &engine) {
            warn!(error = %e, "append-only file replay failed");
        }
        let writer = AofWriter::open(&path, config.fsync_policy())?;
        let writer = Arc::new(writer);
        engine.set_aof_sink(writer.clone());
        Some(writer)
    } else {
        None
    };

    let metrics = Arc::new(Metrics::new());
    let peers = config.peer_list();
    let cluster_aof = aof.clone().map(|writer| writer as Arc<dyn hkv_engine::engine::AofSink>);
    let state = Arc::new(ServerState::new(Arc::new(engine), pubsub, metrics, config.self_addr.clone(), peers, cluster_aof));

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening for connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle_connection(stream, state).await {
                        error!(peer = %peer_addr, error = %e, "connection ended with an error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, closing listener");
                break;
            }
        }
    }

    if let Some(writer) = aof {
        if let Ok(mut writer) = Arc::try_unwrap(writer) {
            writer.shutdown();
        }
    }

    Ok(())
}
