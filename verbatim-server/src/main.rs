//! Verbatim transcription service entry point.
//!
//! Init order: CLI → tracing → engine device config → models →
//! document store → dispatcher → HTTP. All of it is
//! construct-once, read-only after init; SIGINT/SIGTERM drain the
//! server.

mod config;
mod device;
mod error;
mod handlers;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use verbatim_core::{DecoderFactory, JobDispatcher};

use crate::config::ServerConfig;
use crate::device::EngineDeviceConfig;
use crate::state::{AppState, DecodeLimits, ModelFactory};
use crate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_tracing(&config);

    let mut device_conf = EngineDeviceConfig::new();
    device_conf.add("whisper", 0, &["w", "asr"]);
    config.apply_device_flags(&mut device_conf)?;
    for (engine, device) in device_conf.describe() {
        info!("engine {engine}: {device}");
    }

    let vad_model_path = config.resolve_vad_model();
    match &vad_model_path {
        Some(path) => info!("VAD model {}", path.display()),
        None => info!("VAD is disabled"),
    }

    #[cfg(feature = "whisper")]
    let factory = {
        use verbatim_core::WhisperModel;

        let model_path = config.resolve_whisper_model()?;
        info!("Whisper model {}", model_path.display());

        let dtw = (!config.whisper_dtw.is_empty()).then_some(config.whisper_dtw.as_str());
        let model = WhisperModel::load(
            &model_path,
            dtw,
            device_conf.is_gpu("whisper"),
            device_conf.device("whisper").unwrap_or(0).max(0),
        )?;
        Arc::new(ModelFactory::new(model, vad_model_path))
    };

    #[cfg(not(feature = "whisper"))]
    let factory = {
        tracing::warn!("built without the `whisper` feature; decoding with the stub engine");
        Arc::new(ModelFactory::new(vad_model_path))
    };

    let storage = Storage::open(&config.storage, "files")?;

    let factory: Arc<dyn DecoderFactory> = factory;
    let dispatcher = Arc::new(JobDispatcher::new(
        Arc::clone(&factory),
        config.max_instances,
    ));

    let state = AppState {
        dispatcher,
        storage,
        factory,
        limits: DecodeLimits {
            limit_input_s: config.limit_input_s,
            vad_trim_range_s: config.vad_trim_range_s,
        },
    };

    let app = handlers::router(
        state,
        &config.static_dir,
        config.cors,
        config.payload_limit_bytes(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("running server on port {}", config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let default_filter = if config.verbose {
        "verbatim_server=debug,verbatim_core=debug,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
