//! AURA avatar mixer binary
//!
//! Usage: aura-mixer <settings.json> [bind-addr]
//!
//! The settings file is the domain settings object; a missing or unreadable
//! file is fatal before the loop starts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use aura_core::{AuraError, Clock};
use aura_mixer::{
    run_receive_loop, AvatarMixer, DefaultReplicationPolicy, LogStatsSink, MixerSettings,
    Registry, UdpSink,
};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:48010";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(error) = run() {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AuraError> {
    let mut args = std::env::args().skip(1);
    let settings_path = args
        .next()
        .ok_or_else(|| AuraError::Settings("usage: aura-mixer <settings.json> [bind-addr]".into()))?;
    let bind_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
        .parse()
        .map_err(|_| AuraError::Settings("invalid bind address".into()))?;

    // settings are required at startup; bail before the loop otherwise
    let raw = std::fs::read_to_string(&settings_path)
        .map_err(|e| AuraError::Settings(format!("cannot read {settings_path}: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| AuraError::Settings(format!("cannot parse {settings_path}: {e}")))?;
    let settings = MixerSettings::from_domain_settings(&value)?;

    let socket = aura_mixer::bind_udp(bind_addr)
        .map_err(|e| AuraError::Transport(format!("cannot bind {bind_addr}: {e}")))?;
    let recv_socket = socket
        .try_clone()
        .map_err(|e| AuraError::Transport(format!("cannot clone socket: {e}")))?;
    info!(%bind_addr, "listening");

    let clock = Clock::new();
    let registry = Arc::new(Registry::new(clock));
    let mixer = Arc::new(AvatarMixer::new(
        settings,
        registry,
        Arc::new(UdpSink::new(socket)),
        Arc::new(LogStatsSink),
        Arc::new(DefaultReplicationPolicy),
    ));

    let running = Arc::new(AtomicBool::new(true));

    // stop the loop cleanly on ctrl-c; the run loop checks the flag once
    // per tick and returns, after which the receive thread is joined
    {
        let mixer = mixer.clone();
        let running = running.clone();
        if let Err(error) = ctrlc::set_handler(move || {
            running.store(false, Ordering::Relaxed);
            mixer.stop();
        }) {
            warn!(%error, "could not install ctrl-c handler");
        }
    }

    let receive_handle = {
        let mixer = mixer.clone();
        let running = running.clone();
        std::thread::Builder::new()
            .name("aura-receive".into())
            .spawn(move || run_receive_loop(recv_socket, mixer, running))
            .map_err(|e| AuraError::Transport(format!("cannot spawn receive thread: {e}")))?
    };

    // the tight loop runs until the process is asked to stop
    mixer.run();

    running.store(false, Ordering::Relaxed);
    let _ = receive_handle.join();
    Ok(())
}
