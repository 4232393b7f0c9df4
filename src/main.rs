// SPDX-License-Identifier: MPL-2.0

mod decoder;
mod engine;
mod memory;
mod perf;
mod player;
mod prefetch;
mod surface;
#[cfg(test)]
mod testing;

use std::{rc::Rc, sync::Arc, time::Instant};

use calloop::{
    EventLoop,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
};
use eyre::WrapErr;
use loopframe_config::{Config, OutputTarget};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    decoder::DecoderFactory,
    engine::Engine,
    memory::{MemoryPressureEstimator, ProcMemory},
    perf::FrameSkipController,
    prefetch::{Collection, DirectoryStorage, PrefetchOrchestrator},
    surface::{Canvas, Framebuffer, Surface},
};

/// Seconds between two playback statistics log lines.
const STATS_PERIOD_SECS: u64 = 10;

struct State<S> {
    engine: Engine<S>,
    exit: bool,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loopframe=info")),
        )
        .init();

    let mut config = match Config::default_path().and_then(|path| Config::load(&path)) {
        Ok(config) => config,
        Err(why) => {
            warn!(%why, "Config file error, falling back to defaults");
            Config::fallback()
        }
    };
    config.decoder = config.decoder.apply_env();

    info!(
        collections = config.collections.len(),
        root = %config.storage.root.display(),
        rate = config.playback.rate,
        tick_hz = config.playback.tick_hz,
        "Starting loopframe"
    );

    match config.playback.output.clone() {
        OutputTarget::Framebuffer(path) => run(&config, Framebuffer::open(&path)?),
        OutputTarget::Headless { width, height } => run(&config, Canvas::new(width, height)),
    }
}

fn run<S: Surface + 'static>(config: &Config, surface: S) -> eyre::Result<()> {
    let storage = DirectoryStorage::from_settings(&config.storage);
    storage
        .clean_scratch()
        .wrap_err("failed to prepare scratch directory")?;

    let orchestrator = PrefetchOrchestrator::new(
        Collection::from_entries(&config.collections),
        Arc::new(storage),
        decoder_factory(config)?,
        MemoryPressureEstimator::new(Box::new(ProcMemory::new())),
    )?
    .with_settings(config.prefetch.clone())
    .with_rate(config.playback.rate)
    .with_item_duration(config.playback.item_duration());

    let engine = Engine::new(
        orchestrator,
        FrameSkipController::from_settings(&config.frame_skip),
        surface,
    )
    .with_stats_interval(u64::from(config.playback.tick_hz.max(1)) * STATS_PERIOD_SECS);

    let mut event_loop = EventLoop::<State<S>>::try_new()?;
    let handle = event_loop.handle();

    let interval = config.playback.tick_interval();
    handle
        .insert_source(Timer::immediate(), move |_, _, state: &mut State<S>| {
            if let Err(why) = state.engine.tick(Instant::now()) {
                error!(?why, "Presentation failed, shutting down");
                state.exit = true;
                return TimeoutAction::Drop;
            }
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|why| eyre::eyre!("failed to insert tick timer: {}", why.error))?;

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    handle
        .insert_source(signals, |event, _, state: &mut State<S>| {
            info!(signal = ?event.signal(), "Shutting down");
            state.exit = true;
        })
        .map_err(|why| eyre::eyre!("failed to insert signal handler: {}", why.error))?;

    let mut state = State {
        engine,
        exit: false,
    };
    state.engine.orchestrator_mut().start(Instant::now());

    loop {
        event_loop.dispatch(None, &mut state)?;

        if state.exit {
            break;
        }
    }

    info!("Stopped");
    Ok(())
}

#[cfg(feature = "gst")]
fn decoder_factory(config: &Config) -> eyre::Result<Rc<dyn DecoderFactory>> {
    let options = decoder::DecoderOptions::from(&config.decoder);
    Ok(Rc::new(decoder::GstDecoderFactory::new(options)?))
}

#[cfg(not(feature = "gst"))]
fn decoder_factory(_config: &Config) -> eyre::Result<Rc<dyn DecoderFactory>> {
    Err(eyre::eyre!("built without a video decoding backend, enable the `gst` feature"))
}
