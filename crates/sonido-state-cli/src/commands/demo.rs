//! Live demo: a simulated processing thread automates a gain parameter while
//! the control thread drains notifications, saves and reloads state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use sonido_state::{
    CallbackThread, ParamHolder, Parameter, PluginState, ProcessingScope, StateConfig, StateValue,
};

/// Control-thread polling interval, roughly one UI frame.
const FRAME: Duration = Duration::from_millis(16);

/// Flat preset from before the versioned envelope, carrying a parameter this
/// build no longer has.
const LEGACY_PRESET: &[u8] = br#"{"gain":-3.0,"legacyParam":1}"#;

#[derive(Args)]
pub struct DemoArgs {
    /// Number of processing blocks to run
    #[arg(long, default_value = "200")]
    blocks: u32,

    /// Simulated block duration in milliseconds
    #[arg(long, default_value = "2")]
    block_ms: u64,

    /// State configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the state saved after processing to this file
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,
}

struct Demo {
    state: PluginState,
    gain: Arc<Parameter>,
    peak: Arc<StateValue<f64>>,
}

fn build(config: StateConfig) -> anyhow::Result<Demo> {
    let mut holder = ParamHolder::new("root");
    let gain = holder.add_param(Parameter::float("gain", "Gain", -60.0, 12.0, 0.0));
    holder.add_param(Parameter::boolean("bypass", "Bypass", false));
    let mut meters = ParamHolder::new("meters");
    let peak = meters.add_value(StateValue::new("peak", 0.0_f64));
    holder.add_group(meters);

    let mut state = PluginState::new(config);
    state.initialise(Arc::new(holder), None, None)?;
    Ok(Demo { state, gain, peak })
}

fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::Relaxed);
    })
}

pub fn run(args: DemoArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => StateConfig::load(path)?,
        None => StateConfig::default(),
    };
    if config.app_version.is_none() {
        config.app_version = Some(env!("CARGO_PKG_VERSION").to_string());
    }

    let demo = Arc::new(build(config)?);
    let (gain_control, on_gain_control) = counter();
    let (gain_processing, on_gain_processing) = counter();
    let (peak_control, on_peak_control) = counter();
    let _gain_ui = demo
        .state
        .add_parameter_listener(&demo.gain, CallbackThread::Control, on_gain_control)?;
    let _gain_dsp = demo
        .state
        .add_parameter_listener(&demo.gain, CallbackThread::Processing, on_gain_processing)?;
    let _peak_ui =
        demo.state
            .add_non_parameter_listener(&demo.peak, CallbackThread::Control, on_peak_control)?;

    tracing::info!(blocks = args.blocks, block_ms = args.block_ms, "starting processing thread");
    let processing = {
        let demo = Arc::clone(&demo);
        let blocks = args.blocks;
        let block = Duration::from_millis(args.block_ms);
        thread::spawn(move || -> anyhow::Result<()> {
            for n in 0..blocks {
                if n == blocks / 2 {
                    // Host automation arrives mid-run.
                    demo.gain.set(-6.0);
                }
                {
                    let _scope = ProcessingScope::enter();
                    let phase = f64::from(n) * 0.05;
                    demo.peak.set(phase.sin().abs());
                }
                demo.state.process_block()?;
                thread::sleep(block);
            }
            Ok(())
        })
    };

    while !processing.is_finished() {
        demo.state.dispatch_control()?;
        thread::sleep(FRAME);
    }
    processing
        .join()
        .map_err(|_| anyhow::anyhow!("processing thread panicked"))??;
    demo.state.dispatch_control()?;

    println!("Processing finished");
    println!(
        "  gain listener (processing): {} call(s)",
        gain_processing.load(Ordering::Relaxed)
    );
    println!(
        "  gain listener (control):    {} call(s)",
        gain_control.load(Ordering::Relaxed)
    );
    println!(
        "  peak listener (control):    {} call(s), coalesced per frame",
        peak_control.load(Ordering::Relaxed)
    );

    let saved = demo.state.serialize()?;
    if let Some(path) = &args.save {
        std::fs::write(path, &saved)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved state to {}", path.display());
    }
    println!("Saved: {}", String::from_utf8_lossy(&saved));

    let report = demo.state.deserialize(LEGACY_PRESET)?;
    demo.state.dispatch_control()?;
    println!();
    println!("Loaded legacy preset");
    println!("  flat layout: {}", report.legacy_layout);
    println!("  gain now:   {:.1} dB", demo.gain.get());
    println!("  applied:    {}", report.applied);
    println!("  ignored:    {}", report.ignored.join(", "));
    println!(
        "  gain listener (control): {} call(s)",
        gain_control.load(Ordering::Relaxed)
    );
    Ok(())
}
