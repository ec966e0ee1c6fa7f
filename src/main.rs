//! # ninepresent-probe
//!
//! Checks that an X server offers what the presentation engine needs and,
//! given a window, measures its vblank pacing through Present `NotifyMSC`.
//!
//! ```text
//! ninepresent-probe                      # extension versions only
//! ninepresent-probe --window 0x3a00007   # plus MSC pacing on that window
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use ninepresent::{
    DrainSettings, PresentConfig, PresentationSession, X11Connection, Xid,
};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "ninepresent-probe")]
#[command(about = "Probe X11 Present/DRI3 support and vblank pacing")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/ninepresent/ninepresent.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// X display to connect to (defaults to $DISPLAY)
    #[arg(long)]
    display: Option<String>,

    /// Window to measure, decimal or 0x-prefixed hex
    #[arg(short, long, value_parser = parse_xid)]
    window: Option<Xid>,

    /// Number of MSC waits to sample
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Frames per wait
    #[arg(long, default_value_t = 1)]
    interval: u64,
}

fn parse_xid(text: &str) -> std::result::Result<Xid, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => Xid::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid window id '{}': {}", text, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configuration is read before logging so `general.debug` can raise the level
    let loaded = PresentConfig::load(&cli.config);
    let debug = cli.debug || loaded.as_ref().map_or(false, |c| c.general.debug);

    // Initialize logging
    if debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting ninepresent probe");
    info!("📄 Version: {}", ninepresent::VERSION);

    let config = match loaded {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            PresentConfig::default()
        }
    };

    let conn = X11Connection::connect(cli.display.as_deref())
        .context("Failed to connect to the X server")?;
    let versions = conn.versions();
    println!(
        "Present {}.{}  DRI3 {}.{}  XFixes {}.{}",
        versions.present.0,
        versions.present.1,
        versions.dri3.0,
        versions.dri3.1,
        versions.xfixes.0,
        versions.xfixes.1
    );

    let Some(window) = cli.window else {
        return Ok(());
    };

    let session = PresentationSession::new(Box::new(conn), DrainSettings::from(&config.present));
    session
        .bind_window(window)
        .with_context(|| format!("Failed to bind window {:#x}", window))?;
    let geometry = session.geometry();
    println!(
        "Window {:#x}: {}x{} depth {}",
        window, geometry.width, geometry.height, geometry.depth
    );

    let interval = cli.interval.max(1);
    let (start_msc, start_ust) = session.wait_msc(0)?;
    let started = Instant::now();
    let mut last = (start_msc, start_ust);
    for _ in 0..cli.frames {
        let (msc, ust) = session.wait_msc(interval)?;
        if msc < last.0 + interval {
            warn!("MSC went from {} to {}, expected +{}", last.0, msc, interval);
        }
        last = (msc, ust);
    }

    let frames = last.0.saturating_sub(start_msc);
    let elapsed_us = last.1.saturating_sub(start_ust);
    if frames > 0 && elapsed_us > 0 {
        let period_us = elapsed_us as f64 / frames as f64;
        println!(
            "{} frames in {:.1} ms: {:.3} ms/frame ({:.2} Hz), wall clock {:.1} ms",
            frames,
            elapsed_us as f64 / 1000.0,
            period_us / 1000.0,
            1_000_000.0 / period_us,
            started.elapsed().as_secs_f64() * 1000.0
        );
    } else {
        println!("No MSC progress observed");
    }

    session.bind_window(ninepresent::protocol::NONE)?;
    info!("👋 Probe finished");
    Ok(())
}
