//! Side-by-side image transform viewer
//!
//! Loads a PNG (or falls back to a generated test gradient), hands it to
//! the engine, and runs the frame loop until the window is closed. The
//! compute kernel configured in `viewer.toml` decides what the right-hand
//! image looks like.

use haze_engine::{config::EngineConfig, render::LoopState, render::Renderer};

const CONFIG_PATH: &str = "viewer.toml";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("Viewer failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::path::Path::new(CONFIG_PATH).exists() {
        EngineConfig::load_from_file(CONFIG_PATH)?
    } else {
        log::info!("No {} found, using defaults", CONFIG_PATH);
        EngineConfig::default()
    };

    let (pixels, width, height) = match std::env::args().nth(1) {
        Some(path) => load_png(&path)?,
        None => {
            log::info!("No image given, using generated gradient");
            test_gradient(256, 256)
        }
    };

    let mut renderer = Renderer::new(&config)?;
    renderer.create_input_image(&pixels, width, height)?;

    while renderer.loop_state() == LoopState::Running {
        renderer.handle_events();
        if let Some(frame) = renderer.begin_frame()? {
            renderer.dispatch_transform(&frame);
            renderer.draw_side_by_side(&frame)?;
            renderer.end_frame(frame)?;
        }
    }

    renderer.shutdown();
    Ok(())
}

fn load_png(path: &str) -> Result<(Vec<u8>, u32, u32), Box<dyn std::error::Error>> {
    let img = image::open(path)?.to_rgba8();
    let (width, height) = img.dimensions();
    log::info!("Loaded {} ({}x{})", path, width, height);
    Ok((img.into_raw(), width, height))
}

/// Diagonal RGB gradient, handy for eyeballing kernel output without an
/// input file
fn test_gradient(width: u32, height: u32) -> (Vec<u8>, u32, u32) {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 255 / width.max(1)) as u8);
            pixels.push((y * 255 / height.max(1)) as u8);
            pixels.push((((x + y) * 255) / (width + height).max(1)) as u8);
            pixels.push(255);
        }
    }
    (pixels, width, height)
}
