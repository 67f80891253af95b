//! Interactive demo: streamlines over a synthetic vortex field.
//!
//! Drag to pan, scroll to zoom, `Space` to pause, `S` to cycle styles.
//! An optional first argument names a JSON options file.

mod window;

use streamlines::VisualiserOptions;
use winit::event_loop::{ControlFlow, EventLoop};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = match std::env::args().nth(1) {
        Some(path) => VisualiserOptions::load(&path).expect("failed to load options"),
        None => VisualiserOptions::default(),
    };

    let event_loop = EventLoop::new().expect("failed to create event loop");
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = window::App::new(options);
    event_loop.run_app(&mut app).expect("event loop failed");
}
