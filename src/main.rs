use anyhow::Context;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::{App, AppState};

mod app;
mod buffer;
mod engine;
mod image;
mod memory;
mod render;
mod staging;
mod transfer;
mod vulkan;

fn main() -> anyhow::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())
        .context("failed to load logging config file")?;
    run()
}

/// Drives the event loop to completion and turns an engine-fatal error into
/// the process exit status, after logging it.
fn run() -> anyhow::Result<()> {
    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::default();
    event_loop
        .run_app(&mut app)
        .context("event loop terminated abnormally")?;

    match app.app_state {
        AppState::Running => Ok(()),
        AppState::FatalError(e) => {
            log::error!("engine stopped with a fatal error: {e:?}");
            Err(e)
        }
    }
}
