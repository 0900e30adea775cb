use anyhow::Context;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::engine::Engine;

#[derive(Default)]
pub enum AppState {
    #[default]
    Running,
    FatalError(anyhow::Error),
}

#[derive(Default)]
pub struct App {
    window: Option<Window>,
    engine: Option<Engine>,
    pub app_state: AppState,
}

const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        self.app_state = AppState::FatalError(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let window = match event_loop.create_window(
            Window::default_attributes()
                .with_title("Ember")
                .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT)),
        ) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, e.into());
                return;
            }
        };

        let engine = match Engine::new(&window).context("failed to create engine") {
            Ok(e) => e,
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        };

        self.window = Some(window);
        self.engine = Some(engine);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::debug!("The close button was pressed; stopping");
                if let Some(mut engine) = self.engine.take() {
                    if let Err(e) = engine.shutdown() {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.resized(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.draw().context("failed to draw frame") {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }
            _ => (),
        }
    }
}
