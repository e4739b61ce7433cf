// =============================================================================
// VULKAN TRIANGLE - window shell around the presentation backend
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, redraw requests)              │
// │    └── Renderer (owns every GPU object, TeardownStack)          │
// │          └── Device + Swapchain + Pipeline                      │
// │                └── Pre-recorded command buffers                 │
// │                      └── FrameSynchronizer (fences, semaphores) │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence, then reset it
// 2. Acquire swapchain image
// 3. Submit the pre-recorded commands for that image
// 4. Present
// 5. Advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod renderer;

use anyhow::{Context, Result};
use backend::ShaderBinaries;
use config::Config;
use renderer::Renderer;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting Vulkan triangle");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        config.window.title
    );

    // Fail before any window exists if the shaders are missing or malformed
    let shaders = ShaderBinaries::load(&config.shaders.vertex, &config.shaders.fragment)
        .context("Failed to load shader binaries")?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, shaders);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer must go before the window
/// whose surface it presents to.
struct App {
    config: Config,
    shaders: ShaderBinaries,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    /// First unrecoverable error; ends the loop and becomes the exit status
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, shaders: ShaderBinaries) -> Self {
        Self {
            config,
            shaders,
            renderer: None,
            window: None,
            fatal: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        // Release GPU objects now; the loop may not return promptly on every platform
        self.renderer = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(window.as_ref(), &self.config, &self.shaders) {
            Ok(renderer) => {
                let extent = renderer.extent();
                log::info!("Rendering at {}x{}", extent.width, extent.height);
                self.renderer = Some(renderer);
            }
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                if let Err(e) = renderer.draw() {
                    self.fail(event_loop, anyhow::Error::new(e).context("Render error"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                log::debug!("Key {:?} {:?}", event.physical_key, event.state);

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; pacing comes from the frame fences.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            log::info!("Presented {} frames", renderer.frames_drawn());
        }
    }
}
