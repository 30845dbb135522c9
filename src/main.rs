// =============================================================================
// VULKAN TEXTURED CUBE
// =============================================================================
//
// Brings up a window, a Vulkan device and everything needed to draw one
// rotating textured cube with depth testing.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS title)                       │
// │    └── Renderer (owns every GPU object, reverse-order teardown) │
// │          └── backend (device, swapchain, buffers, images, ...)  │
// │    └── ShaderWatcher (rebuilds the pipeline on SPIR-V change)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire swapchain image (signals "image acquired")
// 2. Update uniforms for the elapsed time
// 3. Submit the command buffer recorded for that image
// 4. Present the same image (waits on "image rendered")
// 5. Wait for the queue to drain
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod hot_reload;
mod renderer;
mod scene;

use anyhow::{Context, Result};
use config::{controls, Config};
use hot_reload::ShaderWatcher;
use renderer::Renderer;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting cube renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(e) = app.fatal_error.take() {
        return Err(e);
    }
    Ok(())
}

/// env_logger at Info (RUST_LOG overrides), writing to the configured log
/// file instead of stderr when enabled
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING (declared before the window so it drops first)
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer>,
    shader_watcher: Option<ShaderWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    fullscreen_key: Option<KeyCode>,
    quit_key: Option<KeyCode>,

    /// First error that ended the event loop, reported by main
    fatal_error: Option<anyhow::Error>,

    // ─────────────────────────────────────────────────────────────────────────
    // TIMING
    // ─────────────────────────────────────────────────────────────────────────
    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let fullscreen_key = parse_configured_key(&config.controls.fullscreen_key);
        let quit_key = parse_configured_key(&config.controls.quit_key);
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();

        Self {
            config,
            renderer: None,
            shader_watcher: None,
            window: None,
            is_fullscreen,
            fullscreen_key,
            quit_key,
            fatal_error: None,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Log the error, remember it for main and stop the event loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal_error.get_or_insert(error);
        event_loop.exit();
    }

    fn init_shader_watcher(&mut self) {
        if !self.config.debug.hot_reload_shaders {
            return;
        }
        let assets = &self.config.assets;
        match ShaderWatcher::new(&[
            assets.vertex_shader.as_path(),
            assets.fragment_shader.as_path(),
        ]) {
            Ok(watcher) => self.shader_watcher = Some(watcher),
            // Hot reload is a convenience, rendering carries on without it
            Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
        }
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn redraw(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        if self.shader_watcher.as_ref().is_some_and(ShaderWatcher::changed) {
            log::info!("Shader change detected, reloading");
            renderer.reload_shaders()?;
        }

        let elapsed = self.start_time.elapsed().as_secs_f32();
        if renderer.draw_frame(elapsed)? {
            self.update_fps();
        }
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Borderless on the current monitor
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // winit follows up with a Resized event that rebuilds the swapchain
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

fn parse_configured_key(name: &str) -> Option<KeyCode> {
    let key = controls::parse_key(name);
    if key.is_none() {
        log::warn!("Unknown key '{}' in config, binding disabled", name);
    }
    key
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.init_shader_watcher();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e.context("Render error"));
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    if Some(key) == self.quit_key {
                        log::info!("{:?} pressed, exiting...", key);
                        event_loop.exit();
                    } else if Some(key) == self.fullscreen_key {
                        self.toggle_fullscreen();
                    }
                }
            }

            _ => {}
        }
    }

    /// Keep drawing continuously
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // GPU objects must go before the window that backs the surface
        self.shader_watcher = None;
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
