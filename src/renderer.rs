// =============================================================================
// RENDERER - owns every GPU object needed to draw the textured cube
// =============================================================================
//
// CREATION ORDER (and the reverse is the teardown order):
// ┌─────────────────────────────────────────────────────────────────┐
// │  device (instance, surface, GPU, queue, allocator)              │
// │    └── command pool (setup transfers record into it)            │
// │          └── swapchain + views ── depth buffer                  │
// │                └── vertex / index / uniform buffers             │
// │                      └── texture (staged upload) ── descriptors │
// │                            └── render pass ── pipeline          │
// │                                  └── framebuffers               │
// │                                        └── command buffers      │
// │                                              └── semaphores     │
// └─────────────────────────────────────────────────────────────────┘
//
// Rust drops struct fields in declaration order, so the fields below are
// declared in reverse creation order.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use rwh_05::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use winit::window::Window;

use crate::assets::TextureData;
use crate::backend::buffer::Buffer;
use crate::backend::command::CommandPool;
use crate::backend::descriptor::Descriptors;
use crate::backend::image::{self, DepthBuffer, Texture};
use crate::backend::pipeline::{Framebuffers, Pipeline, RenderPass};
use crate::backend::shader::ShaderModule;
use crate::backend::swapchain::Acquire;
use crate::backend::sync::FrameSync;
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::scene::{Uniforms, CUBE_INDICES, CUBE_VERTICES};

pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // PER-FRAME OBJECTS (created last, destroyed first)
    // ─────────────────────────────────────────────────────────────────────────
    sync: FrameSync,
    /// One pre-recorded command buffer per swapchain image.
    /// Freed explicitly on recreation; otherwise released with the pool.
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Framebuffers,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE STATE
    // ─────────────────────────────────────────────────────────────────────────
    pipeline: Pipeline,
    render_pass: RenderPass,
    descriptors: Descriptors,

    // ─────────────────────────────────────────────────────────────────────────
    // SCENE RESOURCES
    // ─────────────────────────────────────────────────────────────────────────
    // Only referenced through the descriptor set
    _texture: Texture,
    uniform_buffer: Buffer,
    index_buffer: Buffer,
    vertex_buffer: Buffer,

    // ─────────────────────────────────────────────────────────────────────────
    // PRESENTATION
    // ─────────────────────────────────────────────────────────────────────────
    // Only referenced through the framebuffers
    _depth: DepthBuffer,
    swapchain: Swapchain,

    command_pool: CommandPool,
    device: Arc<VulkanDevice>,

    // ─────────────────────────────────────────────────────────────────────────
    // SETTINGS & STATE FLAGS
    // ─────────────────────────────────────────────────────────────────────────
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    field_of_view: f32,
    /// Degrees per second about the Y axis
    rotation_speed: f32,
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    /// Latest non-zero window size, used when the swapchain is rebuilt
    window_size: (u32, u32),
    needs_recreate: bool,
    is_minimized: bool,
}

impl Renderer {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device, surface and allocator
        // ─────────────────────────────────────────────────────────────────────
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        // Validation only in debug builds, and only if the config asks for it
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(
            &config.window.title,
            enable_validation,
            display_handle,
            window_handle,
        )?;

        let command_pool = CommandPool::new(device.clone())?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain and depth buffer
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let window_size = (size.width.max(1), size.height.max(1));
        let present_mode = config.present_mode();
        let swapchain = Swapchain::new(
            device.clone(),
            present_mode,
            window_size.0,
            window_size.1,
            None,
        )?;

        let depth_format = image::supported_depth_format(&device)?;
        let depth = DepthBuffer::new(device.clone(), &command_pool, depth_format, swapchain.extent)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Geometry and uniforms
        // ─────────────────────────────────────────────────────────────────────
        let vertex_buffer = Buffer::with_data(
            device.clone(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &CUBE_VERTICES,
            "cube vertices",
        )?;
        let index_buffer = Buffer::with_data(
            device.clone(),
            vk::BufferUsageFlags::INDEX_BUFFER,
            &CUBE_INDICES,
            "cube indices",
        )?;
        let uniform_buffer = Buffer::new(
            device.clone(),
            std::mem::size_of::<Uniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "uniforms",
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Texture and descriptor set
        // ─────────────────────────────────────────────────────────────────────
        let texture_data = TextureData::load_or_fallback(&config.assets.texture);
        let texture = Texture::upload(device.clone(), &command_pool, &texture_data)?;
        let descriptors = Descriptors::new(device.clone(), &uniform_buffer, &texture)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Render pass, pipeline, framebuffers
        // ─────────────────────────────────────────────────────────────────────
        let render_pass = RenderPass::new(device.clone(), swapchain.format, depth_format)?;
        let pipeline = build_pipeline(
            &device,
            &render_pass,
            &descriptors,
            &config.assets.vertex_shader,
            &config.assets.fragment_shader,
        )?;
        let framebuffers = Framebuffers::new(
            device.clone(),
            render_pass.render_pass,
            &swapchain.image_views,
            depth.view,
            swapchain.extent,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Command buffers and semaphores
        // ─────────────────────────────────────────────────────────────────────
        let command_buffers = command_pool.allocate(swapchain.images.len() as u32)?;
        let sync = FrameSync::new(device.clone())?;

        let renderer = Self {
            sync,
            command_buffers,
            framebuffers,
            pipeline,
            render_pass,
            descriptors,
            _texture: texture,
            uniform_buffer,
            index_buffer,
            vertex_buffer,
            _depth: depth,
            swapchain,
            command_pool,
            device,
            depth_format,
            present_mode,
            clear_color: config.graphics.clear_color,
            field_of_view: config.graphics.field_of_view,
            rotation_speed: config.graphics.rotation_speed,
            vertex_shader: config.assets.vertex_shader.clone(),
            fragment_shader: config.assets.fragment_shader.clone(),
            window_size,
            needs_recreate: false,
            is_minimized: size.width == 0 || size.height == 0,
        };
        renderer.record_command_buffers()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Draw one frame with the cube rotated for `elapsed_seconds`.
    /// Returns false when nothing was presented (minimised or out of date).
    pub fn draw_frame(&mut self, elapsed_seconds: f32) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }

        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let acquired = self.swapchain.acquire_next_image(self.sync.image_acquired)?;
        let FramePlan::Draw { command_buffer, image_index, recreate } =
            FramePlan::from_acquire(acquired, self.command_buffers.len())?
        else {
            self.needs_recreate = true;
            return Ok(false);
        };
        // A suboptimal image is still drawn; the semaphore is already signalled
        self.needs_recreate |= recreate;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Update uniforms
        // ─────────────────────────────────────────────────────────────────────
        // The queue is idle after every frame, so the single buffer is free
        let angle = self.rotation_speed.to_radians() * elapsed_seconds;
        let uniforms = Uniforms::new(self.swapchain.aspect_ratio(), self.field_of_view, angle);
        self.uniform_buffer.write(&[uniforms])?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Submit the command buffer recorded for this image
        // ─────────────────────────────────────────────────────────────────────
        let command_buffers = [self.command_buffers[command_buffer]];
        let wait_semaphores = [self.sync.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.sync.image_rendered];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit draw command buffer")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Present the same image
        // ─────────────────────────────────────────────────────────────────────
        let present_wants_recreate = self.swapchain.present(
            self.device.graphics_queue,
            image_index,
            &signal_semaphores,
        )?;
        self.needs_recreate |= present_wants_recreate;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Wait for the GPU before touching the uniforms again
        // ─────────────────────────────────────────────────────────────────────
        unsafe { self.device.device.queue_wait_idle(self.device.graphics_queue) }
            .context("Failed to wait for graphics queue")?;

        Ok(true)
    }

    /// Window size changed. Zero in either dimension means minimised.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            self.is_minimized = true;
            return;
        }
        self.is_minimized = false;
        self.window_size = (width, height);
        self.needs_recreate = true;
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    /// Rebuild everything sized by the swapchain
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let (width, height) = self.window_size;
        log::info!("Recreating swapchain: {}x{}", width, height);

        // The old chain is retired by the new one, then dropped below
        let swapchain = Swapchain::new(
            self.device.clone(),
            self.present_mode,
            width,
            height,
            Some(&self.swapchain),
        )?;

        if swapchain.format != self.swapchain.format {
            log::info!("Surface format changed to {:?}, rebuilding render pass", swapchain.format);
            let render_pass =
                RenderPass::new(self.device.clone(), swapchain.format, self.depth_format)?;
            let pipeline = build_pipeline(
                &self.device,
                &render_pass,
                &self.descriptors,
                &self.vertex_shader,
                &self.fragment_shader,
            )?;
            self.pipeline = pipeline;
            self.render_pass = render_pass;
        }

        let depth = DepthBuffer::new(
            self.device.clone(),
            &self.command_pool,
            self.depth_format,
            swapchain.extent,
        )?;
        let framebuffers = Framebuffers::new(
            self.device.clone(),
            self.render_pass.render_pass,
            &swapchain.image_views,
            depth.view,
            swapchain.extent,
        )?;

        // Replace in teardown order: framebuffers, depth, then the old chain
        self.framebuffers = framebuffers;
        self._depth = depth;
        self.swapchain = swapchain;

        // The image count may have changed
        self.command_pool.free(&self.command_buffers);
        self.command_buffers = self
            .command_pool
            .allocate(self.swapchain.images.len() as u32)?;
        self.record_command_buffers()?;

        self.needs_recreate = false;
        Ok(())
    }

    // =========================================================================
    // SHADER HOT RELOAD
    // =========================================================================

    /// Rebuild the pipeline from the SPIR-V on disk. A broken shader leaves
    /// the current pipeline in place.
    pub fn reload_shaders(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        let pipeline = match build_pipeline(
            &self.device,
            &self.render_pass,
            &self.descriptors,
            &self.vertex_shader,
            &self.fragment_shader,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("Shader reload failed, keeping previous pipeline: {:#}", e);
                return Ok(());
            }
        };

        self.pipeline = pipeline;
        self.record_command_buffers()?;
        log::info!("Shaders reloaded");
        Ok(())
    }

    // =========================================================================
    // COMMAND RECORDING
    // =========================================================================

    /// Record the cube draw into every command buffer.
    /// Contents only change on recreation or shader reload, so they are
    /// recorded once and resubmitted each frame.
    fn record_command_buffers(&self) -> Result<()> {
        let device = &self.device.device;
        let extent = self.swapchain.extent;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        for (&cmd, &framebuffer) in self
            .command_buffers
            .iter()
            .zip(&self.framebuffers.framebuffers)
        {
            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .context("Failed to begin command buffer")?;

                let render_pass_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.render_pass.render_pass)
                    .framebuffer(framebuffer)
                    .render_area(render_area)
                    .clear_values(&clear_values);
                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.pipeline,
                );
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[render_area]);

                device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    self.index_buffer.buffer,
                    0,
                    vk::IndexType::UINT16,
                );
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.layout,
                    0,
                    &[self.descriptors.set],
                    &[],
                );

                device.cmd_draw_indexed(cmd, CUBE_INDICES.len() as u32, 1, 0, 0, 0);

                device.cmd_end_render_pass(cmd);
                device
                    .end_command_buffer(cmd)
                    .context("Failed to end command buffer")?;
            }
        }

        log::debug!("Recorded {} command buffers", self.command_buffers.len());
        Ok(())
    }
}

/// Load both shader stages and build the cube pipeline. The modules are
/// only needed until the pipeline exists.
fn build_pipeline(
    device: &Arc<VulkanDevice>,
    render_pass: &RenderPass,
    descriptors: &Descriptors,
    vertex_shader: &Path,
    fragment_shader: &Path,
) -> Result<Pipeline> {
    let vert = ShaderModule::from_file(device.clone(), vertex_shader)?;
    let frag = ShaderModule::from_file(device.clone(), fragment_shader)?;
    Pipeline::new(
        device.clone(),
        render_pass.render_pass,
        descriptors.layout,
        &vert,
        &frag,
    )
}

// =============================================================================
// FRAME PLANNING
// =============================================================================

/// What a frame does with the result of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePlan {
    /// No image to draw into; rebuild the swapchain first
    Skip,
    /// Submit the buffer recorded for `image_index`, then present that image
    Draw {
        command_buffer: usize,
        image_index: u32,
        /// The image is usable but the swapchain should be rebuilt afterwards
        recreate: bool,
    },
}

impl FramePlan {
    fn from_acquire(acquire: Acquire, command_buffer_count: usize) -> Result<Self> {
        match acquire {
            Acquire::OutOfDate => Ok(Self::Skip),
            Acquire::Image { index, suboptimal } => {
                let command_buffer = index as usize;
                anyhow::ensure!(
                    command_buffer < command_buffer_count,
                    "Acquired image {} but only {} command buffers are recorded",
                    index,
                    command_buffer_count
                );
                Ok(Self::Draw {
                    command_buffer,
                    image_index: index,
                    recreate: suboptimal,
                })
            }
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be in use when the fields start dropping
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle during cleanup failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn acquired_index_is_submitted_and_presented() {
        let plan = FramePlan::from_acquire(Acquire::Image { index: 2, suboptimal: false }, 3).unwrap();
        assert_eq!(
            plan,
            FramePlan::Draw { command_buffer: 2, image_index: 2, recreate: false }
        );
    }

    #[test]
    fn suboptimal_image_is_drawn_then_rebuilt() {
        let plan = FramePlan::from_acquire(Acquire::Image { index: 0, suboptimal: true }, 3).unwrap();
        assert_eq!(
            plan,
            FramePlan::Draw { command_buffer: 0, image_index: 0, recreate: true }
        );
    }

    #[test]
    fn out_of_date_skips_the_frame() {
        assert_eq!(FramePlan::from_acquire(Acquire::OutOfDate, 3).unwrap(), FramePlan::Skip);
        // even with nothing recorded yet
        assert_eq!(FramePlan::from_acquire(Acquire::OutOfDate, 0).unwrap(), FramePlan::Skip);
    }

    #[test]
    fn image_without_a_recorded_buffer_is_an_error() {
        assert!(FramePlan::from_acquire(Acquire::Image { index: 3, suboptimal: false }, 3).is_err());
    }

    /// Pushes its name into a shared log when dropped
    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    /// Same GPU fields, in the same order, as Renderer
    struct Teardown {
        _sync: Recorder,
        _command_buffers: Recorder,
        _framebuffers: Recorder,
        _pipeline: Recorder,
        _render_pass: Recorder,
        _descriptors: Recorder,
        _texture: Recorder,
        _uniform_buffer: Recorder,
        _index_buffer: Recorder,
        _vertex_buffer: Recorder,
        _depth: Recorder,
        _swapchain: Recorder,
        _command_pool: Recorder,
        _device: Recorder,
    }

    #[test]
    fn resources_drop_in_reverse_creation_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = |name| Recorder { name, log: log.clone() };

        // Creation order of Renderer::new
        let device = make("device");
        let command_pool = make("command_pool");
        let swapchain = make("swapchain");
        let depth = make("depth");
        let vertex_buffer = make("vertex_buffer");
        let index_buffer = make("index_buffer");
        let uniform_buffer = make("uniform_buffer");
        let texture = make("texture");
        let descriptors = make("descriptors");
        let render_pass = make("render_pass");
        let pipeline = make("pipeline");
        let framebuffers = make("framebuffers");
        let command_buffers = make("command_buffers");
        let sync = make("sync");

        drop(Teardown {
            _sync: sync,
            _command_buffers: command_buffers,
            _framebuffers: framebuffers,
            _pipeline: pipeline,
            _render_pass: render_pass,
            _descriptors: descriptors,
            _texture: texture,
            _uniform_buffer: uniform_buffer,
            _index_buffer: index_buffer,
            _vertex_buffer: vertex_buffer,
            _depth: depth,
            _swapchain: swapchain,
            _command_pool: command_pool,
            _device: device,
        });

        let mut created = vec![
            "device",
            "command_pool",
            "swapchain",
            "depth",
            "vertex_buffer",
            "index_buffer",
            "uniform_buffer",
            "texture",
            "descriptors",
            "render_pass",
            "pipeline",
            "framebuffers",
            "command_buffers",
            "sync",
        ];
        created.reverse();
        assert_eq!(*log.borrow(), created);
    }
}
