use std::sync::Arc;
use std::time::{Duration, Instant};

use streamlines::prelude::*;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::ActiveEventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

/// Quiet period after panning or zooming before the field is regenerated.
const REFETCH_DELAY: Duration = Duration::from_millis(250);
/// Field texels per window pixel.
const FIELD_RESOLUTION: f64 = 0.25;
const MAX_SPEED: f32 = 1.5;

const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.05,
    g: 0.06,
    b: 0.09,
    a: 1.0,
};

/// Counter-rotating vortices around an island without data.
fn vortex_field(bbox: &BoundingBox, width: u32, height: u32) -> VelocityImage {
    let decode = LinearDecode::new(2.0 * MAX_SPEED, -MAX_SPEED, 2.0 * MAX_SPEED, -MAX_SPEED);
    let vortices = [(-40.0, 10.0, 1.0), (35.0, -15.0, -1.2), (5.0, 35.0, 0.6)];

    VelocityImage::from_fn(width, height, decode, |col, row| {
        let x = bbox.x_min + (col as f64 + 0.5) / width as f64 * bbox.width();
        let y = bbox.y_max - (row as f64 + 0.5) / height as f64 * bbox.height();
        if (x * x + y * y).sqrt() < 12.0 {
            return None;
        }

        let mut velocity = Vec2::new(0.2, 0.0);
        for (cx, cy, strength) in vortices {
            let (dx, dy) = ((x - cx) as f32, (y - cy) as f32);
            let falloff = (-(dx * dx + dy * dy) / 900.0).exp();
            velocity += Vec2::new(-dy, dx).normalize_or_zero() * strength * falloff;
        }
        Some(velocity.clamp_length_max(MAX_SPEED))
    })
}

fn next_style(style: StreamlineStyle) -> StreamlineStyle {
    match style {
        StreamlineStyle::LightParticlesOnMagnitude => StreamlineStyle::DarkParticlesOnMagnitude,
        StreamlineStyle::DarkParticlesOnMagnitude => StreamlineStyle::MagnitudeColoredParticles,
        StreamlineStyle::MagnitudeColoredParticles => StreamlineStyle::ColoredParticles,
        StreamlineStyle::ColoredParticles => StreamlineStyle::LightParticlesOnMagnitude,
    }
}

pub struct DemoState {
    surface: wgpu::Surface<'static>,
    context: GpuContext,
    pub config: wgpu::SurfaceConfiguration,
    visualiser: Visualiser,
    /// Box the current field was generated for.
    rendered_bbox: BoundingBox,
    /// Box currently shown in the window.
    view_bbox: BoundingBox,
    last_interaction: Option<Instant>,
    last_frame_time: Instant,
}

impl DemoState {
    pub async fn new(window: Arc<Window>, options: VisualiserOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(window)?;
        let (context, adapter) = GpuContext::request(&instance, Some(&surface)).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&context.device, &config);

        let aspect = config.width as f64 / config.height as f64;
        let view_bbox = BoundingBox::new(-60.0 * aspect, -60.0, 60.0 * aspect, 60.0);

        let mut visualiser = Visualiser::new(context.clone(), surface_format, config.width, config.height, options);
        visualiser.initialise(ColorMap::from_palette(Palette::Viridis, 0.0, MAX_SPEED))?;
        visualiser.set_error_callback(|error| log::error!("Field update failed: {error}"));

        let mut state = Self {
            surface,
            context,
            config,
            visualiser,
            rendered_bbox: view_bbox,
            view_bbox,
            last_interaction: None,
            last_frame_time: Instant::now(),
        };
        state.regenerate_field()?;
        state.visualiser.start()?;
        Ok(state)
    }

    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.context.device, &self.config);
            if let Err(e) = self.visualiser.set_dimensions(new_size.width, new_size.height) {
                log::error!("Resize failed: {e}");
            }
        }
    }

    /// Generate the field for the current view and drop the remap.
    fn regenerate_field(&mut self) -> Result<(), VisualiserError> {
        let width = ((self.config.width as f64 * FIELD_RESOLUTION) as u32).max(2);
        let height = ((self.config.height as f64 * FIELD_RESOLUTION) as u32).max(2);
        let image = vortex_field(&self.view_bbox, width, height);

        self.visualiser.handle_velocity_result(Ok(image), true)?;
        self.rendered_bbox = self.view_bbox;
        self.visualiser.set_bounding_box_scaling(BoundingBoxScaling::IDENTITY)?;
        self.last_interaction = None;
        if !self.visualiser.is_running() {
            self.visualiser.start()?;
        }
        Ok(())
    }

    fn view_changed(&mut self) {
        let scaling = BoundingBoxScaling::between(&self.rendered_bbox, &self.view_bbox);
        if let Err(e) = self.visualiser.set_bounding_box_scaling(scaling) {
            log::error!("Failed to update view: {e}");
        }
        self.last_interaction = Some(Instant::now());
    }

    pub fn pan(&mut self, dx_pixels: f64, dy_pixels: f64) {
        let dx = -dx_pixels / self.config.width as f64 * self.view_bbox.width();
        let dy = dy_pixels / self.config.height as f64 * self.view_bbox.height();
        self.view_bbox = self.view_bbox.translated(dx, dy);
        self.view_changed();
    }

    /// Zoom about the cursor. Positive `scroll` zooms in.
    pub fn zoom(&mut self, scroll: f32, cursor: Option<(f64, f64)>) {
        let (px, py) = cursor.unwrap_or((self.config.width as f64 * 0.5, self.config.height as f64 * 0.5));
        let clip = Vec2::new(
            (px / self.config.width as f64 * 2.0 - 1.0) as f32,
            (1.0 - py / self.config.height as f64 * 2.0) as f32,
        );
        let (cx, cy) = self.view_bbox.clip_to_map(clip);
        self.view_bbox = self.view_bbox.scaled_about(0.9_f64.powf(scroll as f64), cx, cy);
        self.view_changed();
    }

    pub fn end_interaction(&mut self) {
        self.last_interaction = Some(Instant::now());
    }

    pub fn toggle_running(&mut self) -> Result<(), VisualiserError> {
        if self.visualiser.is_running() {
            self.visualiser.stop()
        } else {
            self.visualiser.start()
        }
    }

    pub fn cycle_style(&mut self) -> Result<(), VisualiserError> {
        let style = next_style(self.visualiser.options().style);
        log::info!("Style: {style:?}");
        self.visualiser.update_options(OptionsUpdate {
            style: Some(style),
            ..Default::default()
        })
    }

    pub fn render(&mut self, dragging: bool) -> Result<(), wgpu::SurfaceError> {
        let now = Instant::now();
        let dt = (now - self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        if let Some(at) = self.last_interaction {
            if !dragging && now - at > REFETCH_DELAY {
                if let Err(e) = self.regenerate_field() {
                    log::error!("Failed to regenerate field: {e}");
                }
            }
        }

        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Background Encoder"),
            });
        {
            let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Background Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));

        if let Err(e) = self.visualiser.render_frame(dt, &view) {
            log::error!("Frame failed: {e}");
        }

        output.present();
        Ok(())
    }
}

pub struct App {
    options: VisualiserOptions,
    window: Option<Arc<Window>>,
    demo: Option<DemoState>,
    mouse_pressed: bool,
    last_mouse_pos: Option<(f64, f64)>,
    cursor: Option<(f64, f64)>,
}

impl App {
    pub fn new(options: VisualiserOptions) -> Self {
        Self {
            options,
            window: None,
            demo: None,
            mouse_pressed: false,
            last_mouse_pos: None,
            cursor: None,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window_attrs = Window::default_attributes()
                .with_title("Streamlines")
                .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));

            let window = match event_loop.create_window(window_attrs) {
                Ok(window) => Arc::new(window),
                Err(e) => {
                    log::error!("Failed to create window: {e}");
                    event_loop.exit();
                    return;
                }
            };
            self.window = Some(window.clone());
            match pollster::block_on(DemoState::new(window, self.options.clone())) {
                Ok(demo) => self.demo = Some(demo),
                Err(e) => {
                    log::error!("Failed to start visualiser: {e}");
                    event_loop.exit();
                }
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(physical_size) => {
                if let Some(demo) = &mut self.demo {
                    demo.resize(physical_size);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                if let Some(demo) = &mut self.demo {
                    let result = match code {
                        KeyCode::Space => demo.toggle_running(),
                        KeyCode::KeyS => demo.cycle_style(),
                        KeyCode::Escape => {
                            event_loop.exit();
                            Ok(())
                        }
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        log::error!("{e}");
                    }
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Left {
                    self.mouse_pressed = state == ElementState::Pressed;
                    if !self.mouse_pressed {
                        self.last_mouse_pos = None;
                        if let Some(demo) = &mut self.demo {
                            demo.end_interaction();
                        }
                    }
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = Some((position.x, position.y));
                if self.mouse_pressed {
                    if let Some((last_x, last_y)) = self.last_mouse_pos {
                        if let Some(demo) = &mut self.demo {
                            demo.pan(position.x - last_x, position.y - last_y);
                        }
                    }
                    self.last_mouse_pos = Some((position.x, position.y));
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let scroll = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 * 0.1,
                };
                if let Some(demo) = &mut self.demo {
                    demo.zoom(scroll, self.cursor);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(demo) = &mut self.demo {
                    match demo.render(self.mouse_pressed) {
                        Ok(_) => {}
                        Err(wgpu::SurfaceError::Lost) => demo.resize(winit::dpi::PhysicalSize {
                            width: demo.config.width,
                            height: demo.config.height,
                        }),
                        Err(wgpu::SurfaceError::OutOfMemory) => event_loop.exit(),
                        Err(e) => log::warn!("Render error: {e:?}"),
                    }
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}
