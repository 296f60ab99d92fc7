#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod renderer;
mod scene;
mod shaders;

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use clap::Parser;
use gwgpu::{
    ash::vk,
    device::Device,
    instance::{Instance, InstanceExtensions},
    surface::Surface,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes},
};

use renderer::Renderer;
use scene::{FpsMeter, Scene};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, clap::ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            // Off skips subscriber setup before this conversion can run;
            // the arm exists to keep the match total.
            LogLevel::Off => tracing::Level::ERROR,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for gwgpu::log::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        use CliVulkanLogLevel as C;
        match value {
            C::Verbose => Self::Verbose,
            C::Info => Self::Info,
            C::Warning => Self::Warning,
            C::Error => Self::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    /// Initial window width in logical pixels.
    #[arg(long, default_value_t = 800)]
    width: u32,
    /// Initial window height in logical pixels.
    #[arg(long, default_value_t = 600)]
    height: u32,
    /// Maximum level for the stdout and file log layers.
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
    /// Directory for the log file. Defaults to the platform run/data dir.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Enable Vulkan validation and route messages at or above this
    /// severity into the log.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
}

fn default_log_dir() -> eyre::Result<PathBuf> {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "geowars") {
        if let Some(runtime) = dirs.runtime_dir() {
            return Ok(runtime.to_owned());
        }
        return Ok(dirs.data_dir().to_owned());
    }
    Ok(std::env::current_dir()?)
}

/// Stand up a registry with a pretty stdout layer and a plain file layer,
/// both capped at the CLI level. `Off` leaves tracing uninitialized.
fn init_logging(args: &CliArgs) -> eyre::Result<()> {
    if args.log_level == LogLevel::Off {
        return Ok(());
    }

    let log_dir = match &args.log_dir {
        Some(dir) => dir.clone(),
        None => default_log_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let log_file_path = log_dir.join("geowars-log.txt");
    let log_file = File::create(&log_file_path)?;
    println!("Logging to {}", log_file_path.display());

    let stdout_layer = tracing_subscriber::fmt::layer().pretty();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let cap = tracing_subscriber::filter::LevelFilter::from_level(args.log_level.into());

    tracing_subscriber::registry()
        .with(stdout_layer.and_then(file_layer).with_filter(cap))
        .init();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();
    init_logging(&cli_args)?;
    tracing::debug!("Parsed CLI: {cli_args:?}");

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    // SAFETY: this loads the Vulkan shared library. The event loop serves
    // as the display source and outlives the instance.
    let instance = Arc::new(unsafe {
        Instance::new(
            "GeoWars",
            cli_args.graphics_debug_level.map(Into::into),
            Some(&event_loop),
            InstanceExtensions { surface: true },
        )
    }?);

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        instance,
        window_size: LogicalSize {
            width: cli_args.width,
            height: cli_args.height,
        },
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Suspended(SuspendedState),
    Exiting,
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    window_size: LogicalSize<u32>,
}

#[derive(Debug)]
struct RunningState {
    instance: Arc<Instance>,
    window: Arc<WinitWindow>,
    device: Arc<Device>,
    surface: Arc<Surface<WinitWindow>>,
    // `None` while the window is zero-sized. Running persists and the
    // renderer gets built on the first redraw with a real drawable.
    renderer: Option<Renderer>,
    scene: Scene,
    fps: FpsMeter,
}

#[derive(Debug)]
struct SuspendedState {
    instance: Arc<Instance>,
    window: Arc<WinitWindow>,
    device: Arc<Device>,
}

impl RunningState {
    /// Drive one frame. False means the app should exit.
    fn redraw(&mut self) -> bool {
        let window_size = self.window.inner_size();
        if window_size.width == 0 || window_size.height == 0 {
            tracing::trace!(
                "Skipping frame while the drawable is zero-sized: {}x{}",
                window_size.width,
                window_size.height
            );
            return true;
        }
        let drawable = vk::Extent2D {
            width: window_size.width,
            height: window_size.height,
        };

        if self.renderer.is_none() {
            match Renderer::new(&self.device, &self.surface, drawable) {
                Ok(renderer) => {
                    tracing::debug!(
                        "Created renderer for {}x{} drawable",
                        drawable.width,
                        drawable.height
                    );
                    self.renderer = Some(renderer);
                }
                Err(e) => {
                    tracing::error!("Renderer creation failed: {e}");
                    return false;
                }
            }
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return true;
        };

        let vertices = self.scene.advance();
        if let Err(e) = renderer.draw_frame(drawable, vertices) {
            tracing::error!("Frame failed: {e}");
            return false;
        }

        if let Some(fps) = self.fps.record_frame(Instant::now()) {
            tracing::info!("{fps:.1} fps");
        }
        true
    }
}

/// Build the renderer, or defer with `None` while the window has no
/// drawable area (minimized or not yet laid out).
fn renderer_for_window(
    device: &Arc<Device>,
    surface: &Arc<Surface<WinitWindow>>,
    window: &WinitWindow,
) -> Result<Option<Renderer>, renderer::CreateRendererError> {
    let window_size = window.inner_size();
    if window_size.width == 0 || window_size.height == 0 {
        tracing::trace!(
            "Deferring renderer creation, window extent is zero: {}x{}",
            window_size.width,
            window_size.height
        );
        return Ok(None);
    }
    Renderer::new(
        device,
        surface,
        vk::Extent2D {
            width: window_size.width,
            height: window_size.height,
        },
    )
    .map(Some)
}

/// Build the window, surface, device, and renderer for a fresh start.
fn start_fresh(init: InitializingState, event_loop: &ActiveEventLoop) -> App {
    let attrs = WindowAttributes::default()
        .with_title("Geometry Wars")
        .with_inner_size(init.window_size);
    let window = match event_loop.create_window(attrs) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            tracing::error!("Window creation failed: {e}");
            return App::Exiting;
        }
    };

    // SAFETY: suspend and exit both tear down every user of the surface
    // before the window goes away.
    let surface = match unsafe { Surface::new(&init.instance, Arc::clone(&window)) } {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Surface creation failed: {e}");
            return App::Exiting;
        }
    };

    let device = match Device::create_compatible(&init.instance, &surface) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            tracing::error!("Device creation failed: {e}");
            return App::Exiting;
        }
    };

    let renderer = match renderer_for_window(&device, &surface, &window) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Renderer creation failed: {e}");
            return App::Exiting;
        }
    };

    tracing::debug!("State transition: Initializing -> Running");
    App::Running(RunningState {
        instance: init.instance,
        window,
        device,
        surface,
        renderer,
        scene: Scene::new(),
        fps: FpsMeter::new(Instant::now()),
    })
}

/// Rebuild the surface and renderer against the kept window and device.
fn start_from_suspend(susp: SuspendedState, _event_loop: &ActiveEventLoop) -> App {
    // SAFETY: as in start_fresh, the surface never outlives the window.
    let surface = match unsafe { Surface::new(&susp.instance, Arc::clone(&susp.window)) } {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Surface creation failed: {e}");
            return App::Exiting;
        }
    };

    let renderer = match renderer_for_window(&susp.device, &surface, &susp.window) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Renderer creation failed: {e}");
            return App::Exiting;
        }
    };

    tracing::debug!("State transition: Suspended -> Running");
    App::Running(RunningState {
        instance: susp.instance,
        window: susp.window,
        device: susp.device,
        surface,
        renderer,
        scene: Scene::new(),
        fps: FpsMeter::new(Instant::now()),
    })
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let next = match self.take() {
            App::Initializing(init) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                start_fresh(init, event_loop)
            }
            App::Suspended(susp) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                start_from_suspend(susp, event_loop)
            }
            state => {
                tracing::warn!("resumed() outside Initializing or Suspended");
                state
            }
        };
        self.put(next, event_loop);
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        let next = match self.take() {
            App::Running(running) => {
                event_loop.set_control_flow(ControlFlow::Wait);

                // The renderer and surface drop below; nothing they own may
                // still be referenced by in-flight GPU work.
                if let Err(e) = running.device.wait_idle() {
                    tracing::error!("Device wait during suspend failed: {e}");
                    App::Exiting
                } else {
                    let RunningState {
                        instance,
                        window,
                        device,
                        ..
                    } = running;
                    tracing::debug!("State transition: Running -> Suspended");
                    App::Suspended(SuspendedState {
                        instance,
                        window,
                        device,
                    })
                }
            }
            state => state,
        };
        self.put(next, event_loop);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: winit::window::WindowId,
        window_event: winit::event::WindowEvent,
    ) {
        if !self.owns_window(window_id) {
            return;
        }

        match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close requested");
                self.shut_down(event_loop);
            }
            WindowEvent::Resized(size) => {
                tracing::trace!("Window resized to {}x{}", size.width, size.height);
                self.note_resize();
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                tracing::trace!("Scale factor changed to {scale_factor}");
                self.note_resize();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                tracing::debug!("Key {:?} is {:?}", event.logical_key, event.state);
            }
            WindowEvent::RedrawRequested => {
                let keep_going = match self.running_mut() {
                    Some(running) => running.redraw(),
                    None => return,
                };
                if !keep_going {
                    self.shut_down(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = self.running() {
            running.window.request_redraw();
        }
    }
}

impl AppRunner {
    /// The state is only ever vacant between a take and the matching put
    /// inside a single handler call.
    fn take(&mut self) -> App {
        self.0.take().expect("app state vacated outside a transition")
    }

    fn put(&mut self, state: App, event_loop: &ActiveEventLoop) {
        debug_assert!(self.0.is_none());
        if matches!(state, App::Exiting) {
            event_loop.exit();
        }
        self.0 = Some(state);
    }

    fn running(&self) -> Option<&RunningState> {
        match &self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn running_mut(&mut self) -> Option<&mut RunningState> {
        match &mut self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn owns_window(&self, window_id: winit::window::WindowId) -> bool {
        self.running().is_some_and(|s| s.window.id() == window_id)
    }

    fn note_resize(&mut self) {
        if let Some(running) = self.running_mut()
            && let Some(renderer) = running.renderer.as_mut()
        {
            renderer.note_resize();
        }
    }

    /// Tear down whatever state is current and leave the event loop.
    fn shut_down(&mut self, event_loop: &ActiveEventLoop) {
        match self.take() {
            App::Running(running) => {
                // Teardown destroys the swapchain and the scheduler's sync
                // objects; no GPU work may outlive them.
                if let Err(e) = running.device.wait_idle() {
                    tracing::error!("Device wait during exit failed: {e}");
                }
                drop(running);
                tracing::debug!("State transition: Running -> Exiting");
            }
            _ => {
                tracing::warn!("Exit requested outside the Running state");
            }
        }
        self.put(App::Exiting, event_loop);
    }
}
