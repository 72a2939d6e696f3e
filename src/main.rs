// SPDX-License-Identifier: MPL-2.0

//! Video wallpaper daemon: one background layer surface per output, each
//! driven by its own [`WallpaperEngine`].

mod decode_target;
mod engine;
mod gpu;
mod media;
mod renderer;
mod signals;
mod status_color;
mod transform;

use std::{ffi::c_void, ptr::NonNull, rc::Rc, sync::Arc};

use calloop::signals::{Signal as UnixSignal, Signals};
use eyre::WrapErr;
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, WaylandDisplayHandle, WaylandWindowHandle,
};
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop::{EventLoop, LoopHandle},
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, Proxy, QueueHandle,
            globals::registry_queue_init,
            protocol::{wl_output, wl_surface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
    },
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vidpaper_config::ConfigStore;

use engine::{EngineConfig, EngineHost, EngineId, LogNotifier, Services, WallpaperEngine};
use gpu::{PlatformSurface, WgpuFactory};
use media::MediaBackend;

fn main() -> color_eyre::Result<()> {
    init_logger();
    color_eyre::install()?;

    let conn = Connection::connect_to_env().wrap_err("failed to connect to the Wayland display")?;

    let mut event_loop: EventLoop<'static, VidPaper> = EventLoop::try_new()?;

    let (globals, event_queue) = registry_queue_init(&conn)?;
    let qh = event_queue.handle();
    WaylandSource::new(conn.clone(), event_queue)
        .insert(event_loop.handle())
        .map_err(|err| eyre::eyre!("{}", err))?;

    let store = ConfigStore::open(ConfigStore::default_path()?);
    let services = Services {
        gpu: Arc::new(WgpuFactory),
        media: media_backend()?,
        notifier: Rc::new(LogNotifier),
        store: store.clone(),
    };

    let _watcher = signals::watch_config(&event_loop.handle(), store, |signal, state: &mut VidPaper| {
        for wallpaper in &mut state.wallpapers {
            wallpaper.engine.on_signal(signal);
        }
    })?;

    event_loop
        .handle()
        .insert_source(
            Signals::new(&[UnixSignal::SIGINT, UnixSignal::SIGTERM])?,
            |event, _, state: &mut VidPaper| {
                info!(signal = ?event.signal(), "shutting down");
                state.exit = true;
            },
        )
        .map_err(|err| eyre::eyre!("{}", err))?;

    let mut state = VidPaper {
        registry_state: RegistryState::new(&globals),
        output_state: OutputState::new(&globals, &qh),
        compositor_state: CompositorState::bind(&globals, &qh)?,
        layer_shell: LayerShell::bind(&globals, &qh)?,
        connection: conn,
        handle: event_loop.handle(),
        services,
        config: EngineConfig::default(),
        wallpapers: Vec::new(),
        next_id: 0,
        exit: false,
    };

    while !state.exit {
        event_loop.dispatch(None, &mut state)?;
    }

    for wallpaper in &mut state.wallpapers {
        wallpaper.engine.engine_destroyed();
    }

    Ok(())
}

fn init_logger() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,vidpaper=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().without_time())
        .with(filter)
        .init();
}

#[cfg(feature = "animated")]
fn media_backend() -> eyre::Result<Rc<dyn MediaBackend>> {
    Ok(Rc::new(media::GstBackend::new()?))
}

#[cfg(not(feature = "animated"))]
fn media_backend() -> eyre::Result<Rc<dyn MediaBackend>> {
    eyre::bail!("built without video decoding; enable the `animated` feature")
}

/// Raw handles wgpu needs to render straight into the layer surface.
fn platform_surface(
    conn: &Connection,
    surface: &wl_surface::WlSurface,
    width: u32,
    height: u32,
) -> Option<PlatformSurface> {
    let display = NonNull::new(conn.backend().display_ptr().cast::<c_void>())?;
    let window = NonNull::new(surface.id().as_ptr().cast::<c_void>())?;

    Some(PlatformSurface {
        display: RawDisplayHandle::Wayland(WaylandDisplayHandle::new(display)),
        window: RawWindowHandle::Wayland(WaylandWindowHandle::new(window)),
        width,
        height,
    })
}

pub struct VidPaperWallpaper {
    output: wl_output::WlOutput,
    layer: LayerSurface,
    engine: WallpaperEngine<VidPaper>,
    configured: bool,
}

pub struct VidPaper {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    layer_shell: LayerShell,
    connection: Connection,
    handle: LoopHandle<'static, VidPaper>,
    services: Services,
    config: EngineConfig,

    wallpapers: Vec<VidPaperWallpaper>,
    next_id: EngineId,
    exit: bool,
}

impl EngineHost for VidPaper {
    fn engine_mut(&mut self, id: EngineId) -> Option<&mut WallpaperEngine<Self>> {
        self.wallpapers
            .iter_mut()
            .map(|wallpaper| &mut wallpaper.engine)
            .find(|engine| engine.id() == id)
    }
}

impl VidPaper {
    fn remove_wallpaper(&mut self, index: usize) {
        let mut wallpaper = self.wallpapers.remove(index);
        debug!(
            id = wallpaper.engine.id(),
            phase = ?wallpaper.engine.phase(),
            playhead = ?wallpaper.engine.playhead(),
            "removing wallpaper"
        );
        // The render thread must be gone before the surface it draws to.
        wallpaper.engine.engine_destroyed();
    }

    /// A wallpaper counts as visible while its surface is on its own output.
    fn output_visibility(
        &mut self,
        surface: &wl_surface::WlSurface,
        output: &wl_output::WlOutput,
        visible: bool,
    ) {
        let Some(wallpaper) = self
            .wallpapers
            .iter_mut()
            .find(|w| w.configured && w.layer.wl_surface() == surface && &w.output == output)
        else {
            return;
        };

        debug!(id = wallpaper.engine.id(), visible, "output visibility changed");
        wallpaper.engine.visibility_changed(visible);
    }
}

impl CompositorHandler for VidPaper {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        output: &wl_output::WlOutput,
    ) {
        self.output_visibility(surface, output, true);
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &wl_surface::WlSurface,
        output: &wl_output::WlOutput,
    ) {
        self.output_visibility(surface, output, false);
    }
}

impl OutputHandler for VidPaper {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        if self.wallpapers.iter().any(|w| w.output == wl_output) {
            return;
        }

        let name = self
            .output_state
            .info(&wl_output)
            .and_then(|info| info.name)
            .unwrap_or_default();

        let id = self.next_id;
        let engine = match WallpaperEngine::new(
            id,
            self.handle.clone(),
            self.services.clone(),
            self.config,
        ) {
            Ok(engine) => engine,
            Err(why) => {
                error!(?why, output = %name, "failed to create wallpaper engine");
                return;
            }
        };
        self.next_id += 1;

        let surface = self.compositor_state.create_surface(qh);
        let layer = self.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Background,
            Some("wallpaper"),
            Some(&wl_output),
        );
        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer.set_size(0, 0);
        layer.commit();

        info!(id, output = %name, "wallpaper created");

        self.wallpapers.push(VidPaperWallpaper {
            output: wl_output,
            layer,
            engine,
            configured: false,
        });
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        if let Some(index) = self.wallpapers.iter().position(|w| w.output == output) {
            self.remove_wallpaper(index);
        }
    }
}

impl LayerShellHandler for VidPaper {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        if let Some(index) = self.wallpapers.iter().position(|w| &w.layer == layer) {
            warn!("compositor closed a wallpaper surface");
            self.remove_wallpaper(index);
        }
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let Some(wallpaper) = self.wallpapers.iter_mut().find(|w| &w.layer == layer) else {
            return;
        };

        let (width, height) = configure.new_size;

        if wallpaper.configured {
            wallpaper.engine.surface_resized(width, height);
            return;
        }

        let Some(surface) =
            platform_surface(&self.connection, wallpaper.layer.wl_surface(), width, height)
        else {
            error!(id = wallpaper.engine.id(), "wayland surface has no native handle");
            return;
        };

        wallpaper.configured = true;
        wallpaper.engine.surface_created(surface);
        wallpaper.engine.visibility_changed(true);
    }
}

delegate_compositor!(VidPaper);
delegate_output!(VidPaper);
delegate_layer!(VidPaper);
delegate_registry!(VidPaper);

impl ProvidesRegistryState for VidPaper {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}
