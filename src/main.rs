//! The lucarne binary: configuration, startup handshakes and the event
//! loop wiring around the compositor engine.

use std::{os::unix::io::AsFd, path::PathBuf, sync::Arc};

use calloop::{
    generic::Generic,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
    EventLoop, Interest, Mode, PostAction,
};
use clap::Parser;
use tracing::{debug, error, info, warn};
use x11rb::{connection::Connection as _, protocol::xproto::ConnectionExt as _, rust_connection::RustConnection};

use lucarne::{
    atoms::AtomRegistry,
    compositor::Compositor,
    config::Config,
    damage::DamageTracker,
    display::{self, CmRegistration, Extensions, ScreenInfo},
    error::Error,
    event,
    keys::LockMasks,
    paint::{self, PaintClock},
    plugin::PluginHost,
    render::{self, Renderer},
    window::{Window, WindowRegistry},
};

/// Adapter exposing the X connection's socket to calloop.
///
/// Readability of the socket is a wakeup hint, not a completeness
/// guarantee: replies read on the main thread can leave events queued
/// inside the connection with nothing left on the wire. Those are picked up
/// by the unconditional drain after every paint tick, one frame later at
/// worst.
#[derive(Debug)]
struct ConnectionFd(Arc<RustConnection>);

impl AsFd for ConnectionFd {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        self.0.stream().as_fd()
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "An X11 compositing manager")]
struct Args {
    /// Configuration directory path.
    #[arg(short = 'c', long = "config-path", value_name = "DIR")]
    config_path: Option<PathBuf>,

    /// Rendering backend name, overriding the configuration file.
    #[arg(short = 'r', long = "rendering", value_name = "NAME")]
    rendering: Option<String>,
}

struct State {
    comp: Compositor,
    backend: Box<dyn Renderer>,
    plugins: PluginHost,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}: {}", env!("CARGO_PKG_NAME"), err);
        std::process::exit(1);
    }
}

fn init_logging() {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();

    let (config, config_dir) = Config::load(args.config_path.as_deref())?;
    debug!(directory = %config_dir.display(), "Configuration loaded");
    if config.vsync_drm {
        warn!("vsync-drm is set but no VSync provider is compiled in");
    }

    let (conn, screen_nbr) = display::connect(None)?;
    let screen = conn.setup().roots[screen_nbr].clone();
    let root = screen.root;

    let mut atoms = AtomRegistry::new(&conn, screen_nbr)?;
    let extensions = Extensions::check_extensions(&conn)?;

    let rendering = args.rendering.unwrap_or_else(|| config.rendering.clone());
    let mut backend = render::by_name(&rendering).ok_or(Error::BackendLoadFailed(rendering))?;
    let mut plugins = PluginHost::load(&config.plugins);

    // Check ownership of _NET_WM_CM_Sn before claiming it (ICCCM).
    CmRegistration::check_other_compositor(&conn, &atoms)?;

    atoms.refresh_supported(&conn, root)?;

    let screen_info = ScreenInfo::query(
        &conn,
        root,
        screen.width_in_pixels,
        screen.height_in_pixels,
        extensions.randr.is_some(),
    )?;
    if extensions.randr.is_some() {
        ScreenInfo::select_screen_change(&conn, root)?;
    }

    let cm = CmRegistration::begin(&conn, &screen, &atoms)?;

    let clock = PaintClock::new(screen_info.refresh_rate_interval);
    let mut comp = Compositor {
        conn: conn.clone(),
        screen_nbr,
        root,
        atoms,
        extensions,
        screen: screen_info,
        cm,
        windows: WindowRegistry::new(conn.clone(), root, screen.width_in_pixels, screen.height_in_pixels),
        damage: DamageTracker::new(Arc::downgrade(&conn)),
        clock,
        lock_masks: LockMasks::default(),
        keysyms: None,
        background_reset: true,
    };

    backend.init(&mut comp)?;
    backend.init_finalise(&mut comp)?;

    // Validate everything requested so far and complete the selection claim
    // with the tagged PropertyNotify.
    sync_and_handle_startup(&mut comp, backend.as_mut())?;
    comp.cm.finalise(&comp.conn, &comp.atoms)?;

    // The server stays grabbed between the redirection and the initial tree
    // snapshot so the stack cannot change in between.
    conn.grab_server()?;
    let managed = {
        let ungrab = scopeguard::guard(conn.clone(), |conn| {
            let _ = conn.ungrab_server();
            let _ = conn.flush();
        });
        display::init_redirect(&conn, root)?;
        sync_and_handle_startup(&mut comp, backend.as_mut())?;
        let ids = display::query_existing_windows(&conn, root)?;
        let managed = comp.windows.manage_existing(&ids)?;
        drop(ungrab);
        managed
    };

    comp.refresh_key_mappings()?;
    plugins.check_requirements(&comp);
    plugins.window_manage_existing(&mut comp, &managed);

    // First paint covers the whole screen.
    comp.damage.force_repaint = true;

    run_loop(comp, backend, plugins)
}

/// Flushes, waits for the server to have processed everything, then runs
/// the startup event handler over all pending events. Any X error here is
/// fatal.
fn sync_and_handle_startup(comp: &mut Compositor, backend: &mut dyn Renderer) -> Result<(), Error> {
    comp.conn.get_input_focus()?.reply()?;
    let conn = comp.conn.clone();
    while let Some(event) = conn.poll_for_event()? {
        event::handle_startup_event(comp, backend, &event)?;
    }
    Ok(())
}

fn run_loop(
    comp: Compositor,
    backend: Box<dyn Renderer>,
    plugins: PluginHost,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut event_loop: EventLoop<'_, State> = EventLoop::try_new()?;
    let handle = event_loop.handle();

    let x11_source = Generic::new(ConnectionFd(comp.conn.clone()), Interest::READ, Mode::Level);
    let x11_loop_signal = event_loop.get_signal();
    handle
        .insert_source(x11_source, move |_, _, state: &mut State| {
            let State {
                comp,
                backend,
                plugins,
            } = state;
            if let Err(err) = event::drain_events(comp, backend.as_mut(), plugins, true) {
                // Connection errors are permanent; shut down cleanly.
                error!("Lost the X connection: {}", err);
                x11_loop_signal.stop();
            }
            comp.flush();
            Ok(PostAction::Continue)
        })
        .map_err(|err| err.to_string())?;

    // Painting must take precedence over event processing: the paint tick
    // drains the queue itself afterwards, and the drain in turn yields once
    // the repaint deadline is due.
    let timer = Timer::from_duration(comp.clock.interval());
    handle
        .insert_source(timer, |_, _, state: &mut State| {
            let State {
                comp,
                backend,
                plugins,
            } = state;
            let next = paint::paint_tick(comp, backend.as_mut(), plugins);
            if let Err(err) = event::drain_events(comp, backend.as_mut(), plugins, true) {
                warn!("Failed to drain X11 events after paint: {}", err);
            }
            comp.flush();
            TimeoutAction::ToDuration(next)
        })
        .map_err(|err| err.to_string())?;

    let signals = Signals::new(&[Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM])?;
    let loop_signal = event_loop.get_signal();
    handle
        .insert_source(signals, move |_, _, _| {
            info!("Received termination signal");
            loop_signal.stop();
        })
        .map_err(|err| err.to_string())?;

    let mut state = State {
        comp,
        backend,
        plugins,
    };
    state.comp.flush();

    event_loop.run(None, &mut state, |_| {})?;

    drop(handle);
    drop(event_loop);

    cleanup(state);
    Ok(())
}

/// Releases server-side resources in reverse order of acquisition. The
/// selection window goes last, after a final sync, so `_NET_WM_CM_Sn` is
/// visibly released to other clients.
fn cleanup(state: State) {
    debug!("Cleaning resources up");

    let State {
        mut comp,
        mut backend,
        plugins,
    } = state;

    // Plugins may hold window handles, so they unwind before the records.
    drop(plugins);

    let windows: Vec<Window> = comp.windows.windows().cloned().collect();
    for window in windows {
        comp.windows.remove(&window, backend.as_mut(), true);
    }
    drop(backend);

    comp.damage.reset();

    let conn = comp.conn.clone();
    let cm_window = comp.cm.window();
    drop(comp);

    if let Ok(cookie) = conn.get_input_focus() {
        let _ = cookie.reply();
    }
    let _ = conn.destroy_window(cm_window);
    let _ = conn.flush();
}
