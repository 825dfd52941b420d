//! Typed routing of X events.
//!
//! One decoded event per call: the dispatcher resolves the window record,
//! mutates the registry, grows the global damage region and fans the event
//! out to the plugins. x11rb already folds the dynamic `first_event` bases
//! of the Damage and RandR extensions into its typed [`Event`] enum; the
//! extension opcodes recorded by the gate are only needed here to label
//! protocol errors.
//!
//! Unknown event types are ignored. In-flight X errors are logged with
//! decoded labels and are never fatal once startup is over: they mean the
//! window involved is no longer valid and the next event will say so.

use std::borrow::Cow;
use std::time::Instant;

use tracing::{debug, trace, warn};
use x11rb::{
    connection::Connection as _,
    protocol::{
        composite, damage, randr,
        xfixes::{self, ConnectionExt as _},
        xproto::{
            CirculateNotifyEvent, ConfigureNotifyEvent, CreateNotifyEvent, DestroyNotifyEvent,
            MapNotifyEvent, Mapping, MappingNotifyEvent, Place, PropertyNotifyEvent,
            ReparentNotifyEvent, UnmapNotifyEvent,
        },
        Event,
    },
    x11_utils::X11Error,
};

use crate::{
    compositor::Compositor,
    display::ScreenInfo,
    error::Error,
    plugin::PluginHost,
    render::Renderer,
    window::{DamageDecision, Geometry, MapState, ServerRegion, Window},
};

/// Request labels of the Composite extension, indexed by minor opcode.
const COMPOSITE_REQUEST_LABELS: &[&str] = &[
    "CompositeQueryVersion",
    "CompositeRedirectWindow",
    "CompositeRedirectSubwindows",
    "CompositeUnredirectWindow",
    "CompositeUnredirectWindows",
    "CompositeCreateRegionFromBorderClip",
    "CompositeNameWindowPixmap",
    "CompositeGetOverlayWindow",
    "CompositeReleaseOverlayWindow",
];

/// Request labels of the XFixes extension, indexed by minor opcode.
const XFIXES_REQUEST_LABELS: &[&str] = &[
    "XFixesQueryVersion",
    "XFixesChangeSaveSet",
    "XFixesSelectSelectionInput",
    "XFixesSelectCursorInput",
    "XFixesGetCursorImage",
    "XFixesCreateRegion",
    "XFixesCreateRegionFromBitmap",
    "XFixesCreateRegionFromWindow",
    "XFixesCreateRegionFromGC",
    "XFixesCreateRegionFromPicture",
    "XFixesDestroyRegion",
    "XFixesSetRegion",
    "XFixesCopyRegion",
    "XFixesUnionRegion",
    "XFixesIntersectRegion",
    "XFixesSubtractRegion",
    "XFixesInvertRegion",
    "XFixesTranslateRegion",
    "XFixesRegionExtents",
    "XFixesFetchRegion",
    "XFixesSetGCClipRegion",
    "XFixesSetWindowShapeRegion",
    "XFixesSetPictureClipRegion",
    "XFixesSetCursorName",
    "XFixesGetCursorName",
    "XFixesGetCursorImageAndName",
    "XFixesChangeCursor",
    "XFixesChangeCursorByName",
    "XFixesExpandRegion",
    "XFixesHideCursor",
    "XFixesShowCursor",
];

/// Request labels of the Damage extension, indexed by minor opcode.
const DAMAGE_REQUEST_LABELS: &[&str] = &[
    "DamageQueryVersion",
    "DamageCreate",
    "DamageDestroy",
    "DamageSubtract",
    "DamageAdd",
];

fn extension_request_label(labels: &'static [&'static str], minor_opcode: u16) -> Option<&'static str> {
    labels.get(usize::from(minor_opcode)).copied()
}

fn request_label(
    comp: &Compositor,
    backend: &dyn Renderer,
    major_opcode: u8,
    minor_opcode: u16,
    fallback: Option<&'static str>,
) -> Cow<'static, str> {
    let label = if backend.is_request(major_opcode) {
        backend.request_label(minor_opcode)
    } else if major_opcode == comp.extensions.composite.major_opcode {
        extension_request_label(COMPOSITE_REQUEST_LABELS, minor_opcode)
    } else if major_opcode == comp.extensions.xfixes.major_opcode {
        extension_request_label(XFIXES_REQUEST_LABELS, minor_opcode)
    } else if major_opcode == comp.extensions.damage.major_opcode {
        extension_request_label(DAMAGE_REQUEST_LABELS, minor_opcode)
    } else {
        fallback
    };

    match label {
        Some(label) => Cow::Borrowed(label),
        None => Cow::Owned(format!("Unknown(major={}, minor={})", major_opcode, minor_opcode)),
    }
}

fn error_label(comp: &Compositor, backend: &dyn Renderer, error: &X11Error) -> Cow<'static, str> {
    if let Some(label) = backend.error_label(error.error_code) {
        return Cow::Borrowed(label);
    }
    // Extension errors are identified by the extension's first error code
    // plus the error offset defined by the extension.
    if error.error_code == comp.extensions.xfixes.first_error + xfixes::BAD_REGION_ERROR {
        return Cow::Borrowed("BadRegion");
    }
    if error.error_code == comp.extensions.damage.first_error + damage::BAD_DAMAGE_ERROR {
        return Cow::Borrowed("BadDamage");
    }
    Cow::Owned(format!("{:?}", error.error_kind))
}

/// Logs a decoded protocol error and carries on.
fn handle_error(comp: &Compositor, backend: &dyn Renderer, error: &X11Error) {
    warn!(
        "X error: request={} (major={}, minor={}, resource=0x{:x}), error={}",
        request_label(comp, backend, error.major_opcode, error.minor_opcode, error.request_name),
        error.major_opcode,
        error.minor_opcode,
        error.bad_value,
        error_label(comp, backend, error),
    );
}

/// Whether the failed request is the `RedirectSubwindows` issued at startup,
/// which means another compositing manager already redirected the screen.
fn is_redirect_error(comp: &Compositor, error: &X11Error) -> bool {
    error.major_opcode == comp.extensions.composite.major_opcode
        && error.minor_opcode == u16::from(composite::REDIRECT_SUBWINDOWS_REQUEST)
}

/// Event handler active while the compositor is registering itself: any
/// X error is fatal, and the tagged `PropertyNotify` of the selection dance
/// completes the `_NET_WM_CM_Sn` claim.
pub fn handle_startup_event(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    event: &Event,
) -> Result<(), Error> {
    match event {
        Event::Error(error) => {
            if is_redirect_error(comp, error) {
                return Err(Error::AnotherCompositorRunning);
            }
            handle_error(comp, backend, error);
            Err(x11rb::errors::ReplyOrIdError::X11Error(error.clone()).into())
        }
        Event::PropertyNotify(event) if comp.cm.is_owner_property(event) => {
            let conn = comp.conn.clone();
            comp.cm.claim(&conn, comp.root, &comp.atoms, event)
        }
        _ => Ok(()),
    }
}

/// Routes one decoded event to the matching handler.
#[profiling::function]
pub fn handle_event(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &Event,
) -> Result<(), Error> {
    match event {
        Event::Error(error) => {
            handle_error(comp, backend, error);
            Ok(())
        }
        Event::DamageNotify(event) => damage_notify(comp, plugins, event),
        Event::RandrScreenChangeNotify(event) => screen_change_notify(comp, plugins, event),
        Event::KeyPress(event) => {
            let window = comp.windows.get(event.event).cloned();
            plugins.key_press(comp, event, window.as_ref());
            Ok(())
        }
        Event::KeyRelease(event) => {
            let window = comp.windows.get(event.event).cloned();
            plugins.key_release(comp, event, window.as_ref());
            Ok(())
        }
        Event::ButtonRelease(event) => {
            let window = comp.windows.get(event.event).cloned();
            plugins.button_release(comp, event, window.as_ref());
            Ok(())
        }
        Event::MotionNotify(event) => {
            plugins.motion(comp, event);
            Ok(())
        }
        Event::CirculateNotify(event) => circulate_notify(comp, plugins, event),
        Event::ConfigureNotify(event) => configure_notify(comp, backend, plugins, event),
        Event::CreateNotify(event) => create_notify(comp, plugins, event),
        Event::DestroyNotify(event) => destroy_notify(comp, backend, plugins, event),
        Event::MapNotify(event) => map_notify(comp, backend, plugins, event),
        Event::ReparentNotify(event) => reparent_notify(comp, backend, plugins, event),
        Event::UnmapNotify(event) => unmap_notify(comp, plugins, event),
        Event::PropertyNotify(event) => property_notify(comp, backend, plugins, event),
        Event::MappingNotify(event) => mapping_notify(comp, plugins, event),
        _ => Ok(()),
    }
}

fn damage_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &damage::NotifyEvent,
) -> Result<(), Error> {
    trace!(
        "DamageNotify: area: {}x{} {:+} {:+} (drawable=0x{:x})",
        event.area.width,
        event.area.height,
        event.area.x,
        event.area.y,
        event.drawable,
    );

    // The window may have disappeared in the meantime or is not visible.
    let Some(window) = comp.windows.get(event.drawable).cloned() else {
        return Ok(());
    };
    if !comp.windows.is_visible(&window) {
        return Ok(());
    }

    plugins.damage(comp, event, Some(&window));

    let decision = window.state().register_damage(event.area, event.geometry);
    match decision {
        DamageDecision::FullWindow => {
            let region = comp.windows.get_region(&window, true, false)?;
            comp.damage.add_region(region)?;
        }
        DamageDecision::Ignore => {
            trace!(id = window.id(), "Window fully damaged (cached)");
        }
        DamageDecision::Area(rect) => {
            let conn = comp.conn.clone();
            let region = conn.generate_id()?;
            conn.xfixes_create_region(region, &[rect])?;
            comp.damage
                .adopt_region(ServerRegion::new(std::sync::Arc::downgrade(&conn), region))?;
        }
    }
    Ok(())
}

fn screen_change_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &randr::ScreenChangeNotifyEvent,
) -> Result<(), Error> {
    debug!(root = event.root, "RandrScreenChangeNotify");

    comp.screen = ScreenInfo::query(
        &comp.conn,
        comp.root,
        event.width,
        event.height,
        comp.extensions.randr.is_some(),
    )?;
    comp.windows.set_screen_extents(event.width, event.height);
    comp.clock.set_refresh_rate_interval(comp.screen.refresh_rate_interval);

    plugins.screen_change(comp, event);
    Ok(())
}

fn circulate_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &CirculateNotifyEvent,
) -> Result<(), Error> {
    trace!(window = event.window, "CirculateNotify");

    let window = comp.windows.get(event.window).cloned();
    if let Some(window) = &window {
        if event.place == Place::ON_BOTTOM {
            comp.windows.restack(window, x11rb::NONE);
        } else {
            let top = comp.windows.top().map(Window::id).unwrap_or(x11rb::NONE);
            comp.windows.restack(window, top);
        }
    }

    plugins.circulate(comp, event, window.as_ref());
    Ok(())
}

fn configure_notify(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &ConfigureNotifyEvent,
) -> Result<(), Error> {
    trace!(
        "ConfigureNotify: window=0x{:x} above=0x{:x} ({}x{} {:+} {:+}, border={})",
        event.window,
        event.above_sibling,
        event.width,
        event.height,
        event.x,
        event.y,
        event.border_width,
    );

    // A configure of the root means the screen was resized; the background
    // picture has to be rebuilt.
    if event.window == comp.root {
        comp.screen.width = event.width;
        comp.screen.height = event.height;
        comp.windows.set_screen_extents(event.width, event.height);
        comp.background_reset = true;
        backend.reset_background();
        return Ok(());
    }

    let Some(window) = comp.windows.get(event.window).cloned() else {
        trace!(window = event.window, "No such window");
        return Ok(());
    };

    // The old position or size has to be cleared from the screen, so the
    // region cached before the update goes into the damaged region.
    let was_visible = comp.windows.is_visible(&window);
    if was_visible {
        let old_region = window.state().region.take();
        if let Some(old_region) = old_region {
            comp.damage.adopt_region(old_region)?;
        }
    }

    let update_pixmap = {
        let mut state = window.state();
        let resized = state.geometry.width != event.width
            || state.geometry.height != event.height
            || state.geometry.border_width != event.border_width;
        state.geometry = Geometry {
            x: event.x,
            y: event.y,
            width: event.width,
            height: event.height,
            border_width: event.border_width,
        };
        state.override_redirect = event.override_redirect;
        // A resized viewable window gets a fresh pixmap allocated by the
        // server, the old one goes stale.
        state.map_state == MapState::Viewable && resized
    };

    if comp.windows.is_visible(&window) {
        let region = comp.windows.get_region(&window, true, true)?;

        // A window mapped outside the screen and moved inside later has no
        // pixmap yet, so not only resizes require a new one.
        if update_pixmap || !was_visible {
            comp.windows.free_pixmap(&window, backend);
            comp.windows.get_pixmap(&window)?;
        }

        comp.damage.add_region(region)?;
        window.state().damaged_ratio = 1.0;
    }

    comp.windows.restack(&window, event.above_sibling);

    plugins.configure(comp, event, Some(&window));
    Ok(())
}

fn create_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &CreateNotifyEvent,
) -> Result<(), Error> {
    trace!(
        "CreateNotify: parent=0x{:x}, window=0x{:x} ({}x{} {:+} {:+})",
        event.parent,
        event.window,
        event.width,
        event.height,
        event.x,
        event.y,
    );

    let Some(window) = comp.windows.add(event.window, false)? else {
        debug!(window = event.window, "Cannot create window");
        return Ok(());
    };

    // The window geometry is part of the event payload, no round-trip
    // needed.
    {
        let mut state = window.state();
        state.geometry = Geometry {
            x: event.x,
            y: event.y,
            width: event.width,
            height: event.height,
            border_width: event.border_width,
        };
        state.override_redirect = event.override_redirect;
    }

    plugins.create(comp, event, Some(&window));
    Ok(())
}

fn destroy_notify(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &DestroyNotifyEvent,
) -> Result<(), Error> {
    trace!(window = event.window, "DestroyNotify");

    let Some(window) = comp.windows.get(event.window).cloned() else {
        debug!(window = event.window, "Can't destroy unknown window");
        return Ok(());
    };

    // The server already freed the Damage object with the drawable, issuing
    // DamageDestroy now would raise BadDamage.
    if let Some(damage) = window.state().damage.as_mut() {
        damage.forget();
    }

    plugins.destroy(comp, event, Some(&window));

    comp.windows.remove(&window, backend, true);
    Ok(())
}

fn map_notify(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &MapNotifyEvent,
) -> Result<(), Error> {
    trace!(window = event.window, "MapNotify");

    let Some(window) = comp.windows.get(event.window).cloned() else {
        debug!(window = event.window, "Window disappeared");
        return Ok(());
    };

    window.state().map_state = MapState::Viewable;

    if comp.windows.is_visible(&window) {
        // The region is kept until the next configure or unmap; a new
        // pixmap is allocated by the server on every map.
        comp.windows.get_region(&window, true, true)?;
        comp.windows.free_pixmap(&window, backend);
        comp.windows.get_pixmap(&window)?;
    }

    window.state().clear_damage();

    plugins.map(comp, event, Some(&window));
    Ok(())
}

fn reparent_notify(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &ReparentNotifyEvent,
) -> Result<(), Error> {
    trace!(
        "ReparentNotify: window=0x{:x}, parent=0x{:x}",
        event.window,
        event.parent,
    );

    let window = if event.parent == comp.root {
        comp.windows.add(event.window, true)?
    } else {
        // Reparented away from the root: the window is no longer a
        // top-level and stops being composited.
        let window = comp.windows.get(event.window).cloned();
        if let Some(window) = &window {
            comp.windows.remove(window, backend, true);
        }
        window
    };

    plugins.reparent(comp, event, window.as_ref());
    Ok(())
}

fn unmap_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &UnmapNotifyEvent,
) -> Result<(), Error> {
    trace!(window = event.window, "UnmapNotify");

    let Some(window) = comp.windows.get(event.window).cloned() else {
        warn!(window = event.window, "Window disappeared");
        return Ok(());
    };

    if comp.windows.is_visible(&window) {
        let region = window.state().region.take();
        if let Some(region) = region {
            comp.damage.adopt_region(region)?;
        }
    }

    {
        let mut state = window.state();
        state.map_state = MapState::Unmapped;
        // Not visible anymore, so not damaged either.
        state.clear_damage();
    }

    plugins.unmap(comp, event, Some(&window));
    Ok(())
}

fn property_notify(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    event: &PropertyNotifyEvent,
) -> Result<(), Error> {
    trace!(window = event.window, atom = event.atom, "PropertyNotify");

    if event.window == comp.root && comp.atoms.is_background_atom(event.atom) {
        debug!("New background pixmap set");
        comp.background_reset = true;
        backend.reset_background();
    }

    let conn = comp.conn.clone();
    comp.atoms.update_supported(&conn, comp.root, event)?;

    let window = comp.windows.get(event.window).cloned();
    plugins.property(comp, event, window.as_ref());
    Ok(())
}

fn mapping_notify(
    comp: &mut Compositor,
    plugins: &mut PluginHost,
    event: &MappingNotifyEvent,
) -> Result<(), Error> {
    debug!(
        "MappingNotify: request={:?}, first_keycode={}, count={}",
        event.request, event.first_keycode, event.count,
    );

    if event.request != Mapping::MODIFIER && event.request != Mapping::KEYBOARD {
        return Ok(());
    }

    comp.refresh_key_mappings()?;

    plugins.mapping(comp, event);
    Ok(())
}

/// Drains queued X events before a paint.
///
/// With `observe_deadline` the drain aborts once the elapsed wall-clock plus
/// a millisecond of slack exceeds the current repaint interval, so a burst
/// of `DamageNotify` events cannot starve the paint timer. Startup passes
/// `false`: there everything pending must be processed.
#[profiling::function]
pub fn drain_events(
    comp: &mut Compositor,
    backend: &mut dyn Renderer,
    plugins: &mut PluginHost,
    observe_deadline: bool,
) -> Result<(), Error> {
    let started = Instant::now();
    let deadline = comp.clock.repaint_interval();

    while let Some(event) = comp.conn.poll_for_event()? {
        if let Err(err) = handle_event(comp, backend, plugins, &event) {
            warn!("Failed to handle X11 event: {}", err);
        }

        if observe_deadline && started.elapsed().as_secs_f64() + 0.001 > deadline {
            trace!("Repaint deadline reached while draining events");
            break;
        }
    }
    Ok(())
}
