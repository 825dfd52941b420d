//! Window records and the window registry.
//!
//! One record exists per known top-level child of the root. Records are kept
//! in two structures updated together behind the registry façade: a
//! bottom-to-top stacking list, authoritative for paint order and restacks,
//! and an [`IdTree`] index for the id lookup every event handler starts
//! with. A record is created on `CreateNotify`, on `ReparentNotify` back to
//! the root or during the initial tree enumeration, and destroyed on
//! `DestroyNotify` or on `ReparentNotify` away from the root.
//!
//! Server-side resources attached to a record (the named pixmap, the Damage
//! object and the cached window region) are scoped handles whose drop issues
//! the corresponding free request.

use std::{
    any::Any,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tracing::{debug, trace};
use x11rb::{
    connection::Connection as _,
    protocol::{
        composite::ConnectionExt as _,
        damage::{self, ConnectionExt as _},
        shape,
        xfixes::{self, ConnectionExt as _},
        xproto::{self, ChangeWindowAttributesAux, ConnectionExt as _, EventMask, Rectangle},
    },
    rust_connection::RustConnection,
};

use crate::{error::Error, render::Renderer, utils::IdTree};

/// A window is treated as fully damaged once the accumulated damage ratio
/// reaches this value.
pub const FULLY_DAMAGED_RATIO: f32 = 0.9;

/// Number of `DamageNotify` events per paint after which a window is treated
/// as fully damaged.
pub const DAMAGE_NOTIFY_MAX: i16 = 24;

/// Map state of a window as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    Unviewable,
    Viewable,
}

impl From<xproto::MapState> for MapState {
    fn from(state: xproto::MapState) -> Self {
        match state {
            xproto::MapState::VIEWABLE => MapState::Viewable,
            xproto::MapState::UNVIEWABLE => MapState::Unviewable,
            _ => MapState::Unmapped,
        }
    }
}

/// Whether the per-window transform matrix still has to be applied by the
/// rendering backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStatus {
    None,
    Required,
    Done,
}

/// Last-known window geometry in root coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
}

impl Geometry {
    pub fn width_with_border(&self) -> u16 {
        self.width + self.border_width * 2
    }

    pub fn height_with_border(&self) -> u16 {
        self.height + self.border_width * 2
    }

    /// Whether any pixel of the window (border included) is on the screen.
    pub fn is_on_screen(&self, screen_width: u16, screen_height: u16) -> bool {
        i32::from(self.x) < i32::from(screen_width)
            && i32::from(self.y) < i32::from(screen_height)
            && i32::from(self.x) + i32::from(self.width_with_border()) > 0
            && i32::from(self.y) + i32::from(self.height_with_border()) > 0
    }
}

/// A server-side XFixes region destroyed on drop.
#[derive(Debug)]
pub struct ServerRegion {
    conn: Weak<RustConnection>,
    id: xfixes::Region,
}

impl ServerRegion {
    pub(crate) fn new(conn: Weak<RustConnection>, id: xfixes::Region) -> Self {
        ServerRegion { conn, id }
    }

    pub fn id(&self) -> xfixes::Region {
        self.id
    }
}

impl Drop for ServerRegion {
    fn drop(&mut self) {
        if self.id == x11rb::NONE {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.xfixes_destroy_region(self.id);
        }
    }
}

/// A server-side pixmap freed on drop.
#[derive(Debug)]
pub struct ServerPixmap {
    conn: Weak<RustConnection>,
    id: xproto::Pixmap,
}

impl ServerPixmap {
    fn new(conn: Weak<RustConnection>, id: xproto::Pixmap) -> Self {
        ServerPixmap { conn, id }
    }

    pub fn id(&self) -> xproto::Pixmap {
        self.id
    }
}

impl Drop for ServerPixmap {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.free_pixmap(self.id);
        }
    }
}

/// A server-side Damage object.
///
/// Destroyed on drop unless [`DamageObject::forget`] was called; the server
/// frees the object itself when the damaged drawable is destroyed, and
/// issuing `DamageDestroy` afterwards would raise `BadDamage`.
#[derive(Debug)]
pub struct DamageObject {
    conn: Weak<RustConnection>,
    id: damage::Damage,
}

impl DamageObject {
    fn new(conn: Weak<RustConnection>, id: damage::Damage) -> Self {
        DamageObject { conn, id }
    }

    pub fn forget(&mut self) {
        self.id = x11rb::NONE;
    }
}

impl Drop for DamageObject {
    fn drop(&mut self) {
        if self.id == x11rb::NONE {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.damage_destroy(self.id);
        }
    }
}

/// What the dispatcher should do with a `DamageNotify` event.
#[derive(Debug)]
pub enum DamageDecision {
    /// Add the whole window region to the global damage.
    FullWindow,
    /// The window is already fully damaged, drop the event.
    Ignore,
    /// Add this rectangle, already translated to root coordinates.
    Area(Rectangle),
}

impl PartialEq for DamageDecision {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DamageDecision::FullWindow, DamageDecision::FullWindow) => true,
            (DamageDecision::Ignore, DamageDecision::Ignore) => true,
            (DamageDecision::Area(a), DamageDecision::Area(b)) => {
                a.x == b.x && a.y == b.y && a.width == b.width && a.height == b.height
            }
            _ => false,
        }
    }
}

impl Eq for DamageDecision {}

/// The mutable per-window record.
pub struct WindowState {
    pub alive: bool,
    pub geometry: Geometry,
    pub map_state: MapState,
    pub override_redirect: bool,
    pub pixmap: Option<ServerPixmap>,
    pub damage: Option<DamageObject>,
    pub region: Option<ServerRegion>,
    pub is_rectangular: bool,
    pub damaged: bool,
    pub damaged_ratio: f32,
    pub damage_notify_counter: i16,
    pub transform: [[f64; 4]; 4],
    pub transform_status: TransformStatus,
    /// Backend-private rendering state, only ever dereferenced by the
    /// backend and freed through its `free_window` hook.
    pub render_data: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for WindowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowState")
            .field("alive", &self.alive)
            .field("geometry", &self.geometry)
            .field("map_state", &self.map_state)
            .field("override_redirect", &self.override_redirect)
            .field("damaged", &self.damaged)
            .field("damaged_ratio", &self.damaged_ratio)
            .finish_non_exhaustive()
    }
}

const IDENTITY: [[f64; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

impl WindowState {
    fn new() -> Self {
        WindowState {
            alive: true,
            geometry: Geometry::default(),
            map_state: MapState::Unmapped,
            override_redirect: false,
            pixmap: None,
            damage: None,
            region: None,
            is_rectangular: true,
            damaged: false,
            damaged_ratio: 0.0,
            damage_notify_counter: 0,
            transform: IDENTITY,
            transform_status: TransformStatus::None,
            render_data: None,
        }
    }

    /// Folds one `DamageNotify` into the per-window accounting and decides
    /// how the event contributes to the global damage.
    ///
    /// `area` is relative to the drawable, `drawable_geometry` is the
    /// drawable's root-relative geometry as reported in the event.
    pub fn register_damage(&mut self, area: Rectangle, drawable_geometry: Rectangle) -> DamageDecision {
        // A window which was never damaged has never been painted, so its
        // entire content is due.
        if !self.damaged {
            self.damaged = true;
            self.damaged_ratio = 1.0;
            return DamageDecision::FullWindow;
        }

        if self.damaged_ratio >= FULLY_DAMAGED_RATIO {
            return DamageDecision::Ignore;
        }

        self.damage_notify_counter += 1;
        let window_area = f32::from(self.geometry.width) * f32::from(self.geometry.height);
        if window_area > 0.0 {
            self.damaged_ratio += f32::from(area.width) * f32::from(area.height) / window_area;
        }

        if self.damage_notify_counter > DAMAGE_NOTIFY_MAX || self.damaged_ratio >= FULLY_DAMAGED_RATIO {
            self.damaged_ratio = 1.0;
            return DamageDecision::FullWindow;
        }

        DamageDecision::Area(Rectangle {
            x: area.x + drawable_geometry.x,
            y: area.y + drawable_geometry.y,
            width: area.width,
            height: area.height,
        })
    }

    /// Returns the accounting to its post-paint baseline. The `damaged` bit
    /// is kept: it records that the window has been painted at least once.
    pub fn reset_damage_accounting(&mut self) {
        self.damage_notify_counter = 0;
        self.damaged_ratio = 0.0;
    }

    /// Clears the damage state entirely, used on map and unmap.
    pub fn clear_damage(&mut self) {
        self.damaged = false;
        self.reset_damage_accounting();
    }
}

/// Cheap-clone handle to a window record.
///
/// Handles given out to plugins and the rendering backend stay valid until
/// the record is removed from the registry, at which point `alive` turns
/// false and the server-side resources are gone.
#[derive(Clone)]
pub struct Window {
    id: xproto::Window,
    pub(crate) state: Arc<Mutex<WindowState>>,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window").field("id", &self.id).finish()
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.alive() && other.alive()
    }
}

impl Window {
    fn new(id: xproto::Window) -> Self {
        Window {
            id,
            state: Arc::new(Mutex::new(WindowState::new())),
        }
    }

    /// The server-assigned window id.
    pub fn id(&self) -> xproto::Window {
        self.id
    }

    /// Locks the record for direct access.
    pub fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap()
    }

    pub fn alive(&self) -> bool {
        self.state().alive
    }

    pub fn geometry(&self) -> Geometry {
        self.state().geometry
    }

    pub fn map_state(&self) -> MapState {
        self.state().map_state
    }

    pub fn is_override_redirect(&self) -> bool {
        self.state().override_redirect
    }

    pub fn is_damaged(&self) -> bool {
        self.state().damaged
    }

    /// Cached shape-extents result; true while the window carries no
    /// non-rectangular shape region.
    pub fn is_rectangular(&self) -> bool {
        self.state().is_rectangular
    }

    pub fn pixmap_id(&self) -> Option<xproto::Pixmap> {
        self.state().pixmap.as_ref().map(ServerPixmap::id)
    }

    pub fn region_id(&self) -> Option<xfixes::Region> {
        self.state().region.as_ref().map(ServerRegion::id)
    }
}

/// The stacking list and its lookup index, always mutated together.
#[derive(Debug, Default)]
pub(crate) struct WindowStack {
    /// Bottom-most first, mirroring the server's sibling stack.
    stack: Vec<Window>,
    index: IdTree<Window>,
}

impl WindowStack {
    /// Inserts a window at the top of the stack. No-op when present.
    fn insert(&mut self, window: Window) -> bool {
        if !self.index.insert(window.id(), window.clone()) {
            return false;
        }
        self.stack.push(window);
        true
    }

    fn get(&self, id: xproto::Window) -> Option<&Window> {
        self.index.get(id)
    }

    fn remove(&mut self, id: xproto::Window) -> Option<Window> {
        let window = self.index.remove(id)?;
        self.stack.retain(|candidate| candidate.id() != id);
        Some(window)
    }

    /// Moves a window directly above `above_sibling`; `None` (`XCB_NONE` on
    /// the wire) moves it to the bottom.
    fn restack(&mut self, id: xproto::Window, above_sibling: xproto::Window) {
        let Some(position) = self.stack.iter().position(|candidate| candidate.id() == id) else {
            return;
        };
        let window = self.stack.remove(position);

        if above_sibling == x11rb::NONE {
            self.stack.insert(0, window);
        } else if let Some(sibling) = self.stack.iter().position(|candidate| candidate.id() == above_sibling) {
            self.stack.insert(sibling + 1, window);
        } else {
            // The sibling is not a managed top-level, keep the window on top.
            trace!(id, above_sibling, "Restack above unknown sibling");
            self.stack.push(window);
        }
    }

    fn top(&self) -> Option<&Window> {
        self.stack.last()
    }

    fn iter(&self) -> impl Iterator<Item = &Window> {
        self.stack.iter()
    }

    fn len(&self) -> usize {
        debug_assert_eq!(self.stack.len(), self.index.len());
        self.stack.len()
    }
}

/// Owns every window record and keeps both interior structures consistent.
#[derive(Debug)]
pub struct WindowRegistry {
    conn: Arc<RustConnection>,
    root: xproto::Window,
    screen_width: u16,
    screen_height: u16,
    stack: WindowStack,
}

impl WindowRegistry {
    pub fn new(conn: Arc<RustConnection>, root: xproto::Window, screen_width: u16, screen_height: u16) -> Self {
        WindowRegistry {
            conn,
            root,
            screen_width,
            screen_height,
            stack: WindowStack::default(),
        }
    }

    /// Updates the cached root extents, used by the visibility check.
    pub fn set_screen_extents(&mut self, width: u16, height: u16) {
        self.screen_width = width;
        self.screen_height = height;
    }

    pub fn root(&self) -> xproto::Window {
        self.root
    }

    /// Number of managed windows.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.len() == 0
    }

    /// Windows in stacking order, bottom-most first.
    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.stack.iter()
    }

    /// Looks a record up by window id.
    pub fn get(&self, id: xproto::Window) -> Option<&Window> {
        self.stack.get(id)
    }

    /// The top-most managed window.
    pub fn top(&self) -> Option<&Window> {
        self.stack.top()
    }

    /// Creates a record for `id` at the top of the stack and subscribes to
    /// the events the compositor needs from it. With `send_change_requests`
    /// the current attributes, geometry and shape are also queried.
    ///
    /// Returns `None` when the window is already managed or disappeared
    /// before the queries completed.
    pub fn add(&mut self, id: xproto::Window, send_change_requests: bool) -> Result<Option<Window>, Error> {
        if id == self.root || self.stack.get(id).is_some() {
            return Ok(None);
        }

        let window = Window::new(id);
        self.register_notify(&window)?;

        if send_change_requests {
            let attributes_cookie = self.conn.get_window_attributes(id)?;
            let geometry_cookie = self.conn.get_geometry(id)?;

            let attributes = match attributes_cookie.reply() {
                Ok(reply) => reply,
                Err(x11rb::errors::ReplyError::X11Error(_)) => {
                    debug!(id, "Window disappeared while querying attributes");
                    return Ok(None);
                }
                Err(x11rb::errors::ReplyError::ConnectionError(err)) => return Err(err.into()),
            };
            let geometry = match geometry_cookie.reply() {
                Ok(reply) => reply,
                Err(x11rb::errors::ReplyError::X11Error(_)) => {
                    debug!(id, "Window disappeared while querying geometry");
                    return Ok(None);
                }
                Err(x11rb::errors::ReplyError::ConnectionError(err)) => return Err(err.into()),
            };

            {
                let mut state = window.state();
                state.map_state = attributes.map_state.into();
                state.override_redirect = attributes.override_redirect;
                state.geometry = Geometry {
                    x: geometry.x,
                    y: geometry.y,
                    width: geometry.width,
                    height: geometry.height,
                    border_width: geometry.border_width,
                };
            }
            self.update_shape(&window)?;
        }

        trace!(id, "Managing window");
        self.stack.insert(window.clone());
        Ok(Some(window))
    }

    /// Batch-add for the initial tree snapshot, bottom-most first. Viewable
    /// windows get their region and pixmap immediately.
    pub fn manage_existing(&mut self, ids: &[xproto::Window]) -> Result<Vec<Window>, Error> {
        let mut managed = Vec::with_capacity(ids.len());
        for &id in ids {
            let Some(window) = self.add(id, true)? else {
                continue;
            };
            if self.is_visible(&window) {
                self.get_region(&window, true, true)?;
                self.get_pixmap(&window)?;
            }
            managed.push(window);
        }
        debug!(count = managed.len(), "Managed existing windows");
        Ok(managed)
    }

    /// Unlinks the record, releases its server-side resources and, when
    /// `release_backend` is set, lets the backend free its private state.
    pub fn remove(&mut self, window: &Window, backend: &mut dyn Renderer, release_backend: bool) {
        let id = window.id();
        let had_pixmap;
        {
            let mut state = window.state();
            state.alive = false;
            had_pixmap = state.pixmap.take().is_some();
            state.region.take();
            state.damage.take();
        }
        if had_pixmap {
            backend.free_window_pixmap(window);
        }
        if release_backend {
            backend.free_window(window);
            window.state().render_data.take();
        }
        self.stack.remove(id);
        trace!(id, "Window removed");
    }

    /// Relocates the record directly above `above_sibling` in the stack;
    /// `XCB_NONE` moves it to the bottom.
    pub fn restack(&mut self, window: &Window, above_sibling: xproto::Window) {
        self.stack.restack(window.id(), above_sibling);
    }

    /// Requests a Damage object and the event selection mask on the window.
    pub fn register_notify(&self, window: &Window) -> Result<(), Error> {
        let damage = self.conn.generate_id()?;
        self.conn
            .damage_create(damage, window.id(), damage::ReportLevel::NON_EMPTY)?;
        self.conn.change_window_attributes(
            window.id(),
            &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        window.state().damage = Some(DamageObject::new(Arc::downgrade(&self.conn), damage));
        Ok(())
    }

    /// True iff the window is viewable and intersects the screen.
    pub fn is_visible(&self, window: &Window) -> bool {
        let state = window.state();
        state.map_state == MapState::Viewable && state.geometry.is_on_screen(self.screen_width, self.screen_height)
    }

    /// Refreshes the cached shape information of the window.
    pub fn update_shape(&self, window: &Window) -> Result<(), Error> {
        let region = self.conn.generate_id()?;
        self.conn
            .xfixes_create_region_from_window(region, window.id(), shape::SK::BOUNDING)?;
        let fetch = self.conn.xfixes_fetch_region(region)?;
        let reply = fetch.reply();
        self.conn.xfixes_destroy_region(region)?;

        match reply {
            Ok(reply) => {
                // A window without a shape region fetches as one rectangle
                // covering its bounds.
                window.state().is_rectangular = reply.rectangles.len() <= 1;
                Ok(())
            }
            Err(x11rb::errors::ReplyError::X11Error(_)) => Ok(()),
            Err(x11rb::errors::ReplyError::ConnectionError(err)) => Err(err.into()),
        }
    }

    /// Returns the cached region covering the window on the root, creating
    /// it server-side when absent or when `create_new` forces a rebuild.
    pub fn get_region(
        &self,
        window: &Window,
        with_border: bool,
        create_new: bool,
    ) -> Result<xfixes::Region, Error> {
        {
            let state = window.state();
            if !create_new {
                if let Some(region) = &state.region {
                    return Ok(region.id());
                }
            }
        }

        let (geometry, is_rectangular) = {
            let state = window.state();
            (state.geometry, state.is_rectangular)
        };

        let region = self.conn.generate_id()?;
        if is_rectangular {
            let rect = Rectangle {
                x: geometry.x,
                y: geometry.y,
                width: if with_border {
                    geometry.width_with_border()
                } else {
                    geometry.width
                },
                height: if with_border {
                    geometry.height_with_border()
                } else {
                    geometry.height
                },
            };
            self.conn.xfixes_create_region(region, &[rect])?;
        } else {
            self.conn
                .xfixes_create_region_from_window(region, window.id(), shape::SK::BOUNDING)?;
            self.conn.xfixes_translate_region(region, geometry.x, geometry.y)?;
        }

        window.state().region = Some(ServerRegion::new(Arc::downgrade(&self.conn), region));
        Ok(region)
    }

    /// Allocates (or returns) the NameWindowPixmap of the window. The result
    /// is only meaningful while the window is viewable.
    pub fn get_pixmap(&self, window: &Window) -> Result<xproto::Pixmap, Error> {
        if let Some(pixmap) = window.pixmap_id() {
            return Ok(pixmap);
        }
        let pixmap = self.conn.generate_id()?;
        self.conn.composite_name_window_pixmap(window.id(), pixmap)?;
        window.state().pixmap = Some(ServerPixmap::new(Arc::downgrade(&self.conn), pixmap));
        Ok(pixmap)
    }

    /// Destroys the window pixmap and lets the backend drop what it derived
    /// from it. Must precede re-acquisition on every geometry change.
    pub fn free_pixmap(&self, window: &Window, backend: &mut dyn Renderer) {
        let pixmap = window.state().pixmap.take();
        if let Some(pixmap) = pixmap {
            drop(pixmap);
            backend.free_window_pixmap(window);
        }
    }

    /// First half of the off-screen pixmap dance for unmapped windows: the
    /// window is force-mapped with override-redirect set so the server
    /// allocates backing store for it. The server stays grabbed until
    /// [`WindowRegistry::get_invisible_window_pixmap_finalise`] runs.
    pub fn get_invisible_window_pixmap(&self, window: &Window) -> Result<(), Error> {
        self.conn.grab_server()?;
        self.conn.change_window_attributes(
            window.id(),
            &ChangeWindowAttributesAux::new().override_redirect(1),
        )?;
        self.conn.map_window(window.id())?;
        Ok(())
    }

    /// Second half: names the pixmap, then restores the map state and the
    /// override-redirect attribute and releases the grab.
    pub fn get_invisible_window_pixmap_finalise(&self, window: &Window) -> Result<xproto::Pixmap, Error> {
        let pixmap = self.conn.generate_id()?;
        self.conn.composite_name_window_pixmap(window.id(), pixmap)?;
        self.conn.unmap_window(window.id())?;
        let override_redirect = u32::from(window.is_override_redirect());
        self.conn.change_window_attributes(
            window.id(),
            &ChangeWindowAttributesAux::new().override_redirect(override_redirect),
        )?;
        self.conn.ungrab_server()?;
        window.state().pixmap = Some(ServerPixmap::new(Arc::downgrade(&self.conn), pixmap));
        Ok(pixmap)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A bare window handle for exercising the pure bookkeeping in tests.
    pub(crate) fn detached(id: xproto::Window) -> Window {
        Window::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_window(id: xproto::Window) -> Window {
        test_support::detached(id)
    }

    fn stack_ids(stack: &WindowStack) -> Vec<xproto::Window> {
        stack.iter().map(Window::id).collect()
    }

    fn assert_consistent(stack: &WindowStack) {
        assert_eq!(stack.stack.len(), stack.index.len());
        for window in stack.iter() {
            let indexed = stack.index.get(window.id()).expect("missing from index");
            assert_eq!(indexed.id(), window.id());
        }
    }

    #[test]
    fn insert_places_on_top() {
        let mut stack = WindowStack::default();
        assert!(stack.insert(detached_window(0x100)));
        assert!(stack.insert(detached_window(0x200)));
        assert!(stack.insert(detached_window(0x300)));
        assert_eq!(stack_ids(&stack), vec![0x100, 0x200, 0x300]);
        assert_consistent(&stack);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut stack = WindowStack::default();
        assert!(stack.insert(detached_window(0x100)));
        assert!(!stack.insert(detached_window(0x100)));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn restack_above_sibling() {
        let mut stack = WindowStack::default();
        for id in [0x100, 0x200, 0x300, 0x400] {
            stack.insert(detached_window(id));
        }
        stack.restack(0x100, 0x300);
        assert_eq!(stack_ids(&stack), vec![0x200, 0x300, 0x100, 0x400]);
        assert_consistent(&stack);
    }

    #[test]
    fn restack_to_bottom() {
        let mut stack = WindowStack::default();
        for id in [0x100, 0x200, 0x300] {
            stack.insert(detached_window(id));
        }
        stack.restack(0x300, x11rb::NONE);
        assert_eq!(stack_ids(&stack), vec![0x300, 0x100, 0x200]);
        assert_consistent(&stack);
    }

    #[test]
    fn restack_above_unknown_sibling_goes_on_top() {
        let mut stack = WindowStack::default();
        for id in [0x100, 0x200] {
            stack.insert(detached_window(id));
        }
        stack.restack(0x100, 0xdead);
        assert_eq!(stack_ids(&stack), vec![0x200, 0x100]);
    }

    #[test]
    fn remove_keeps_both_structures_in_sync() {
        let mut stack = WindowStack::default();
        for id in [0x100, 0x200, 0x300] {
            stack.insert(detached_window(id));
        }
        let removed = stack.remove(0x200).expect("window was present");
        assert_eq!(removed.id(), 0x200);
        assert!(stack.get(0x200).is_none());
        assert_eq!(stack_ids(&stack), vec![0x100, 0x300]);
        assert_consistent(&stack);
        assert!(stack.remove(0x200).is_none());
    }

    #[test]
    fn churn_keeps_consistency() {
        let mut stack = WindowStack::default();
        for id in 1..=64u32 {
            stack.insert(detached_window(id));
            assert_consistent(&stack);
        }
        for id in (2..=64u32).step_by(2) {
            stack.restack(id, x11rb::NONE);
            assert_consistent(&stack);
        }
        for id in (1..=64u32).step_by(3) {
            stack.remove(id);
            assert_consistent(&stack);
        }
    }

    fn rect(x: i16, y: i16, width: u16, height: u16) -> Rectangle {
        Rectangle { x, y, width, height }
    }

    fn viewable_state(width: u16, height: u16) -> WindowState {
        let mut state = WindowState::new();
        state.map_state = MapState::Viewable;
        state.geometry = Geometry {
            x: 10,
            y: 10,
            width,
            height,
            border_width: 0,
        };
        state
    }

    #[test]
    fn first_damage_covers_the_window() {
        let mut state = viewable_state(100, 100);
        let decision = state.register_damage(rect(0, 0, 50, 50), rect(10, 10, 100, 100));
        assert_eq!(decision, DamageDecision::FullWindow);
        assert!(state.damaged);
        assert_eq!(state.damaged_ratio, 1.0);
    }

    #[test]
    fn fully_damaged_window_drops_events() {
        let mut state = viewable_state(100, 100);
        state.register_damage(rect(0, 0, 1, 1), rect(10, 10, 100, 100));
        let decision = state.register_damage(rect(0, 0, 1, 1), rect(10, 10, 100, 100));
        assert_eq!(decision, DamageDecision::Ignore);
    }

    #[test]
    fn partial_damage_accumulates_after_a_paint() {
        let mut state = viewable_state(100, 100);
        state.register_damage(rect(0, 0, 100, 100), rect(10, 10, 100, 100));
        state.reset_damage_accounting();

        let decision = state.register_damage(rect(0, 0, 50, 50), rect(10, 10, 100, 100));
        assert_eq!(decision, DamageDecision::Area(rect(10, 10, 50, 50)));
        assert!((state.damaged_ratio - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn running_ratio_saturates_to_full_window() {
        let mut state = viewable_state(100, 100);
        state.register_damage(rect(0, 0, 100, 100), rect(10, 10, 100, 100));
        state.reset_damage_accounting();

        // 0.25 + 0.25 + 0.25 < 0.9, the fourth quarter crosses it.
        for _ in 0..3 {
            let decision = state.register_damage(rect(0, 0, 50, 50), rect(10, 10, 100, 100));
            assert!(matches!(decision, DamageDecision::Area(_)));
        }
        let decision = state.register_damage(rect(0, 0, 50, 50), rect(10, 10, 100, 100));
        assert_eq!(decision, DamageDecision::FullWindow);
        assert_eq!(state.damaged_ratio, 1.0);
    }

    #[test]
    fn damage_counter_saturates_to_full_window() {
        let mut state = viewable_state(400, 400);
        state.register_damage(rect(0, 0, 400, 400), rect(0, 0, 400, 400));
        state.reset_damage_accounting();

        // 24 small rectangles stay partial, the 25th takes the counter path.
        for _ in 0..24 {
            let decision = state.register_damage(rect(0, 0, 10, 10), rect(0, 0, 400, 400));
            assert!(matches!(decision, DamageDecision::Area(_)));
        }
        let decision = state.register_damage(rect(0, 0, 10, 10), rect(0, 0, 400, 400));
        assert_eq!(decision, DamageDecision::FullWindow);
        assert!(state.damage_notify_counter > DAMAGE_NOTIFY_MAX);
    }

    #[test]
    fn clear_damage_resets_everything() {
        let mut state = viewable_state(100, 100);
        state.register_damage(rect(0, 0, 100, 100), rect(10, 10, 100, 100));
        state.clear_damage();
        assert!(!state.damaged);
        assert_eq!(state.damaged_ratio, 0.0);
        assert_eq!(state.damage_notify_counter, 0);
    }

    #[test]
    fn geometry_visibility() {
        let geometry = Geometry {
            x: -50,
            y: -50,
            width: 100,
            height: 100,
            border_width: 0,
        };
        assert!(geometry.is_on_screen(1920, 1080));

        let off_screen = Geometry {
            x: 2000,
            y: 0,
            width: 100,
            height: 100,
            border_width: 0,
        };
        assert!(!off_screen.is_on_screen(1920, 1080));

        let border_only = Geometry {
            x: -104,
            y: 0,
            width: 100,
            height: 100,
            border_width: 3,
        };
        assert!(border_only.is_on_screen(1920, 1080));
    }

    #[test]
    fn width_with_border() {
        let geometry = Geometry {
            x: 0,
            y: 0,
            width: 200,
            height: 100,
            border_width: 2,
        };
        assert_eq!(geometry.width_with_border(), 204);
        assert_eq!(geometry.height_with_border(), 102);
    }
}
