//! The compositor context.
//!
//! All state shared between the event dispatcher, the paint scheduler, the
//! plugins and the rendering backend lives in one [`Compositor`] value
//! threaded through them by reference. Everything runs on the event loop
//! thread; the only other thread is the event reader inside the X source,
//! which never touches this state.

use std::sync::Arc;

use tracing::warn;
use x11rb::{
    connection::Connection as _,
    protocol::xproto::{self, ConnectionExt as _},
    rust_connection::RustConnection,
};

use crate::{
    atoms::AtomRegistry,
    damage::DamageTracker,
    display::{CmRegistration, Extensions, ScreenInfo},
    error::Error,
    keys::{resolve_lock_masks, KeysymTable, LockMasks},
    paint::PaintClock,
    window::WindowRegistry,
};

/// Process-wide compositor state.
#[derive(Debug)]
pub struct Compositor {
    /// The X connection, shared with the event source and resource handles.
    pub conn: Arc<RustConnection>,
    /// The managed screen number.
    pub screen_nbr: usize,
    /// The root window of the managed screen.
    pub root: xproto::Window,
    pub atoms: AtomRegistry,
    pub extensions: Extensions,
    pub screen: ScreenInfo,
    pub cm: CmRegistration,
    pub windows: WindowRegistry,
    pub damage: DamageTracker,
    pub clock: PaintClock,
    pub lock_masks: LockMasks,
    /// The server keysym table, populated with the first mapping fetch.
    pub keysyms: Option<KeysymTable>,
    /// Set when the root background must be rebuilt before the next paint.
    pub background_reset: bool,
}

impl Compositor {
    /// Flushes pending requests, logging instead of failing: a dead
    /// connection surfaces through the event source shortly after.
    pub fn flush(&self) {
        if let Err(err) = self.conn.flush() {
            warn!("Failed to flush the X connection: {}", err);
        }
    }

    /// Re-reads the modifier and keyboard mappings and recomputes the lock
    /// masks. Both requests are batched into one round-trip.
    pub fn refresh_key_mappings(&mut self) -> Result<(), Error> {
        let (min_keycode, max_keycode) = {
            let setup = self.conn.setup();
            (setup.min_keycode, setup.max_keycode)
        };

        let modifier_cookie = self.conn.get_modifier_mapping()?;
        let keyboard_cookie = self
            .conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)?;

        let modifiers = modifier_cookie.reply()?;
        let keyboard = keyboard_cookie.reply()?;

        let table = KeysymTable::from_reply(min_keycode, keyboard);
        self.lock_masks = resolve_lock_masks(&modifiers.keycodes, &table);
        self.keysyms = Some(table);
        Ok(())
    }
}
