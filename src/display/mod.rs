//! Display-level setup: X connection, screen information and the
//! compositing manager registration protocol.
//!
//! Registration follows the ICCCM manager-selection conventions: the owner
//! of `_NET_WM_CM_Sn` is checked first, an unmapped 1×1 InputOnly window is
//! created, a property change on it produces the server timestamp used for
//! `SetSelectionOwner`, and a `MANAGER` client message announces the new
//! owner on the root. Only then are the root's subwindows redirected.

use std::sync::Arc;

use tracing::{debug, info, warn};
use x11rb::{
    connection::Connection as _,
    protocol::{
        composite::{ConnectionExt as _, Redirect},
        randr::{self, ConnectionExt as _},
        xproto::{
            ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt as _, CreateWindowAux, EventMask,
            PropertyNotifyEvent, Screen, Window, WindowClass,
        },
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
};

use crate::{atoms::AtomRegistry, error::Error, paint::DEFAULT_REPAINT_INTERVAL};

#[macro_use]
pub mod extension;

pub use self::extension::{ExtensionData, Extensions};

/// Connects to the X server named by `$DISPLAY` (or `name`).
pub fn connect(name: Option<&str>) -> Result<(Arc<RustConnection>, usize), Error> {
    let (conn, screen_nbr) = RustConnection::connect(name)?;
    info!(screen = screen_nbr, "Connected to the X server");
    Ok((Arc::new(conn), screen_nbr))
}

/// Screen geometry and RandR-derived timing data.
#[derive(Debug, Clone)]
pub struct ScreenInfo {
    /// Root window pixel extents.
    pub width: u16,
    /// Root window pixel extents.
    pub height: u16,
    /// The CRTCs currently driving outputs of this screen.
    pub crtcs: Vec<randr::GetCrtcInfoReply>,
    /// Seconds per frame of the screen, the ceiling of the repaint interval.
    pub refresh_rate_interval: f64,
}

impl ScreenInfo {
    /// Queries RandR for the CRTC list and derives the refresh interval from
    /// the first active CRTC mode. Falls back to the 50 Hz default when
    /// RandR is absent or reports an implausible rate.
    pub fn query(
        conn: &RustConnection,
        root: Window,
        root_width: u16,
        root_height: u16,
        randr_present: bool,
    ) -> Result<ScreenInfo, Error> {
        let mut info = ScreenInfo {
            width: root_width,
            height: root_height,
            crtcs: Vec::new(),
            refresh_rate_interval: DEFAULT_REPAINT_INTERVAL,
        };

        if !randr_present {
            return Ok(info);
        }

        let resources = conn.randr_get_screen_resources(root)?.reply()?;

        let cookies = resources
            .crtcs
            .iter()
            .map(|&crtc| conn.randr_get_crtc_info(crtc, resources.config_timestamp))
            .collect::<Result<Vec<_>, _>>()?;
        for cookie in cookies {
            match cookie.reply() {
                Ok(crtc) => info.crtcs.push(crtc),
                Err(err) => warn!("Ignoring CRTC which could not be queried: {}", err),
            }
        }

        let interval = info
            .crtcs
            .iter()
            .find(|crtc| crtc.mode != x11rb::NONE)
            .and_then(|crtc| resources.modes.iter().find(|mode| mode.id == crtc.mode))
            .and_then(|mode| {
                let total = u64::from(mode.htotal) * u64::from(mode.vtotal);
                (total != 0 && mode.dot_clock != 0).then(|| total as f64 / mode.dot_clock as f64)
            });

        match interval {
            // High-refresh screens land below the repaint floor; the paint
            // clock clamps for them. Only absurd rates fall back to the
            // default.
            Some(interval) if (0.001..=1.0).contains(&interval) => {
                info.refresh_rate_interval = interval;
                debug!(
                    "Screen refresh rate: {:.2} Hz ({:.4}s per frame)",
                    1.0 / interval,
                    interval
                );
            }
            Some(interval) => {
                warn!(
                    "Implausible screen refresh interval {:.4}s, using the {:.0} Hz default",
                    interval,
                    1.0 / DEFAULT_REPAINT_INTERVAL
                );
            }
            None => {
                debug!("No active CRTC mode, using the default repaint interval");
            }
        }

        Ok(info)
    }

    /// Subscribes to RandR screen change notifications on the root.
    pub fn select_screen_change(conn: &RustConnection, root: Window) -> Result<(), Error> {
        conn.randr_select_input(root, randr::NotifyMask::SCREEN_CHANGE)?;
        Ok(())
    }
}

/// State of the `_NET_WM_CM_Sn` ownership protocol.
#[derive(Debug)]
pub struct CmRegistration {
    window: Window,
    claimed: bool,
}

impl CmRegistration {
    /// Fails with [`Error::AnotherCompositorRunning`] if the compositing
    /// manager selection already has an owner.
    pub fn check_other_compositor(conn: &RustConnection, atoms: &AtomRegistry) -> Result<(), Error> {
        let owner = conn.get_selection_owner(atoms.wm_cm_sn())?.reply()?.owner;
        if owner != x11rb::NONE {
            warn!(owner, "The compositing manager selection is already owned");
            return Err(Error::AnotherCompositorRunning);
        }
        Ok(())
    }

    /// Creates the unmapped 1×1 InputOnly selection window and touches a
    /// property on it to obtain a server timestamp for the claim.
    pub fn begin(conn: &RustConnection, screen: &Screen, atoms: &AtomRegistry) -> Result<Self, Error> {
        let window = conn.generate_id()?;
        conn.create_window(
            0,
            window,
            screen.root,
            // x, y, width, height, border width
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        conn.change_property8(
            x11rb::protocol::xproto::PropMode::REPLACE,
            window,
            atoms.atoms._NET_WM_NAME,
            atoms.atoms.UTF8_STRING,
            env!("CARGO_PKG_NAME").as_bytes(),
        )?;
        debug!(window, "Compositing manager selection window created");

        Ok(CmRegistration {
            window,
            claimed: false,
        })
    }

    /// The selection window id.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Whether `event` is the tagged `PropertyNotify` of the owner dance.
    pub fn is_owner_property(&self, event: &PropertyNotifyEvent) -> bool {
        !self.claimed && event.window == self.window
    }

    /// Claims the selection with the timestamp of the tagged
    /// `PropertyNotify` and broadcasts the `MANAGER` announcement.
    pub fn claim(
        &mut self,
        conn: &RustConnection,
        root: Window,
        atoms: &AtomRegistry,
        event: &PropertyNotifyEvent,
    ) -> Result<(), Error> {
        conn.set_selection_owner(self.window, atoms.wm_cm_sn(), event.time)?;

        let announce = ClientMessageEvent::new(
            32,
            root,
            atoms.atoms.MANAGER,
            [event.time, atoms.wm_cm_sn(), self.window, 0, 0],
        );
        conn.send_event(false, root, EventMask::STRUCTURE_NOTIFY, announce)?;
        self.claimed = true;
        Ok(())
    }

    /// Verifies that the claim went through.
    pub fn finalise(&self, conn: &RustConnection, atoms: &AtomRegistry) -> Result<(), Error> {
        let owner = conn.get_selection_owner(atoms.wm_cm_sn())?.reply()?.owner;
        if owner != self.window {
            return Err(Error::SelectionOwnershipFailed);
        }
        info!("Compositing manager selection acquired");
        Ok(())
    }
}

/// Redirects all current and future children of the root into off-screen
/// pixmaps and subscribes to the events the dispatcher needs.
pub fn init_redirect(conn: &RustConnection, root: Window) -> Result<(), Error> {
    conn.composite_redirect_subwindows(root, Redirect::MANUAL)?;
    conn.change_window_attributes(
        root,
        &ChangeWindowAttributesAux::new()
            .event_mask(EventMask::SUBSTRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE),
    )?;
    Ok(())
}

/// Enumerates the current children of the root, bottom-most first.
pub fn query_existing_windows(conn: &RustConnection, root: Window) -> Result<Vec<Window>, Error> {
    Ok(conn.query_tree(root)?.reply()?.children)
}
