//! Atom registry.
//!
//! All atoms needed by the compositor and the EWMH conventions are interned
//! once at startup in a single batched round-trip. The registry also tracks
//! the root window's `_NET_SUPPORTED` list, which is refreshed lazily when a
//! `PropertyNotify` for it is observed.

use x11rb::{
    atom_manager,
    protocol::xproto::{Atom, AtomEnum, ConnectionExt as _, PropertyNotifyEvent, Window},
    rust_connection::RustConnection,
};

use crate::error::Error;

atom_manager! {
    /// The fixed atom table required by the compositor.
    pub Atoms: AtomsCookie {
        MANAGER,
        UTF8_STRING,
        _NET_SUPPORTED,
        _NET_WM_NAME,

        // Root background properties, watched to detect wallpaper changes.
        _XROOTPMAP_ID,
        _XSETROOT_ID,
        ESETROOT_PMAP_ID,
    }
}

/// Interned atoms plus the dynamic per-screen compositing manager selection.
#[derive(Debug)]
pub struct AtomRegistry {
    pub atoms: Atoms,
    wm_cm_sn: Atom,
    supported: Vec<Atom>,
}

impl AtomRegistry {
    /// Interns the atom table and `_NET_WM_CM_Sn` for the given screen.
    ///
    /// Both cookie sets are sent before the first reply is read, so this is
    /// a single round-trip. Any failure is fatal at startup.
    pub fn new(conn: &RustConnection, screen_nbr: usize) -> Result<Self, Error> {
        let atoms_cookie = Atoms::new(conn).map_err(|err| Error::AtomInternFailed(err.into()))?;
        let selection_name = format!("_NET_WM_CM_S{}", screen_nbr);
        let selection_cookie = conn
            .intern_atom(false, selection_name.as_bytes())
            .map_err(|err| Error::AtomInternFailed(err.into()))?;

        let atoms = atoms_cookie.reply().map_err(Error::AtomInternFailed)?;
        let wm_cm_sn = selection_cookie.reply().map_err(Error::AtomInternFailed)?.atom;

        Ok(AtomRegistry {
            atoms,
            wm_cm_sn,
            supported: Vec::new(),
        })
    }

    /// The `_NET_WM_CM_Sn` selection atom for the managed screen.
    pub fn wm_cm_sn(&self) -> Atom {
        self.wm_cm_sn
    }

    /// Whether `atom` names one of the root background properties.
    pub fn is_background_atom(&self, atom: Atom) -> bool {
        atom == self.atoms._XROOTPMAP_ID
            || atom == self.atoms._XSETROOT_ID
            || atom == self.atoms.ESETROOT_PMAP_ID
    }

    /// Whether `atom` is present in the root window's `_NET_SUPPORTED` list.
    pub fn is_supported(&self, atom: Atom) -> bool {
        self.supported.contains(&atom)
    }

    /// Re-reads `_NET_SUPPORTED` from the root window.
    pub fn refresh_supported(&mut self, conn: &RustConnection, root: Window) -> Result<(), Error> {
        let reply = conn
            .get_property(false, root, self.atoms._NET_SUPPORTED, AtomEnum::ATOM, 0, u32::MAX)?
            .reply()?;
        self.supported = reply.value32().map(|values| values.collect()).unwrap_or_default();
        Ok(())
    }

    /// Refreshes the supported list when the server reports it changed.
    pub fn update_supported(
        &mut self,
        conn: &RustConnection,
        root: Window,
        event: &PropertyNotifyEvent,
    ) -> Result<(), Error> {
        if event.atom == self.atoms._NET_SUPPORTED {
            self.refresh_supported(conn, root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AtomRegistry {
        // Atom values as a server could have assigned them; only the
        // classification logic is under test here.
        AtomRegistry {
            atoms: Atoms {
                MANAGER: 68,
                UTF8_STRING: 339,
                _NET_SUPPORTED: 340,
                _NET_WM_NAME: 341,
                _XROOTPMAP_ID: 342,
                _XSETROOT_ID: 343,
                ESETROOT_PMAP_ID: 344,
            },
            wm_cm_sn: 346,
            supported: vec![341, 350],
        }
    }

    #[test]
    fn background_atoms() {
        let registry = registry();
        assert!(registry.is_background_atom(342));
        assert!(registry.is_background_atom(343));
        assert!(registry.is_background_atom(344));
        assert!(!registry.is_background_atom(341));
        assert!(!registry.is_background_atom(0));
    }

    #[test]
    fn supported_membership() {
        let registry = registry();
        assert!(registry.is_supported(341));
        assert!(registry.is_supported(350));
        assert!(!registry.is_supported(342));
    }
}
