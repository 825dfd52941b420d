//! The rendering backend contract.
//!
//! The core never draws: painting windows, the background and the final
//! screen composition are delegated through this trait. The core owns the
//! calling cadence and never dereferences backend-private state; the backend
//! owns whatever it hangs off a window's `render_data` and frees it through
//! the `free_window`/`free_window_pixmap` hooks.
//!
//! Backends are a fixed compile-time set resolved by name from the
//! configuration file.

use tracing::trace;

use crate::{compositor::Compositor, error::Error, window::Window};

/// Capability set a rendering backend must implement.
pub trait Renderer {
    /// The name the backend is selected by in the configuration file.
    fn name(&self) -> &'static str;

    /// First initialisation step, run before the compositor claims the
    /// manager selection.
    fn init(&mut self, comp: &mut Compositor) -> Result<(), Error>;

    /// Second initialisation step, run once the extensions are verified.
    fn init_finalise(&mut self, comp: &mut Compositor) -> Result<(), Error>;

    /// Invalidates whatever the backend derived from the root background;
    /// called when the root wallpaper property or the root geometry change.
    fn reset_background(&mut self);

    /// Paints the root background.
    fn paint_background(&mut self, comp: &Compositor);

    /// Paints a single window.
    fn paint_window(&mut self, comp: &Compositor, window: &Window);

    /// Paints the scene bottom-to-top, clipped to the global damage region.
    fn paint_all(&mut self, comp: &Compositor);

    /// Whether `major_opcode` belongs to a backend-specific X extension.
    fn is_request(&self, major_opcode: u8) -> bool;

    /// Label of a backend request, for error reporting.
    fn request_label(&self, minor_opcode: u16) -> Option<&'static str>;

    /// Label of a backend-specific X error code.
    fn error_label(&self, error_code: u8) -> Option<&'static str>;

    /// Drops backend state derived from the window's pixmap; invoked by the
    /// registry every time the pixmap is released.
    fn free_window_pixmap(&mut self, window: &Window);

    /// Drops all backend state of the window; invoked at record removal.
    fn free_window(&mut self, window: &Window);
}

/// Resolves a configured backend name to an instance.
pub fn by_name(name: &str) -> Option<Box<dyn Renderer>> {
    match name {
        "null" => Some(Box::new(NullRenderer)),
        _ => None,
    }
}

/// A backend that draws nothing.
///
/// Useful for headless runs and for exercising the engine in tests; real
/// backends are compiled in by downstream builds.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn name(&self) -> &'static str {
        "null"
    }

    fn init(&mut self, _comp: &mut Compositor) -> Result<(), Error> {
        Ok(())
    }

    fn init_finalise(&mut self, _comp: &mut Compositor) -> Result<(), Error> {
        Ok(())
    }

    fn reset_background(&mut self) {}

    fn paint_background(&mut self, _comp: &Compositor) {}

    fn paint_window(&mut self, _comp: &Compositor, window: &Window) {
        trace!(id = window.id(), "null backend: skipping window paint");
    }

    fn paint_all(&mut self, comp: &Compositor) {
        for window in comp.windows.windows() {
            if comp.windows.is_visible(window) {
                self.paint_window(comp, window);
            }
        }
    }

    fn is_request(&self, _major_opcode: u8) -> bool {
        false
    }

    fn request_label(&self, _minor_opcode: u16) -> Option<&'static str> {
        None
    }

    fn error_label(&self, _error_code: u8) -> Option<&'static str> {
        None
    }

    fn free_window_pixmap(&mut self, _window: &Window) {}

    fn free_window(&mut self, window: &Window) {
        window.state().render_data.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_backend_resolves() {
        let backend = by_name("null").expect("null backend is compiled in");
        assert_eq!(backend.name(), "null");
    }

    #[test]
    fn unknown_backend_does_not_resolve() {
        assert!(by_name("no-such-backend").is_none());
    }
}
