//! Effect plugins and their host.
//!
//! Plugins are a fixed compile-time set, instantiated in the order given by
//! the configuration file. The host broadcasts dispatcher events to every
//! plugin that is enabled (its requirements were met) and activated (the
//! plugin decided it is currently in effect). The opacity plugin, when
//! configured, is forced to the tail of the list so it observes the effects
//! of every other plugin first.

use tracing::{debug, warn};
use x11rb::protocol::{
    damage,
    randr,
    xproto::{
        ButtonReleaseEvent, CirculateNotifyEvent, ConfigureNotifyEvent, CreateNotifyEvent,
        DestroyNotifyEvent, KeyPressEvent, KeyReleaseEvent, MapNotifyEvent, MappingNotifyEvent,
        MotionNotifyEvent, PropertyNotifyEvent, ReparentNotifyEvent, UnmapNotifyEvent,
    },
};

use crate::{compositor::Compositor, window::Window};

/// A window with no opacity plugin answer is painted fully opaque.
pub const OPAQUE: u16 = 0xffff;

/// Contract implemented by effect plugins.
///
/// Every hook has an empty default so plugins only implement what they care
/// about. Plugins may read the registry during event delivery and the paint
/// hooks but must not mutate the stacking order.
#[allow(unused_variables)]
pub trait Plugin {
    /// The plugin name, an ASCII identifier matching `[a-z][a-z0-9_-]*`.
    fn name(&self) -> &'static str;

    /// Whether the plugin effect is currently in effect. Hooks of
    /// deactivated plugins are not invoked.
    fn activated(&self) -> bool;

    /// Checked once after startup; a plugin whose requirements are not met
    /// is disabled until a later `PropertyNotify` re-validates it.
    fn check_requirements(&mut self, comp: &Compositor) -> bool {
        true
    }

    /// Hook called when managing the windows found at startup.
    fn window_manage_existing(&mut self, comp: &mut Compositor, windows: &[Window]) {}

    /// The effective opacity this plugin assigns to the window, if any.
    fn window_get_opacity(&self, window: &Window) -> Option<u16> {
        None
    }

    /// Hook run before the scheduler even considers whether to repaint, so
    /// plugins can grow or shrink the damaged region at their convenience.
    fn pre_paint(&mut self, comp: &mut Compositor) {}

    /// Hook run after all windows have been repainted.
    fn post_paint(&mut self, comp: &mut Compositor) {}

    fn on_damage(&mut self, comp: &mut Compositor, event: &damage::NotifyEvent, window: Option<&Window>) {}
    fn on_screen_change(&mut self, comp: &mut Compositor, event: &randr::ScreenChangeNotifyEvent) {}
    fn on_key_press(&mut self, comp: &mut Compositor, event: &KeyPressEvent, window: Option<&Window>) {}
    fn on_key_release(&mut self, comp: &mut Compositor, event: &KeyReleaseEvent, window: Option<&Window>) {}
    fn on_button_release(&mut self, comp: &mut Compositor, event: &ButtonReleaseEvent, window: Option<&Window>) {
    }
    fn on_motion(&mut self, comp: &mut Compositor, event: &MotionNotifyEvent) {}
    fn on_circulate(&mut self, comp: &mut Compositor, event: &CirculateNotifyEvent, window: Option<&Window>) {}
    fn on_configure(&mut self, comp: &mut Compositor, event: &ConfigureNotifyEvent, window: Option<&Window>) {}
    fn on_create(&mut self, comp: &mut Compositor, event: &CreateNotifyEvent, window: Option<&Window>) {}
    fn on_destroy(&mut self, comp: &mut Compositor, event: &DestroyNotifyEvent, window: Option<&Window>) {}
    fn on_map(&mut self, comp: &mut Compositor, event: &MapNotifyEvent, window: Option<&Window>) {}
    fn on_reparent(&mut self, comp: &mut Compositor, event: &ReparentNotifyEvent, window: Option<&Window>) {}
    fn on_unmap(&mut self, comp: &mut Compositor, event: &UnmapNotifyEvent, window: Option<&Window>) {}
    fn on_property(&mut self, comp: &mut Compositor, event: &PropertyNotifyEvent, window: Option<&Window>) {}
    fn on_mapping(&mut self, comp: &mut Compositor, event: &MappingNotifyEvent) {}
}

/// Whether `name` is a well-formed plugin name.
pub fn is_valid_plugin_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Resolves a configured plugin name to an instance.
///
/// The core ships no effect plugins; downstream builds register theirs here.
pub fn by_name(name: &str) -> Option<Box<dyn Plugin>> {
    let _ = name;
    None
}

struct PluginEntry {
    enable: bool,
    plugin: Box<dyn Plugin>,
}

/// The ordered plugin list.
#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<PluginEntry>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|entry| entry.plugin.name()))
            .finish()
    }
}

macro_rules! broadcast {
    ($(#[$meta:meta])* $fn_name:ident, $hook:ident, $event:ty) => {
        $(#[$meta])*
        pub fn $fn_name(&mut self, comp: &mut Compositor, event: &$event, window: Option<&Window>) {
            for entry in &mut self.plugins {
                if entry.enable && entry.plugin.activated() {
                    entry.plugin.$hook(comp, event, window);
                }
            }
        }
    };
}

impl PluginHost {
    pub fn new() -> Self {
        PluginHost::default()
    }

    /// Instantiates the configured plugins in order. Unknown or invalidly
    /// named plugins are skipped with a warning; they never abort startup.
    pub fn load(names: &[String]) -> Self {
        let mut host = PluginHost::new();
        for name in names {
            if !is_valid_plugin_name(name) {
                warn!(%name, "Invalid plugin name, skipping");
                continue;
            }
            match by_name(name) {
                Some(plugin) => host.push(plugin),
                None => warn!(%name, "Cannot load plugin"),
            }
        }
        host
    }

    /// Appends a plugin, keeping the opacity plugin at the tail.
    pub fn push(&mut self, plugin: Box<dyn Plugin>) {
        debug!(name = plugin.name(), "Plugin loaded");
        let entry = PluginEntry { enable: true, plugin };
        let tail_is_opacity = self
            .plugins
            .last()
            .is_some_and(|last| last.plugin.name() == "opacity");
        if tail_is_opacity && entry.plugin.name() != "opacity" {
            let at = self.plugins.len() - 1;
            self.plugins.insert(at, entry);
        } else {
            self.plugins.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in invocation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|entry| entry.plugin.name()).collect()
    }

    /// Runs every plugin's requirement check, disabling those that fail.
    pub fn check_requirements(&mut self, comp: &Compositor) {
        for entry in &mut self.plugins {
            entry.enable = entry.plugin.check_requirements(comp);
            if !entry.enable {
                warn!(name = entry.plugin.name(), "Plugin requirements not met, disabled");
            }
        }
    }

    /// The effective opacity of a window: the answer of the first plugin in
    /// list order that has one, fully opaque otherwise.
    pub fn window_opacity(&self, window: &Window) -> u16 {
        self.plugins
            .iter()
            .filter(|entry| entry.enable && entry.plugin.activated())
            .find_map(|entry| entry.plugin.window_get_opacity(window))
            .unwrap_or(OPAQUE)
    }

    pub fn window_manage_existing(&mut self, comp: &mut Compositor, windows: &[Window]) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.window_manage_existing(comp, windows);
            }
        }
    }

    pub fn pre_paint(&mut self, comp: &mut Compositor) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.pre_paint(comp);
            }
        }
    }

    pub fn post_paint(&mut self, comp: &mut Compositor) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.post_paint(comp);
            }
        }
    }

    broadcast!(damage, on_damage, damage::NotifyEvent);
    broadcast!(key_press, on_key_press, KeyPressEvent);
    broadcast!(key_release, on_key_release, KeyReleaseEvent);
    broadcast!(button_release, on_button_release, ButtonReleaseEvent);
    broadcast!(circulate, on_circulate, CirculateNotifyEvent);
    broadcast!(configure, on_configure, ConfigureNotifyEvent);
    broadcast!(create, on_create, CreateNotifyEvent);
    broadcast!(destroy, on_destroy, DestroyNotifyEvent);
    broadcast!(map, on_map, MapNotifyEvent);
    broadcast!(reparent, on_reparent, ReparentNotifyEvent);
    broadcast!(unmap, on_unmap, UnmapNotifyEvent);

    pub fn screen_change(&mut self, comp: &mut Compositor, event: &randr::ScreenChangeNotifyEvent) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.on_screen_change(comp, event);
            }
        }
    }

    pub fn motion(&mut self, comp: &mut Compositor, event: &MotionNotifyEvent) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.on_motion(comp, event);
            }
        }
    }

    pub fn mapping(&mut self, comp: &mut Compositor, event: &MappingNotifyEvent) {
        for entry in &mut self.plugins {
            if entry.enable && entry.plugin.activated() {
                entry.plugin.on_mapping(comp, event);
            }
        }
    }

    /// Property notifications go to every plugin with the hook, enabled or
    /// not: requirements are atom-based, so a plugin disabled at startup may
    /// become satisfiable after a property change and is re-queried here.
    pub fn property(&mut self, comp: &mut Compositor, event: &PropertyNotifyEvent, window: Option<&Window>) {
        for entry in &mut self.plugins {
            entry.plugin.on_property(comp, event, window);
            if !entry.enable && entry.plugin.check_requirements(comp) {
                debug!(name = entry.plugin.name(), "Plugin requirements now met, enabled");
                entry.enable = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOpacity {
        name: &'static str,
        active: bool,
        opacity: Option<u16>,
    }

    impl Plugin for FixedOpacity {
        fn name(&self) -> &'static str {
            self.name
        }

        fn activated(&self) -> bool {
            self.active
        }

        fn window_get_opacity(&self, _window: &Window) -> Option<u16> {
            self.opacity
        }
    }

    fn plugin(name: &'static str, active: bool, opacity: Option<u16>) -> Box<dyn Plugin> {
        Box::new(FixedOpacity {
            name,
            active,
            opacity,
        })
    }

    #[test]
    fn plugin_name_validation() {
        assert!(is_valid_plugin_name("expose"));
        assert!(is_valid_plugin_name("opacity"));
        assert!(is_valid_plugin_name("fade-in2"));
        assert!(is_valid_plugin_name("drop_shadow"));
        assert!(!is_valid_plugin_name(""));
        assert!(!is_valid_plugin_name("2fast"));
        assert!(!is_valid_plugin_name("Expose"));
        assert!(!is_valid_plugin_name("with space"));
    }

    #[test]
    fn opacity_plugin_is_kept_at_the_tail() {
        let mut host = PluginHost::new();
        host.push(plugin("fade", true, None));
        host.push(plugin("opacity", true, None));
        host.push(plugin("expose", true, None));
        host.push(plugin("shadow", true, None));
        assert_eq!(host.names(), vec!["fade", "expose", "shadow", "opacity"]);
    }

    #[test]
    fn first_opacity_answer_wins() {
        let mut host = PluginHost::new();
        host.push(plugin("first", true, None));
        host.push(plugin("second", true, Some(0x8000)));
        host.push(plugin("third", true, Some(0x1000)));

        let window = crate::window::test_support::detached(0x100);
        assert_eq!(host.window_opacity(&window), 0x8000);
    }

    #[test]
    fn no_answer_means_opaque() {
        let mut host = PluginHost::new();
        host.push(plugin("quiet", true, None));

        let window = crate::window::test_support::detached(0x100);
        assert_eq!(host.window_opacity(&window), OPAQUE);
    }

    #[test]
    fn deactivated_plugins_are_skipped() {
        let mut host = PluginHost::new();
        host.push(plugin("dormant", false, Some(0x1000)));

        let window = crate::window::test_support::detached(0x100);
        assert_eq!(host.window_opacity(&window), OPAQUE);
    }
}
