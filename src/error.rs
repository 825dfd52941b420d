//! Error types emitted by the compositor core.
//!
//! Startup errors are fatal: the binary prints a single line to standard
//! error and exits non-zero. In-flight X protocol errors never reach these
//! types; the event dispatcher logs them with decoded labels and treats the
//! offending window as gone.

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

use crate::config::ConfigError;

/// An error emitted during compositor setup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connecting to the X server failed.
    #[error("Cannot open display")]
    CannotOpenDisplay(#[source] ConnectError),

    /// Another client already owns the compositing manager selection, or
    /// has already redirected the subwindows of the root.
    #[error("Another compositing manager is already running")]
    AnotherCompositorRunning,

    /// A required X11 extension is missing or too old.
    #[error(transparent)]
    MissingExtension(#[from] MissingExtensionError),

    /// One of the atoms required by the compositor could not be interned.
    #[error("Cannot initialise atoms")]
    AtomInternFailed(#[source] ReplyError),

    /// The configured rendering backend is not known.
    #[error("Cannot load rendering backend {0:?}")]
    BackendLoadFailed(String),

    /// A configured plugin is not known or carries an invalid name.
    #[error("Cannot load plugin {0:?}")]
    PluginLoadFailed(String),

    /// Ownership of `_NET_WM_CM_Sn` could not be acquired.
    #[error("Could not acquire ownership of the compositing manager selection")]
    SelectionOwnershipFailed,

    /// A plugin requirement check failed.
    #[error("Plugin {0:?} requirements not met")]
    RequirementsNotMet(String),

    /// The server ran out of resource ids.
    #[error("The X server ran out of resource ids")]
    ResourceExhausted,

    /// Some protocol error occurred during setup.
    #[error("X protocol error during setup")]
    Protocol(#[source] ReplyOrIdError),

    /// The configuration file could not be located or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Self::CannotOpenDisplay(err)
    }
}

impl From<ReplyOrIdError> for Error {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::IdsExhausted => Self::ResourceExhausted,
            other => Self::Protocol(other),
        }
    }
}

impl From<ReplyError> for Error {
    fn from(err: ReplyError) -> Self {
        Self::Protocol(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Protocol(err.into())
    }
}

/// An error that occurs when a required X11 extension is not usable.
#[derive(Debug, thiserror::Error)]
pub enum MissingExtensionError {
    /// An extension was not found.
    #[error("Extension \"{name}\" version {major}.{minor} was not found")]
    NotFound {
        /// The name of the required extension.
        name: &'static str,
        /// The minimum required major version of the extension.
        major: u32,
        /// The minimum required minor version of the extension.
        minor: u32,
    },

    /// An extension was present, but its version is too low.
    #[error("Extension \"{name}\" version {required_major}.{required_minor} is required but only version {available_major}.{available_minor} is available")]
    WrongVersion {
        /// The name of the extension.
        name: &'static str,
        /// The minimum required major version of the extension.
        required_major: u32,
        /// The minimum required minor version of the extension.
        required_minor: u32,
        /// The major version available on the X server.
        available_major: u32,
        /// The minor version available on the X server.
        available_minor: u32,
    },
}
