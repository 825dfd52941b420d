//! Queries the X11 extensions the compositor depends on.
//!
//! Composite, Damage and XFixes are hard requirements; RandR is queried as
//! well but its absence only costs the refresh-rate derivation. Next to the
//! negotiated version, the major opcode and the first event/error codes of
//! every extension are recorded for error labeling by the event dispatcher.

use x11rb::connection::RequestConnection as _;
use x11rb::rust_connection::RustConnection;

use crate::error::{Error, MissingExtensionError};

/// Presence data of one X11 extension.
#[derive(Debug, Copy, Clone)]
pub struct ExtensionData {
    /// The version negotiated with the server.
    pub version: (u32, u32),
    /// The major opcode requests of this extension are issued under.
    pub major_opcode: u8,
    /// The event code extension events start at.
    pub first_event: u8,
    /// The error code extension errors start at.
    pub first_error: u8,
}

/// The extension macro.
///
/// Generates the `Extensions` struct which checks for the presence of the
/// named X11 extensions and stores the version supplied by the X server
/// along with the opcode information needed for error labeling. The
/// extension ident must match the module path `x11rb::protocol::<name>`.
macro_rules! extensions {
    (
        $(
            $extension:ident { // Extension name for path lookup
                $extension_fn:ident, // Function used to negotiate the extension version
                minimum: ($min_major:expr, $min_minor:expr),
                request: ($req_major:expr, $req_minor:expr),
            },
        )*
    ) => {
        /// Versions and opcode data of the extensions the compositor uses.
        #[derive(Debug, Copy, Clone)]
        pub struct Extensions {
            $(
                #[doc = concat!(" The `", stringify!($extension), "` extension.")]
                pub $extension: ExtensionData,
            )*
            /// The RandR extension, absent on servers without it.
            pub randr: Option<ExtensionData>,
        }

        impl Extensions {
            /// Verifies presence and minimum versions of all extensions.
            pub fn check_extensions(connection: &RustConnection) -> Result<Extensions, Error> {
                $(
                    let $extension = {
                        use x11rb::protocol::$extension::{ConnectionExt as _, X11_EXTENSION_NAME};

                        match connection.extension_information(X11_EXTENSION_NAME)? {
                            Some(info) => {
                                let version = connection.$extension_fn($req_major, $req_minor)?.reply()?;

                                #[allow(unused_comparisons)] // Macro comparisons
                                if version.major_version > $min_major
                                    || (version.major_version == $min_major && version.minor_version >= $min_minor)
                                {
                                    tracing::info!(
                                        "Loaded extension {} version {}.{}",
                                        X11_EXTENSION_NAME,
                                        version.major_version,
                                        version.minor_version,
                                    );

                                    ExtensionData {
                                        version: (version.major_version, version.minor_version),
                                        major_opcode: info.major_opcode,
                                        first_event: info.first_event,
                                        first_error: info.first_error,
                                    }
                                } else {
                                    tracing::error!(
                                        "{} extension version is too low (have {}.{}, expected {}.{})",
                                        X11_EXTENSION_NAME,
                                        version.major_version,
                                        version.minor_version,
                                        $min_major,
                                        $min_minor,
                                    );

                                    return Err(MissingExtensionError::WrongVersion {
                                        name: X11_EXTENSION_NAME,
                                        required_major: $min_major,
                                        required_minor: $min_minor,
                                        available_major: version.major_version,
                                        available_minor: version.minor_version,
                                    }.into());
                                }
                            }
                            None => {
                                tracing::error!("{} extension not found", X11_EXTENSION_NAME);

                                return Err(MissingExtensionError::NotFound {
                                    name: X11_EXTENSION_NAME,
                                    major: $min_major,
                                    minor: $min_minor,
                                }
                                .into());
                            }
                        }
                    };
                )*

                let randr = query_randr(connection)?;

                Ok(Extensions {
                    $(
                        $extension,
                    )*
                    randr,
                })
            }
        }
    };
}

extensions! {
    composite {
        composite_query_version,
        minimum: (0, 3),
        request: (0, 4),
    },

    damage {
        damage_query_version,
        minimum: (1, 1),
        request: (1, 1),
    },

    xfixes {
        xfixes_query_version,
        minimum: (2, 0),
        request: (4, 0),
    },
}

/// RandR is only needed to derive the screen refresh rate, so a missing or
/// outdated extension downgrades to the default repaint interval instead of
/// failing startup.
fn query_randr(connection: &RustConnection) -> Result<Option<ExtensionData>, Error> {
    use x11rb::protocol::randr::{ConnectionExt as _, X11_EXTENSION_NAME};

    let Some(info) = connection.extension_information(X11_EXTENSION_NAME)? else {
        tracing::warn!("{} extension not found, using the default repaint interval", X11_EXTENSION_NAME);
        return Ok(None);
    };

    let version = connection.randr_query_version(1, 4)?.reply()?;
    if version.major_version < 1 || (version.major_version == 1 && version.minor_version < 3) {
        tracing::warn!(
            "{} extension version is too low (have {}.{}, expected 1.3), using the default repaint interval",
            X11_EXTENSION_NAME,
            version.major_version,
            version.minor_version,
        );
        return Ok(None);
    }

    tracing::info!(
        "Loaded extension {} version {}.{}",
        X11_EXTENSION_NAME,
        version.major_version,
        version.minor_version,
    );

    Ok(Some(ExtensionData {
        version: (version.major_version, version.minor_version),
        major_opcode: info.major_opcode,
        first_event: info.first_event,
        first_error: info.first_error,
    }))
}
