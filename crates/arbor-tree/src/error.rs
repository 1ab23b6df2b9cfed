use arbor_coremap::MapError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeError>;

/// Configuration-class errors raised while building or initializing the
/// device tree.
///
/// Everything here is fatal to tree construction: the simulator must not run
/// on an inconsistent topology. Steady-state hardware faults never surface as
/// `TreeError`; they are traced and reported as short transfer counts.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("{path}: missing required property \"{name}\"")]
    MissingProperty { path: String, name: &'static str },

    #[error("{path}: property \"{name}\" is not a {expected}")]
    PropertyType {
        path: String,
        name: &'static str,
        expected: &'static str,
    },

    #[error("{path}: the {model} model does not support {capability}")]
    Unsupported {
        path: String,
        model: &'static str,
        capability: &'static str,
    },

    #[error("{path}: invalid unit address \"{unit}\": {reason}")]
    UnitAddress {
        path: String,
        unit: String,
        reason: String,
    },

    #[error("no device at \"{path}\"")]
    NoSuchDevice { path: String },

    #[error("{path}: {source}")]
    Attach {
        path: String,
        #[source]
        source: MapError,
    },

    #[error("{path}: {source}")]
    HostIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {reason}")]
    Config { path: String, reason: String },
}
