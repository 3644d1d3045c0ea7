use thiserror::Error;

/// Crate-wide error taxonomy (§7), grouped by failure mode rather than by
/// which module raised it. This is for failures that cross a module
/// boundary and need a uniform `Display` for logging, or that a public
/// entry point (`ConnectionManager::run`, `Hydrator::hydrate_startup`) hands
/// back to its caller. Failures that never leave a single module keep their
/// own local type instead (`ViewportError`, `CoordinateError`,
/// `SpatialError`, `ConfigError`, `HydrateError`).
#[derive(Error, Debug)]
pub enum Error {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("protocol violation from client {client_id}: {reason}")]
    Protocol { client_id: String, reason: String },

    #[error("slow consumer {0}, disconnecting")]
    SlowConsumer(String),

    #[error("malformed upstream record: {0}")]
    MalformedUpstream(String),

    #[error("hydrate failed after exhausting retry budget: {0}")]
    HydrateExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
