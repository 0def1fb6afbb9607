use std::fmt;

use crate::identity::ObjectId;

#[derive(Debug)]
pub enum Error {
    /// The repository or its object database could not be opened.
    StoreUnavailable(String),
    /// The requested object is not in the store.
    NotFound(ObjectId),
    /// A filesystem path that does not name a content object (lock files, packs, temp files).
    NotAnObjectPath(String),
    /// The payload does not have the shape its kind requires.
    MalformedObject { id: ObjectId, reason: String },
    /// Send failure or disconnect on the observer connection.
    Transport(String),
    Timeout(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Error {
    pub fn malformed(id: &ObjectId, reason: impl Into<String>) -> Self {
        Error::MalformedObject {
            id: id.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StoreUnavailable(msg) => write!(f, "Object store unavailable: {}", msg),
            Error::NotFound(id) => write!(f, "Object not found: {}", id),
            Error::NotAnObjectPath(path) => write!(f, "Not an object path: {}", path),
            Error::MalformedObject { id, reason } => {
                write!(f, "Malformed object {}: {}", id, reason)
            }
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Timeout(what) => write!(f, "Timed out: {}", what),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}
