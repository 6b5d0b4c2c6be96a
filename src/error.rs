use std::io;

/// Errors surfaced directly by proactor calls. Socket-level failures on
/// live connections and listeners are reported through conditions and
/// events instead, so the drain loop stays the single place that observes
/// them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating the proactor's kernel objects failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `accept` was called on a listener that is not listening.
    #[error("listener is not listening")]
    NotListening,
}
