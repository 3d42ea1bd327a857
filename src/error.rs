use thiserror::Error;

/// Failures surfaced by the backend contract.
///
/// Divergence covers every power-system phenomenon: disconnected equipment,
/// isolated buses, solver non-convergence, a failed optimal power flow
/// stage. It is always resolved into the `(bool, Option<BackendError>)`
/// pair returned by [`Backend::runpf`](crate::Backend::runpf) and never
/// propagates further. Anything that is not a power-system phenomenon is a
/// contract violation and is reported as `InvalidGrid` at load time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("power flow diverged with error: \"{0}\"; check Backend::divergence() for details")]
    Diverged(String),

    #[error("invalid grid state: {0}")]
    InvalidGrid(String),
}
