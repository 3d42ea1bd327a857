use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Backend tuning knobs.
///
/// `acceleration_available` is resolved once at startup (from the config
/// file or by the embedding application) and threaded into the solvers;
/// it is never global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Termination tolerance on per unit P & Q mismatch.
    pub tolerance: f64,
    /// Maximum number of iterations for Newton's method.
    pub max_iterations: usize,
    /// Power above which an isolated storage unit is treated as a
    /// divergence instead of being silently disconnected, in MW.
    pub storage_tol_mw: f64,
    /// Whether an accelerated factorization backend is available.
    /// Advisory only, see [`SolveOpt`](crate::SolveOpt).
    pub acceleration_available: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 10,
            storage_tol_mw: 1e-5,
            acceleration_available: false,
        }
    }
}

impl BackendConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading backend config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing backend config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_solver_expectations() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.tolerance, 1e-8);
        assert_eq!(cfg.max_iterations, 10);
        assert!(!cfg.acceleration_available);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: BackendConfig = toml::from_str("max_iterations = 25").unwrap();
        assert_eq!(cfg.max_iterations, 25);
        assert_eq!(cfg.tolerance, 1e-8);
    }

    #[test]
    fn loads_overrides_from_a_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "tolerance = 1e-6").unwrap();
        writeln!(file, "max_iterations = 30").unwrap();
        let cfg = BackendConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(cfg.tolerance, 1e-6);
        assert_eq!(cfg.max_iterations, 30);
        assert!(!cfg.acceleration_available);
    }

    #[test]
    fn missing_config_file_names_the_path() {
        let err = BackendConfig::from_toml_file("/no/such/backend.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/no/such/backend.toml"));
    }
}
