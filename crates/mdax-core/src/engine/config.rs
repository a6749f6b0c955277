pub use crate::core::jacobian::approx::{FdConfig, FdForm, StepType};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Invalid finite-difference options on component '{component}': {source}")]
    Component {
        component: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    #[default]
    Direct,
    Krylov,
    GaussSeidel,
}

/// How the derivative linear systems are solved. A solver may carry another solver
/// configuration as its preconditioner (Krylov) or as its diagonal block solver (Gauss-Seidel).
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolverConfig {
    pub kind: LinearSolverKind,
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Krylov subspace size before a restart.
    pub restart: usize,
    pub preconditioner: Option<Box<LinearSolverConfig>>,
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            kind: LinearSolverKind::Direct,
            tolerance: 1e-10,
            max_iterations: 1000,
            restart: 50,
            preconditioner: None,
        }
    }
}

impl LinearSolverConfig {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn krylov() -> Self {
        Self {
            kind: LinearSolverKind::Krylov,
            ..Self::default()
        }
    }

    pub fn gauss_seidel() -> Self {
        Self {
            kind: LinearSolverKind::GaussSeidel,
            ..Self::default()
        }
    }

    pub fn with_preconditioner(mut self, preconditioner: LinearSolverConfig) -> Self {
        self.preconditioner = Some(Box::new(preconditioner));
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_restart(mut self, restart: usize) -> Self {
        self.restart = restart;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "tolerance",
                reason: format!("must be positive, got {}", self.tolerance),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.kind == LinearSolverKind::Krylov && self.restart == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "restart",
                reason: "must be at least 1".to_string(),
            });
        }
        match &self.preconditioner {
            Some(inner) => inner.validate(),
            None => Ok(()),
        }
    }
}

/// Which propagation direction the orchestrator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSelection {
    /// Direct when there are no more design variables than responses, adjoint otherwise.
    #[default]
    Auto,
    Direct,
    Adjoint,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivativeConfig {
    pub fd: FdConfig,
    pub linear_solver: LinearSolverConfig,
    pub mode: ModeSelection,
    /// Approximate every component's partials even where analytic ones exist.
    pub force_fd: bool,
}

impl DerivativeConfig {
    /// Parses a TOML document. Absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Checks the step size and the linear solver settings, preconditioners included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_fd(&self.fd)?;
        self.linear_solver.validate()
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: file::FileConfig = toml::from_str(content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        file.into_builder().build()
    }
}

/// The step must be positive and finite; the same rule applies to per-component overrides.
pub(crate) fn validate_fd(fd: &FdConfig) -> Result<(), ConfigError> {
    if !fd.step_size.is_finite() || fd.step_size <= 0.0 {
        return Err(ConfigError::InvalidParameter {
            name: "fd_step_size",
            reason: format!("must be a positive finite number, got {}", fd.step_size),
        });
    }
    Ok(())
}

#[derive(Default)]
pub struct DerivativeConfigBuilder {
    fd_form: Option<FdForm>,
    fd_step_size: Option<f64>,
    fd_step_type: Option<StepType>,
    linear_solver: Option<LinearSolverConfig>,
    mode: Option<ModeSelection>,
    force_fd: Option<bool>,
}

impl DerivativeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fd_form(mut self, form: FdForm) -> Self {
        self.fd_form = Some(form);
        self
    }
    pub fn fd_step_size(mut self, step: f64) -> Self {
        self.fd_step_size = Some(step);
        self
    }
    pub fn fd_step_type(mut self, step_type: StepType) -> Self {
        self.fd_step_type = Some(step_type);
        self
    }
    pub fn linear_solver(mut self, solver: LinearSolverConfig) -> Self {
        self.linear_solver = Some(solver);
        self
    }
    pub fn mode(mut self, mode: ModeSelection) -> Self {
        self.mode = Some(mode);
        self
    }
    pub fn force_fd(mut self, force: bool) -> Self {
        self.force_fd = Some(force);
        self
    }

    pub fn build(self) -> Result<DerivativeConfig, ConfigError> {
        let defaults = FdConfig::default();
        let config = DerivativeConfig {
            fd: FdConfig {
                form: self.fd_form.unwrap_or(defaults.form),
                step_size: self.fd_step_size.unwrap_or(defaults.step_size),
                step_type: self.fd_step_type.unwrap_or(defaults.step_type),
            },
            linear_solver: self.linear_solver.unwrap_or_default(),
            mode: self.mode.unwrap_or_default(),
            force_fd: self.force_fd.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }
}

mod file {
    use super::*;

    #[derive(Deserialize, Debug, Default)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    pub(super) struct FileConfig {
        fd: Option<FileFdConfig>,
        linear_solver: Option<FileLinearSolverConfig>,
        mode: Option<ModeSelection>,
        force_fd: Option<bool>,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    struct FileFdConfig {
        form: Option<FdForm>,
        step_size: Option<f64>,
        step_type: Option<StepType>,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    struct FileLinearSolverConfig {
        kind: Option<LinearSolverKind>,
        tolerance: Option<f64>,
        max_iterations: Option<usize>,
        restart: Option<usize>,
        preconditioner: Option<Box<FileLinearSolverConfig>>,
    }

    impl FileLinearSolverConfig {
        fn into_config(self) -> LinearSolverConfig {
            let defaults = LinearSolverConfig::default();
            LinearSolverConfig {
                kind: self.kind.unwrap_or(defaults.kind),
                tolerance: self.tolerance.unwrap_or(defaults.tolerance),
                max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
                restart: self.restart.unwrap_or(defaults.restart),
                preconditioner: self.preconditioner.map(|p| Box::new(p.into_config())),
            }
        }
    }

    impl FileConfig {
        pub(super) fn into_builder(self) -> DerivativeConfigBuilder {
            let mut builder = DerivativeConfigBuilder::new();
            if let Some(fd) = self.fd {
                builder.fd_form = fd.form;
                builder.fd_step_size = fd.step_size;
                builder.fd_step_type = fd.step_type;
            }
            builder.linear_solver = self.linear_solver.map(FileLinearSolverConfig::into_config);
            builder.mode = self.mode;
            builder.force_fd = self.force_fd;
            builder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_values() {
        let config = DerivativeConfigBuilder::new().build().unwrap();
        assert_eq!(config.fd.form, FdForm::Forward);
        assert_eq!(config.fd.step_size, 1e-6);
        assert_eq!(config.fd.step_type, StepType::Absolute);
        assert_eq!(config.linear_solver.kind, LinearSolverKind::Direct);
        assert_eq!(config.linear_solver.tolerance, 1e-10);
        assert_eq!(config.mode, ModeSelection::Auto);
        assert!(!config.force_fd);
    }

    #[test]
    fn builder_rejects_non_positive_step_and_tolerance() {
        assert!(matches!(
            DerivativeConfigBuilder::new().fd_step_size(0.0).build(),
            Err(ConfigError::InvalidParameter { name: "fd_step_size", .. })
        ));
        let solver = LinearSolverConfig::krylov()
            .with_preconditioner(LinearSolverConfig::gauss_seidel().with_tolerance(-1.0));
        assert!(matches!(
            DerivativeConfigBuilder::new().linear_solver(solver).build(),
            Err(ConfigError::InvalidParameter { name: "tolerance", .. })
        ));
    }

    #[test]
    fn toml_with_nested_preconditioner_is_parsed() {
        let config = DerivativeConfig::from_toml_str(
            r#"
            mode = "adjoint"
            force-fd = true

            [fd]
            form = "complex_step"
            step-size = 1e-30

            [linear-solver]
            kind = "krylov"
            tolerance = 1e-12
            restart = 20

            [linear-solver.preconditioner]
            kind = "gauss_seidel"
            max-iterations = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, ModeSelection::Adjoint);
        assert!(config.force_fd);
        assert_eq!(config.fd.form, FdForm::ComplexStep);
        assert_eq!(config.linear_solver.kind, LinearSolverKind::Krylov);
        assert_eq!(config.linear_solver.restart, 20);
        let pc = config.linear_solver.preconditioner.unwrap();
        assert_eq!(pc.kind, LinearSolverKind::GaussSeidel);
        assert_eq!(pc.max_iterations, 3);
        assert_eq!(pc.tolerance, 1e-10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DerivativeConfig::from_toml_str("solver = \"direct\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn load_reads_from_disk_and_reports_missing_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[linear-solver]\nkind = \"gauss_seidel\"").unwrap();
        let config = DerivativeConfig::load(file.path()).unwrap();
        assert_eq!(config.linear_solver.kind, LinearSolverKind::GaussSeidel);

        let missing = file.path().with_extension("absent");
        assert!(matches!(
            DerivativeConfig::load(&missing),
            Err(ConfigError::Io { .. })
        ));
    }
}
