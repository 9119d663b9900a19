//! Compile options and their resolution into what the backend receives.
//!
//! Error probabilities are given directly on [`CompileOptions`]. A backend
//! [`Configuration`] carrying one of them is rejected. Only one of `p_error` (per
//! programmable bootstrapping) and `global_p_error` (whole circuit) may be set.

use common::consts::DEFAULT_P_ERROR_PBS;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(
        "Don't set p_error or global_p_error in the configuration, pass them as direct arguments"
    )]
    PErrorInConfiguration,
    #[error("Please only set one of (p_error, global_p_error) values")]
    BothPErrors,
    #[error("{name} must be a probability in [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("invalid compile options JSON: {0}")]
    Json(String),
}

/// Backend knobs passed through to the compiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub p_error: Option<f64>,
    pub global_p_error: Option<f64>,
    /// Allow features that weaken security guarantees, such as simulation.
    pub enable_unsafe_features: bool,
    pub show_optimizer: bool,
    /// Let the backend parallelize independent loops in the circuit.
    pub loop_parallelize: bool,
}

impl Configuration {
    fn has_p_error_options(&self) -> bool {
        self.p_error.is_some() || self.global_p_error.is_some()
    }
}

/// Options of [`FheModule::compile`](crate::fhe_module::FheModule::compile).
///
/// ```ignore
/// let options = CompileOptions::default().with_p_error(0.01).with_simulation(true);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub configuration: Option<Configuration>,
    pub p_error: Option<f64>,
    pub global_p_error: Option<f64>,
    /// Compile for approximate simulation instead of encrypted execution.
    pub simulate: bool,
    pub show_mlir: bool,
    pub verbose: bool,
}

impl CompileOptions {
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_p_error(mut self, p_error: f64) -> Self {
        self.p_error = Some(p_error);
        self
    }

    pub fn with_global_p_error(mut self, global_p_error: f64) -> Self {
        self.global_p_error = Some(global_p_error);
        self
    }

    pub fn with_simulation(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn with_show_mlir(mut self, show_mlir: bool) -> Self {
        self.show_mlir = show_mlir;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))
    }

    /// Check the error probability settings and apply the defaults.
    pub fn resolve(&self) -> Result<ResolvedCompileOptions, ConfigError> {
        let configuration = self.configuration.clone().unwrap_or_default();
        // Probabilities are only accepted as direct options.
        if configuration.has_p_error_options() {
            return Err(ConfigError::PErrorInConfiguration);
        }
        let (p_error, mut global_p_error) = (self.p_error, self.global_p_error);

        if p_error.is_some() && global_p_error.is_some() {
            return Err(ConfigError::BothPErrors);
        }
        check_probability("p_error", p_error)?;
        check_probability("global_p_error", global_p_error)?;

        if self.simulate && global_p_error.is_some_and(|g| g != 0.0) {
            tracing::warn!("simulation does not support global_p_error, forcing it to 0");
            global_p_error = Some(0.0);
        }
        let p_error = match (p_error, global_p_error) {
            (None, None) => Some(DEFAULT_P_ERROR_PBS),
            (p_error, _) => p_error,
        };

        let resolved = ResolvedCompileOptions {
            configuration,
            p_error,
            global_p_error,
            simulate: self.simulate,
            show_mlir: self.show_mlir,
            verbose: self.verbose,
        };
        tracing::debug!(
            p_error = ?resolved.p_error,
            global_p_error = ?resolved.global_p_error,
            simulate = resolved.simulate,
            "resolved compile options"
        );
        Ok(resolved)
    }
}

fn check_probability(name: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(value) if !(0.0..=1.0).contains(&value) => {
            Err(ConfigError::InvalidProbability { name, value })
        }
        _ => Ok(()),
    }
}

/// Options as handed to the backend. Exactly one of the error probabilities is set, and
/// the configuration carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCompileOptions {
    pub configuration: Configuration,
    pub p_error: Option<f64>,
    pub global_p_error: Option<f64>,
    pub simulate: bool,
    pub show_mlir: bool,
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_pbs_error() {
        let resolved = CompileOptions::default().resolve().unwrap();
        assert_eq!(resolved.p_error, Some(DEFAULT_P_ERROR_PBS));
        assert_eq!(resolved.global_p_error, None);
    }

    #[test]
    fn test_rejects_two_channels() {
        let options = CompileOptions::default()
            .with_configuration(Configuration {
                global_p_error: Some(0.1),
                ..Default::default()
            })
            .with_p_error(0.01);
        assert_eq!(options.resolve(), Err(ConfigError::PErrorInConfiguration));
    }

    #[test]
    fn test_rejects_probability_in_configuration_alone() {
        for configuration in [
            Configuration {
                global_p_error: Some(0.1),
                ..Default::default()
            },
            Configuration {
                p_error: Some(0.01),
                ..Default::default()
            },
        ] {
            let options = CompileOptions::default().with_configuration(configuration);
            assert_eq!(options.resolve(), Err(ConfigError::PErrorInConfiguration));
        }
        let options = CompileOptions::default().with_configuration(Configuration {
            loop_parallelize: true,
            ..Default::default()
        });
        assert!(options.resolve().unwrap().configuration.loop_parallelize);
    }

    #[test]
    fn test_rejects_both_probabilities() {
        let options = CompileOptions::default()
            .with_p_error(0.01)
            .with_global_p_error(0.1);
        assert_eq!(options.resolve(), Err(ConfigError::BothPErrors));
    }

    #[test]
    fn test_simulation_forces_global_error_to_zero() {
        let resolved = CompileOptions::default()
            .with_global_p_error(0.1)
            .with_simulation(true)
            .resolve()
            .unwrap();
        assert_eq!(resolved.global_p_error, Some(0.0));
        assert_eq!(resolved.p_error, None);
    }

    #[test]
    fn test_rejects_out_of_range_probability() {
        let err = CompileOptions::default()
            .with_p_error(1.5)
            .resolve()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidProbability { name: "p_error", .. }
        ));
        assert!(CompileOptions::default().with_p_error(f64::NAN).resolve().is_err());
    }

    #[test]
    fn test_from_json() {
        let options = CompileOptions::from_json(
            r#"{"simulate": true, "p_error": 0.05, "configuration": {"loop_parallelize": true}}"#,
        )
        .unwrap();
        assert!(options.simulate);
        let resolved = options.resolve().unwrap();
        assert_eq!(resolved.p_error, Some(0.05));
        assert!(resolved.configuration.loop_parallelize);
        let options = CompileOptions::from_json(
            r#"{"configuration": {"p_error": 0.05}}"#,
        )
        .unwrap();
        assert_eq!(options.resolve(), Err(ConfigError::PErrorInConfiguration));
        assert!(matches!(
            CompileOptions::from_json("[]"),
            Err(ConfigError::Json(_))
        ));
    }
}
