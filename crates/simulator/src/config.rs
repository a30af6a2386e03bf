//! Parameter files and command-line overrides.

use pathcheck_simulation::{ChoiceStrategy, SimulationError, SimulationMode, SimulationParams};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors raised while assembling the parameters of a run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The parameter file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The parameter file is not valid TOML for [`SimulationParams`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A command-line value could not be interpreted.
    #[error("invalid {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    /// No test was named on the command line.
    #[error("no test selected (use --test, or --list to see the registry)")]
    MissingTest,

    /// The engine rejected the run.
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

/// Parse parameters from TOML text; `source` names the text in errors.
pub fn parse_params(text: &str, source: &Path) -> Result<SimulationParams, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Parse {
        path: source.to_path_buf(),
        source: e,
    })
}

/// Read a TOML parameter file.
pub fn load_params(path: &Path) -> Result<SimulationParams, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let params = parse_params(&text, path)?;
    debug!(path = %path.display(), mode = ?params.mode, "Loaded parameter file");
    Ok(params)
}

/// Parse a `--mode` value.
pub fn parse_mode(value: &str) -> Result<SimulationMode, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "model-check" | "mc" => Ok(SimulationMode::ModelCheck),
        "timed" | "sim" => Ok(SimulationMode::Timed),
        _ => Err(ConfigError::InvalidValue {
            key: "mode",
            value: value.to_string(),
        }),
    }
}

/// Command-line values that win over the parameter file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overrides {
    pub mode: Option<SimulationMode>,
    pub seed: Option<u64>,
    pub max_paths: Option<u64>,
    pub max_steps: Option<u64>,
    /// Replaying a file switches the choice strategy to replay.
    pub replay: Option<PathBuf>,
}

impl Overrides {
    pub fn with_mode(mut self, mode: SimulationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_paths(mut self, max_paths: u64) -> Self {
        self.max_paths = Some(max_paths);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_replay(mut self, file: impl Into<PathBuf>) -> Self {
        self.replay = Some(file.into());
        self
    }

    /// Layer these overrides on top of `params`.
    pub fn apply(&self, mut params: SimulationParams) -> SimulationParams {
        if let Some(mode) = self.mode {
            // A timed run started from a model-checking file has no search
            // frontier to enumerate.
            if mode == SimulationMode::Timed && params.choice_strategy == ChoiceStrategy::Search {
                params.choice_strategy = ChoiceStrategy::Random;
            }
            params = params.with_mode(mode);
        }
        if let Some(seed) = self.seed {
            params = params.with_seed(seed);
        }
        if let Some(max_paths) = self.max_paths {
            params = params.with_max_paths(max_paths);
        }
        if let Some(max_steps) = self.max_steps {
            params = params.with_max_steps(max_steps);
        }
        if let Some(file) = &self.replay {
            params = params.with_replay_file(file.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_params_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MODE = \"timed\"\nCHOICE_STRATEGY = \"random\"\nMAX_PATHS = 12").unwrap();
        let params = load_params(file.path()).unwrap();
        assert_eq!(params.mode, SimulationMode::Timed);
        assert_eq!(params.choice_strategy, ChoiceStrategy::Random);
        assert_eq!(params.max_paths, 12);
        assert_eq!(params.queue_size, 20);
    }

    #[test]
    fn test_missing_file() {
        let err = load_params(Path::new("/nonexistent/params.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_bad_value_is_a_parse_error() {
        let err = parse_params("MAX_PATHS = \"lots\"", Path::new("inline")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("failed to parse inline"));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("timed").unwrap(), SimulationMode::Timed);
        assert_eq!(parse_mode("MC").unwrap(), SimulationMode::ModelCheck);
        assert!(matches!(
            parse_mode("fast"),
            Err(ConfigError::InvalidValue { key: "mode", .. })
        ));
    }

    #[test]
    fn test_overrides_win() {
        let params = Overrides::default()
            .with_seed(9)
            .with_max_paths(3)
            .with_max_steps(100)
            .apply(SimulationParams::default().with_seed(1));
        assert_eq!(params.seed, 9);
        assert_eq!(params.max_paths, 3);
        assert_eq!(params.max_steps, 100);
        assert_eq!(params.choice_strategy, ChoiceStrategy::Search);
    }

    #[test]
    fn test_timed_override_leaves_search() {
        let params = Overrides::default()
            .with_mode(SimulationMode::Timed)
            .apply(SimulationParams::default());
        assert_eq!(params.mode, SimulationMode::Timed);
        assert_eq!(params.choice_strategy, ChoiceStrategy::Random);
    }

    #[test]
    fn test_replay_override() {
        let params = Overrides::default()
            .with_replay("error0.path")
            .apply(SimulationParams::default());
        assert!(params.is_replay());
        assert_eq!(params.replay_file, Some(PathBuf::from("error0.path")));
    }
}
