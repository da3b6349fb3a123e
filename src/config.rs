//! Runner configuration and case definition loading.

use crate::model::CaseDefinition;
use crate::source::StaticVariableCatalog;
use crate::step::ExecutorSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Settings shared by every case of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Overall deadline of one HTTP action in seconds.
    pub request_timeout: u64,
    /// Service name to profile (`region+env`) to base URL.
    pub base_urls: HashMap<String, HashMap<String, String>>,
    /// Connection name (`<profile>-<dbType>`) to Postgres URL.
    pub databases: HashMap<String, String>,
    /// Values of the `Config` variable source.
    pub globals: HashMap<String, Value>,
    /// Profile to variable name to value.
    pub profile_variables: HashMap<String, HashMap<String, Value>>,
    /// External file name to content.
    pub external_files: HashMap<String, String>,
    /// Number of cases run concurrently.
    pub parallelism: usize,
    pub continue_on_failure: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            request_timeout: 30,
            base_urls: HashMap::new(),
            databases: HashMap::new(),
            globals: HashMap::new(),
            profile_variables: HashMap::new(),
            external_files: HashMap::new(),
            parallelism: 1,
            continue_on_failure: false,
        }
    }
}

impl RunnerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading runner config from {}", path.display());
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        let config = if has_extension(path, &["json"]) {
            serde_json::from_str(&content)
                .context(format!("Failed to parse JSON from {}", path.display()))?
        } else {
            Self::from_yaml(&content)
                .context(format!("Failed to parse YAML from {}", path.display()))?
        };
        Ok(config)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
            base_urls: self.base_urls.clone(),
        }
    }

    /// Variable catalog backed by this configuration.
    pub fn static_catalog(&self) -> StaticVariableCatalog {
        StaticVariableCatalog {
            config: self.globals.clone(),
            profiles: self.profile_variables.clone(),
            files: self.external_files.clone(),
        }
    }
}

/// Finds and parses case definition files.
#[derive(Debug)]
pub struct CaseLoader {
    pub case_paths: Vec<PathBuf>,
}

impl CaseLoader {
    pub fn new() -> Self {
        Self {
            case_paths: vec![PathBuf::from("tests/cases")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.case_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single case file, JSON or YAML by extension.
    pub fn load_case<P: AsRef<Path>>(&self, path: P) -> Result<CaseDefinition> {
        let path = path.as_ref();
        info!("Loading case from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read case file: {}", path.display()))?;

        let case = if has_extension(path, &["json"]) {
            CaseDefinition::from_json(&content)
                .context(format!("Failed to parse JSON case from {}", path.display()))?
        } else {
            CaseDefinition::from_yaml(&content)
                .context(format!("Failed to parse YAML case from {}", path.display()))?
        };

        debug!("Loaded case {} with {} steps", case.case_id, case.steps.len());
        Ok(case)
    }

    /// Load every case file directly inside `dir`, sorted by file name.
    /// Unparsable files are skipped.
    pub fn load_cases_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<CaseDefinition>> {
        let dir = dir.as_ref();
        info!("Loading cases from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in
            fs::read_dir(dir).context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_case_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut cases = Vec::new();
        for path in paths {
            match self.load_case(&path) {
                Ok(case) => cases.push(case),
                Err(err) => {
                    debug!("Failed to load case from {}: {:#}", path.display(), err);
                }
            }
        }

        info!("Loaded {} cases from {}", cases.len(), dir.display());
        Ok(cases)
    }

    /// Load a file, or every case of a directory.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Vec<CaseDefinition>> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_cases_from_dir(path)
        } else {
            Ok(vec![self.load_case(path)?])
        }
    }

    pub fn load_all_cases(&self) -> Result<Vec<CaseDefinition>> {
        let mut all_cases = Vec::new();
        for path in &self.case_paths {
            if !path.exists() {
                debug!("Skipping missing case path {}", path.display());
                continue;
            }
            match self.load_path(path) {
                Ok(mut cases) => all_cases.append(&mut cases),
                Err(err) => {
                    debug!("Failed to load cases from {}: {:#}", path.display(), err);
                }
            }
        }
        info!("Loaded {} cases in total", all_cases.len());
        Ok(all_cases)
    }
}

impl Default for CaseLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// `.json`, `.yaml` and `.yml` files hold case definitions.
fn is_case_file(path: &Path) -> bool {
    has_extension(path, &["json", "yaml", "yml"])
}
