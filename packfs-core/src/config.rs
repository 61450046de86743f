//! Pack configuration decoding.
//!
//! The configuration is a TOML document whose top level maps pack names to
//! pack tables. Inside a pack table, `parserV1` selects the renderer's legacy
//! parser and every sub-table is a job whose entries are template variables:
//!
//! ```toml
//! [hello]
//! parserV1 = false
//!
//! [hello.job1]
//! x = "1"
//! ```
//!
//! Entries are classified once, here, so nothing downstream has to inspect
//! value types.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PackFsError, PackFsResult};

/// Key selecting the legacy parser inside a pack table.
pub const PARSER_V1_KEY: &str = "parserV1";

/// Variables for one job, name to value.
pub type JobVars = BTreeMap<String, String>;

/// Settings for a single pack.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "toml::Table")]
pub struct PackSettings {
    /// Pass `--parser-v1` to the renderer.
    pub parser_v1: bool,
    /// Jobs keyed by job name.
    pub jobs: BTreeMap<String, JobVars>,
}

impl TryFrom<toml::Table> for PackSettings {
    type Error = String;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        let mut settings = PackSettings::default();

        for (key, value) in table {
            match value {
                toml::Value::Table(vars) => {
                    let vars = decode_job_vars(&key, vars)?;
                    settings.jobs.insert(key, vars);
                }
                toml::Value::Boolean(flag) if key == PARSER_V1_KEY => {
                    settings.parser_v1 = flag;
                }
                other if key == PARSER_V1_KEY => {
                    return Err(format!(
                        "{} must be a boolean, found {}",
                        PARSER_V1_KEY,
                        other.type_str()
                    ));
                }
                other => {
                    warn!(key = %key, kind = other.type_str(), "ignoring unknown pack setting");
                }
            }
        }

        Ok(settings)
    }
}

/// Stringify the scalar values of a job table.
fn decode_job_vars(job: &str, vars: toml::Table) -> Result<JobVars, String> {
    vars.into_iter()
        .map(|(name, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => format!("{:?}", f),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(format!(
                        "variable {} in job {} must be a scalar, found {}",
                        name,
                        job,
                        other.type_str()
                    ))
                }
            };
            Ok((name, value))
        })
        .collect()
}

/// Decoded pack configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct PackConfig {
    pub packs: BTreeMap<String, PackSettings>,
}

impl PackConfig {
    /// Decode a configuration document.
    pub fn from_toml_str(text: &str) -> PackFsResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and decode a configuration file.
    pub fn load(path: &Path) -> PackFsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PackFsError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Total number of jobs across all packs.
    pub fn job_count(&self) -> usize {
        self.packs.values().map(|p| p.jobs.len()).sum()
    }
}
