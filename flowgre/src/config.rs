//! Barrage configuration file.
//!
//! `barrage --config` reads a YAML document naming exactly one target:
//!
//! ```yaml
//! targets:
//!   collector:
//!     ip: 127.0.0.1
//!     port: 9995
//!     workers: 4
//!     delay: 100
//! ```
//!
//! The file supersedes every other barrage argument. `src_range` and
//! `dst_range` are optional and fall back to `10.0.0.0/8`.
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use flowgre_payload::{Ipv4Cidr, Schema};
use serde::Deserialize;
use tracing::info;

use crate::{generator::barrage, transport};

/// Range used when a target names none
pub const DEFAULT_RANGE: &str = "10.0.0.0/8";

/// Errors produced while loading a configuration file
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The document has no `targets` section, or it is empty
    #[error("couldn't find a targets section in the given config file")]
    MissingTargets,
    /// More than one target was named
    #[error("found {0} targets in config file, only 1 is allowed")]
    TooManyTargets(usize),
    /// The target address did not resolve
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// A CIDR range failed to parse
    #[error(transparent)]
    Cidr(#[from] flowgre_payload::cidr::Error),
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct File {
    #[serde(default)]
    targets: Option<BTreeMap<String, Target>>,
}

/// One barrage target
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// Collector host or IP
    pub ip: String,
    /// Collector UDP port
    pub port: u16,
    /// Number of virtual exporters
    pub workers: u16,
    /// Milliseconds between data packets per worker
    pub delay: u64,
    /// Source address range
    #[serde(default)]
    pub src_range: Option<Ipv4Cidr>,
    /// Destination address range
    #[serde(default)]
    pub dst_range: Option<Ipv4Cidr>,
}

impl Target {
    /// Build a barrage configuration for this target.
    ///
    /// # Errors
    ///
    /// Fails if the target address does not resolve.
    pub fn barrage(&self, schema: Schema, seed: [u8; 32]) -> Result<barrage::Config, Error> {
        let default_range: Ipv4Cidr = DEFAULT_RANGE.parse()?;
        Ok(barrage::Config {
            seed,
            target: transport::resolve(&self.ip, self.port)?,
            workers: self.workers,
            delay: Duration::from_millis(self.delay),
            schema,
            src_range: self.src_range.unwrap_or(default_range),
            dst_range: self.dst_range.unwrap_or(default_range),
            web: None,
        })
    }
}

/// Parse a configuration document, returning the single target and its
/// name.
///
/// # Errors
///
/// Fails if the YAML is malformed or does not name exactly one target.
pub fn parse(contents: &str) -> Result<(String, Target), Error> {
    let file: File = serde_yaml::from_str(contents)?;
    let targets = file.targets.ok_or(Error::MissingTargets)?;
    if targets.len() > 1 {
        return Err(Error::TooManyTargets(targets.len()));
    }
    targets.into_iter().next().ok_or(Error::MissingTargets)
}

/// Read and parse the configuration file at `path`.
///
/// # Errors
///
/// Fails if the file cannot be read, see also [`parse`].
pub fn load(path: &Path) -> Result<(String, Target), Error> {
    info!("Reading config file {path:?}, ignoring any other given arguments");
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    let (name, target) = parse(&contents)?;
    info!(
        "target: {name} ip: {} port: {} workers: {} delay: {}",
        target.ip, target.port, target.workers, target.delay
    );
    Ok((name, target))
}
