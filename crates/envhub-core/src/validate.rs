//! Build request validation.
//!
//! Everything here runs before any record is created or any container is
//! started, so a rejected request never leaves side effects behind.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::launcher;
use crate::types::{GitCredentials, ImageMeta};

/// Characters accepted in an environment name.
pub const NAME_PATTERN: &str = r"^[a-z0-9\-_]+$";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(NAME_PATTERN).expect("NAME_PATTERN is a valid regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Repository is empty")]
    EmptyRepository,

    #[error("Memory Limit must be a number")]
    InvalidMemory,

    #[error("CPU Limit must be a number")]
    InvalidCpu,

    #[error("Name is restricted to the following characters: {NAME_PATTERN}")]
    InvalidName,

    /// Delegated builds need a repository provider (`gh`, `gl`, `git`, ...).
    #[error("missing repository provider")]
    MissingProvider,
}

impl ValidationError {
    /// A missing provider is reported as a server-side failure, everything
    /// else is the caller's fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ValidationError::MissingProvider)
    }
}

/// A build request as received, before any checks.
#[derive(Debug, Clone, Default)]
pub struct BuildForm {
    pub repo: String,
    pub git_ref: String,
    pub name: String,
    pub memory: Option<String>,
    pub cpu: Option<String>,
    pub provider: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub credentials: Option<GitCredentials>,
}

/// A build request that passed validation.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub repo: String,
    /// The ref exactly as requested; may be empty.
    pub git_ref: String,
    pub name: Option<String>,
    pub memory_gb: Option<f64>,
    pub cpu_cores: Option<f64>,
    pub provider: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub credentials: Option<GitCredentials>,
    memory_raw: String,
    cpu_raw: String,
}

fn parse_limit(raw: Option<&str>, err: ValidationError) -> Result<Option<f64>, ValidationError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(err),
    }
}

impl BuildForm {
    /// Check the form and turn it into a [`BuildSpec`].
    ///
    /// `require_provider` is set when builds are delegated to an external
    /// build service.
    pub fn validate(self, require_provider: bool) -> Result<BuildSpec, ValidationError> {
        if self.repo.trim().is_empty() {
            return Err(ValidationError::EmptyRepository);
        }
        let memory_gb = parse_limit(self.memory.as_deref(), ValidationError::InvalidMemory)?;
        let cpu_cores = parse_limit(self.cpu.as_deref(), ValidationError::InvalidCpu)?;

        let name = if self.name.is_empty() {
            None
        } else if NAME_RE.is_match(&self.name) {
            Some(self.name)
        } else {
            return Err(ValidationError::InvalidName);
        };

        let provider = self.provider.filter(|p| !p.is_empty());
        if require_provider && provider.is_none() {
            return Err(ValidationError::MissingProvider);
        }

        Ok(BuildSpec {
            repo: self.repo.trim().to_owned(),
            git_ref: self.git_ref,
            name,
            memory_gb,
            cpu_cores,
            provider,
            node_selector: self.node_selector,
            credentials: self.credentials,
            memory_raw: self.memory.unwrap_or_default(),
            cpu_raw: self.cpu.unwrap_or_default(),
        })
    }
}

impl BuildSpec {
    /// The ref handed to the builder: the full requested ref, or `HEAD`.
    pub fn checkout_ref(&self) -> &str {
        launcher::normalize_ref(&self.git_ref)
    }

    /// Name shown to users: the requested name or the slug derived from the repo.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| launcher::derive_name(&self.repo))
    }

    /// Provisional `<name>:<tag>` image name.
    pub fn image_name(&self) -> String {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| launcher::derive_name(&self.repo));
        format!("{}:{}", name, launcher::image_tag(&self.git_ref))
    }

    /// Memory limit in the runtime's suffixed form, `""` when unset.
    pub fn mem_limit(&self) -> String {
        self.memory_gb
            .map(|_| format!("{}G", self.memory_raw.trim()))
            .unwrap_or_default()
    }

    /// CPU limit as a bare number of cores, `""` when unset.
    pub fn cpu_limit(&self) -> String {
        self.cpu_cores
            .map(|_| self.cpu_raw.trim().to_owned())
            .unwrap_or_default()
    }

    /// Metadata snapshot stored with the build record.
    pub fn meta(&self) -> ImageMeta {
        ImageMeta {
            display_name: self.display_name(),
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            cpu_limit: self.cpu_raw.clone(),
            mem_limit: self.memory_raw.clone(),
            node_selector: self.node_selector.clone(),
        }
    }
}
