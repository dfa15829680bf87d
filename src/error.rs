use thiserror::Error;

use crate::adapter::CallError;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Bad or missing rule set, or an unreadable config file. Fatal for
    /// the owning service only.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rule set error ({service}): {message}")]
    RuleSet { service: String, message: String },

    /// An external call that failed after the retry budget was spent (or was
    /// classified as non-retryable).
    #[error("External call {action} failed in step '{step}' after {attempts} attempt(s): {source}")]
    ExternalCall {
        step: String,
        action: String,
        attempts: u32,
        #[source]
        source: CallError,
    },

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Scope resolution error: {0}")]
    ScopeResolution(String),

    #[error("Client error ({account}): {message}")]
    Client { account: String, message: String },

    #[error("Output error: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Failure while resolving a template or evaluating a condition for one
/// inventory item. Downgrades only that item's check to ERROR.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("operator '{op}' expects a list, got {found}")]
    ExpectedList { op: String, found: String },

    #[error("operator '{op}' expects a number, got {found}")]
    ExpectedNumber { op: String, found: String },

    #[error("operator '{op}' requires an expected value")]
    MissingExpected { op: String },
}
