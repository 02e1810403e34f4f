//! Error types for the LTE harness core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Remote IO error: {0}")]
    RemoteIo(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    #[error("Metric threshold not met: {msg}")]
    MetricThreshold {
        actual: f64,
        expected: f64,
        msg: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Variant name, used when rendering caught-and-logged errors so a test
    /// report can tell an expected explicit failure from an unexpected one.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Config(_) => "Config",
            HarnessError::Launch(_) => "Launch",
            HarnessError::Task(_) => "Task",
            HarnessError::Staging(_) => "Staging",
            HarnessError::RemoteIo(_) => "RemoteIo",
            HarnessError::Process(_) => "Process",
            HarnessError::Parse(_) => "Parse",
            HarnessError::FileNotFound(_) => "FileNotFound",
            HarnessError::PortUnavailable(_) => "PortUnavailable",
            HarnessError::MetricThreshold { .. } => "MetricThreshold",
            HarnessError::Io(_) => "Io",
            HarnessError::Yaml(_) => "Yaml",
            HarnessError::Json(_) => "Json",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
