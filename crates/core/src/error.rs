//! Error types for the Eidolon discovery platform

use std::time::Duration;

use thiserror::Error;

use crate::event::Stage;

/// Result type alias for Eidolon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Eidolon operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or target validation errors
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Scan execution errors
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// Graph store errors
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Validation errors for scan configurations and targets.
///
/// All of these are reported synchronously, before any scanner process is
/// spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("target {target} overlaps {other}")]
    OverlappingTargets { target: String, other: String },

    #[error("at least one target is required")]
    EmptyTargets,

    #[error("maximum of {max} targets allowed, got {count}")]
    TooManyTargets { count: usize, max: usize },

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("duplicate port: {0}")]
    DuplicatePort(u16),

    #[error("maximum of {max} ports allowed, got {count}")]
    TooManyPorts { count: usize, max: usize },

    #[error("custom port preset requires a non-empty port list")]
    EmptyPorts,

    #[error("invalid port preset: {0}")]
    InvalidPreset(String),

    #[error("{option} must be between {min} and {max}")]
    OptionOutOfRange {
        option: &'static str,
        min: u32,
        max: u32,
    },
}

impl ValidationError {
    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::InvalidTarget(_) => "InvalidTarget",
            ValidationError::OverlappingTargets { .. } => "OverlappingTargets",
            ValidationError::EmptyTargets => "EmptyTargets",
            ValidationError::TooManyTargets { .. } => "TooManyTargets",
            ValidationError::InvalidPort(_) => "InvalidPort",
            ValidationError::DuplicatePort(_) => "DuplicatePort",
            ValidationError::TooManyPorts { .. } => "TooManyPorts",
            ValidationError::EmptyPorts => "EmptyPorts",
            ValidationError::InvalidPreset(_) => "InvalidPreset",
            ValidationError::OptionOutOfRange { .. } => "OptionOutOfRange",
        }
    }
}

/// Scan execution errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// The external scanner binary could not be started
    #[error("failed to spawn scanner {bin}: {source}")]
    SpawnFailure {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    /// The scanner exited with a non-zero status
    #[error("scanner exited with status {code:?}: {stderr}")]
    ScannerExit { code: Option<i32>, stderr: String },

    /// The scan was cancelled by the user
    #[error("scan cancelled")]
    Cancelled,

    /// A stage exceeded its wall-clock budget
    #[error("{stage} stage timed out after {seconds}s")]
    StageTimeout { stage: Stage, seconds: u64 },

    /// A report fragment could not be parsed
    #[error("report parse error: {0}")]
    Parse(String),

    /// Another scan is already running for this user
    #[error("a scan is already running for user {user_id}")]
    AlreadyRunning { user_id: String },

    /// The referenced task does not exist
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },
}

/// Graph store errors
#[derive(Error, Debug)]
pub enum GraphError {
    /// The store could not be reached
    #[error("graph transport error: {0}")]
    Transport(String),

    /// The store rejected the transaction
    #[error("graph store rejected transaction: {0}")]
    Rejected(String),

    /// A single store call exceeded its deadline
    #[error("graph call exceeded {0:?} deadline")]
    Deadline(Duration),

    /// All write attempts for a host were exhausted
    #[error("write for host {host} abandoned after {attempts} attempts: {last}")]
    RetriesExhausted {
        host: String,
        attempts: u32,
        last: String,
    },
}
