use thiserror::Error;

use crate::domain::types::{AlgoId, OrderId};

/// Errors raised while validating algo parameters against their schema
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("Missing required parameter: {name}")]
    MissingRequired { name: String },

    #[error("Parameter {name} has wrong type: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Parameter {name} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Parameter {name} is defined more than once")]
    DuplicateDefinition { name: String },

    #[error("Unknown parameter: {name}")]
    UnknownParam { name: String },

    #[error("Invalid security tuple for {name}: {reason}")]
    InvalidSecurityTuple { name: String, reason: String },

    #[error("Malformed parameter payload: {reason}")]
    Malformed { reason: String },
}

/// Errors returned synchronously by `AlgoManager::spawn`
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Unknown algo: {name}")]
    UnknownAlgo { name: String },

    #[error("Algo token must not be empty")]
    EmptyToken,

    #[error("Duplicate algo token: {token}")]
    DuplicateToken { token: String },

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] ParamError),

    #[error("Algo rejected start: {0}")]
    StartRejected(String),

    #[error("Algo manager is not running")]
    NotRunning,

    #[error("Cannot spawn onto strand {strand} from its own worker thread")]
    Reentrant { strand: usize },

    #[error("Worker for strand {strand} is gone")]
    WorkerGone { strand: usize },
}

/// Errors related to the append-only algo journal
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt journal record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Errors surfaced by execution adapters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Order rejected by adapter: {reason}")]
    Rejected { reason: String },

    #[error("Unknown order: {order_id}")]
    UnknownOrder { order_id: OrderId },

    #[error("Algo {algo_id} is not active")]
    Inactive { algo_id: AlgoId },

    #[error("Instrument {instrument_id} does not belong to this algo")]
    ForeignInstrument { instrument_id: usize },
}

/// Errors related to the scheduler itself
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Algo manager already running")]
    AlreadyRunning,

    #[error("Worker thread count must be at least 1")]
    NoThreads,

    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Failed to build timer runtime: {0}")]
    TimerRuntime(#[source] std::io::Error),

    #[error("Unknown algo: {0}")]
    UnknownAlgo(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] ParamError),
}
