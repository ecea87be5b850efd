use thiserror::Error;

/// Malformed draw or prediction input. Rejected, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("draw id is empty")]
    EmptyDrawId,

    #[error("model version is empty")]
    EmptyModelVersion,

    #[error("draw belongs to variant '{actual}', expected '{expected}'")]
    VariantMismatch { expected: String, actual: String },

    #[error("expected {expected} main numbers, got {actual}")]
    Arity { expected: u8, actual: usize },

    #[error("main number {number} outside {min}..={max}")]
    MainOutOfRange { number: u8, min: u8, max: u8 },

    #[error("main number {0} appears more than once")]
    DuplicateMain(u8),

    #[error("variant '{0}' has no special number")]
    UnexpectedSpecial(String),

    #[error("variant '{0}' requires a special number")]
    MissingSpecial(String),

    #[error("special number {number} outside {min}..={max}")]
    SpecialOutOfRange { number: u8, min: u8, max: u8 },

    #[error("special number {0} repeats a main number")]
    SpecialOverlapsMain(u8),

    #[error("variant '{variant}' needs a session tag (one of {allowed})")]
    MissingSession { variant: String, allowed: String },

    #[error("session '{session}' is not drawn for variant '{variant}'")]
    UnknownSession { variant: String, session: String },

    #[error("variant '{0}' is drawn once per day and takes no session tag")]
    UnexpectedSession(String),

    #[error("invalid draw date '{0}' (expected YYYY-MM-DD or DD/MM/YYYY)")]
    InvalidDate(String),

    #[error("max_draws must be at least 1")]
    ZeroMaxDraws,
}

/// The window evaluator could not reach a verdict. Callers log it and treat
/// the cycle as a skip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("only {available} completed cycle(s) available, {required} required")]
    InsufficientHistory { available: usize, required: usize },

    #[error("cycle #{0} closed without any scored draw")]
    EmptyCycle(u32),
}

/// The training collaborator refused or could not be reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerDeliveryError {
    #[error("training backend unavailable: {0}")]
    Unavailable(String),

    #[error("training backend rejected the request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("variant '{variant}' already has active cycle #{cycle_number}")]
    Conflict { variant: String, cycle_number: u32 },

    #[error("no active cycle for variant '{variant}'")]
    NoActiveCycle { variant: String },

    #[error("unknown variant '{0}'")]
    UnknownVariant(String),

    #[error("cycle {0} not found")]
    CycleNotFound(i64),

    #[error("cycle {0} has no prediction")]
    MissingPrediction(i64),

    #[error("cycle {0} is no longer accepting draws")]
    CycleClosed(i64),

    #[error("training log entry {0} not found")]
    TrainingLogNotFound(i64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] lecycle_db::rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
