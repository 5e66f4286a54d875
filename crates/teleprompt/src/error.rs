use thiserror::Error;

/// Errors that reach the caller of a compile, mapping or load operation.
///
/// Per-example, per-trace and per-candidate failures never show up here: the
/// optimizers contain them and keep going. What remains is configuration and
/// structure.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Two pipelines (teacher/student, or saved state/target) differ in
    /// predictor count or per-position signature shape.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    #[error("invalid signature `{signature}`: {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("signature `{signature}` has no output field `{field}`")]
    UnknownField { signature: String, field: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported settings format: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type CompileResult<T> = Result<T, CompileError>;
