pub type Result<T> = std::result::Result<T, EngineError>;

/// Struct to represent IO errors.
#[derive(Debug)]
pub struct IoErrorStruct {
    /// The type of IO error.
    error_type: String,

    /// The error message.
    msg: String,
}

/// Struct to represent request-validation errors.
#[derive(Debug)]
pub struct ValidationErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent HTTP transport errors.
#[derive(Debug)]
pub struct RequestErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent graph-port errors.
#[derive(Debug)]
pub struct GraphErrorStruct {
    /// The operation that failed.
    op: String,

    /// The error message.
    msg: String,
}

/// Struct to represent errors raised while assembling the pipeline.
#[derive(Debug)]
pub struct PipelineErrorStruct {
    /// The stage being assembled.
    stage: String,

    /// The error message.
    msg: String,
}

/// Enum to represent the different error classes of the engine.
#[derive(Debug)]
pub enum EngineError {
    IoError(IoErrorStruct),
    ValidationError(ValidationErrorStruct),
    RequestError(RequestErrorStruct),
    GraphError(GraphErrorStruct),
    PipelineError(PipelineErrorStruct),
    /// The enumeration context was cancelled before the operation finished.
    ContextExpired,
}

impl EngineError {
    /// Create a new validation error.
    ///
    /// # Arguments
    /// * `msg` - The error message.
    ///
    /// # Returns
    /// An `EngineError` instance representing a validation error.
    pub fn validation_error(msg: &str) -> Self {
        EngineError::ValidationError(ValidationErrorStruct {
            msg: msg.to_string(),
        })
    }

    /// Create a new graph-port error carrying the failed operation name.
    pub fn graph_error(op: &str, msg: String) -> Self {
        EngineError::GraphError(GraphErrorStruct {
            op: op.to_string(),
            msg,
        })
    }

    /// Create a new pipeline-assembly error carrying the stage name.
    pub fn pipeline_error(stage: &str, msg: String) -> Self {
        EngineError::PipelineError(PipelineErrorStruct {
            stage: stage.to_string(),
            msg,
        })
    }

    /// True when the error is the cancellation sentinel.
    pub fn is_context_expired(&self) -> bool {
        matches!(self, EngineError::ContextExpired)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::IoError(io_err) => {
                write!(f, "IO {} Error: {}", io_err.error_type, io_err.msg)
            }
            EngineError::ValidationError(validation_err) => {
                write!(f, "Validation Error: {}", validation_err.msg)
            }
            EngineError::RequestError(request_err) => {
                write!(f, "Request Error: {}", request_err.msg)
            }
            EngineError::GraphError(graph_err) => {
                write!(f, "Graph Error during {}: {}", graph_err.op, graph_err.msg)
            }
            EngineError::PipelineError(pipeline_err) => {
                write!(
                    f,
                    "Pipeline Error in stage {}: {}",
                    pipeline_err.stage, pipeline_err.msg
                )
            }
            EngineError::ContextExpired => write!(f, "context expired"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::IoError(IoErrorStruct {
            error_type: error.kind().to_string(),
            msg: error.to_string(),
        })
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        EngineError::RequestError(RequestErrorStruct {
            msg: error.to_string(),
        })
    }
}
