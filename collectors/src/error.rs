pub type Result<T> = std::result::Result<T, CollectorError>;

/// Struct to represent script loading/execution errors.
#[derive(Debug)]
pub struct ScriptErrorStruct {
    /// The script the error came from.
    script: String,

    /// The error message.
    msg: String,
}

/// Struct to represent HTTP transport errors.
#[derive(Debug)]
pub struct RequestErrorStruct {
    /// The error message.
    msg: String,
}

/// Struct to represent IO errors.
#[derive(Debug)]
pub struct IoErrorStruct {
    /// The type of IO error.
    error_type: String,

    /// The error message.
    msg: String,
}

/// Enum to represent the error classes of the collector runtime.
#[derive(Debug)]
pub enum CollectorError {
    ScriptError(ScriptErrorStruct),
    RequestError(RequestErrorStruct),
    IoError(IoErrorStruct),
}

impl CollectorError {
    /// Create a new script error tied to the named script.
    pub fn script_error(script: &str, msg: String) -> Self {
        CollectorError::ScriptError(ScriptErrorStruct {
            script: script.to_string(),
            msg,
        })
    }
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::ScriptError(script_err) => {
                write!(f, "Script Error in {}: {}", script_err.script, script_err.msg)
            }
            CollectorError::RequestError(request_err) => {
                write!(f, "Request Error: {}", request_err.msg)
            }
            CollectorError::IoError(io_err) => {
                write!(f, "IO {} Error: {}", io_err.error_type, io_err.msg)
            }
        }
    }
}

impl std::error::Error for CollectorError {}

impl From<mlua::Error> for CollectorError {
    fn from(error: mlua::Error) -> Self {
        CollectorError::ScriptError(ScriptErrorStruct {
            script: String::new(),
            msg: error.to_string(),
        })
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(error: reqwest::Error) -> Self {
        CollectorError::RequestError(RequestErrorStruct {
            msg: error.to_string(),
        })
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(error: std::io::Error) -> Self {
        CollectorError::IoError(IoErrorStruct {
            error_type: error.kind().to_string(),
            msg: error.to_string(),
        })
    }
}
