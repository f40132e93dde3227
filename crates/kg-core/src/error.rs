use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("cannot infer the output spec of {op}: {reason}")]
    ShapeOrDtypeUnresolved { op: String, reason: String },
    #[error("aliasing violation in {op}: {reason}")]
    AliasingViolation { op: String, reason: String },
    #[error("gradient of {op} returned {got} values for {expected} inputs")]
    GradientArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },
    #[error("the gradient through {op} is undefined")]
    UndefinedGradient { op: String },
    #[error("failed to compile the kernel of {op} (unit {hash}):\n{stderr}")]
    CompilationFailure {
        op: String,
        hash: String,
        stderr: String,
    },
    #[error("operator family '{family}' is misconfigured: {reason}")]
    DispatchConfiguration { family: String, reason: String },
    #[error("the value is already a graph result")]
    AlreadyAResult,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("the kernel of {op} failed with status {status}")]
    KernelRuntime { op: String, status: i32 },
    #[error("unknown result id {0}")]
    UnknownResult(usize),
    #[error("unknown operator id {0}")]
    UnknownOp(usize),
    #[error("result {0} has no value")]
    MissingValue(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("library error: {0}")]
    Library(#[from] libloading::Error),
    #[error("tensor error: {0}")]
    Tensor(#[from] kg_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, KernelError>;
