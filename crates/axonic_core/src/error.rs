use crate::device::Device;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    // refcount protocol
    UseAfterFree {
        resource: &'static str,
        id: u64,
    },
    DoubleFree {
        resource: &'static str,
        id: u64,
    },
    // device memory
    AllocationTooLarge {
        device: Device,
        requested: usize,
        ceiling: usize,
    },
    OutOfMemory {
        device: Device,
        requested: usize,
    },
    // values
    CorruptValue {
        op: &'static str,
        index: usize,
        value: f64,
    },
    ComputationError {
        op: String,
        shapes: Vec<Vec<usize>>,
        message: String,
    },
    DimensionMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    IndexOutOfBounds {
        index: usize,
        size: usize,
    },
    InvalidArgument(String),
    InvalidDevice(String),
    // scheduling
    Timeout {
        processed: usize,
        total: usize,
    },
    DeviceTask {
        device: Device,
        source: Box<Error>,
    },
    //
    Lock,
    #[cfg(feature = "serde")]
    DeserializationError(String),
    Internal {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UseAfterFree { resource, id } => write!(f, "Use after free: {} #{} is already finalized", resource, id),
            Self::DoubleFree { resource, id } => write!(f, "Double free: {} #{} was released after finalization", resource, id),
            Self::AllocationTooLarge {
                device,
                requested,
                ceiling,
            } => write!(
                f,
                "Allocation too large on {}: requested {} bytes, ceiling is {} bytes",
                device.name(),
                requested,
                ceiling
            ),
            Self::OutOfMemory { device, requested } => {
                write!(f, "Out of memory on {}: failed to allocate {} bytes", device.name(), requested)
            }
            Self::CorruptValue { op, index, value } => {
                write!(f, "Corrupt value in {}: element {} is {}", op, index, value)
            }
            Self::ComputationError { op, shapes, message } => {
                write!(f, "Computation error in {} (operand shapes {:?}): {}", op, shapes, message)
            }
            Self::DimensionMismatch { expected, got } => {
                write!(f, "Dimension mismatch: expected {:?}, got {:?}", expected, got)
            }
            Self::IndexOutOfBounds { index, size } => {
                write!(f, "Index out of bounds: index {} is out of bounds for size {}", index, size)
            }
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::InvalidDevice(msg) => write!(f, "Invalid device: {}", msg),
            Self::Timeout { processed, total } => {
                write!(f, "Timed out after processing {} of {} items", processed, total)
            }
            Self::DeviceTask { device, source } => write!(f, "Task on {} failed: {}", device.name(), source),
            Self::Lock => write!(f, "Lock poisoned"),
            #[cfg(feature = "serde")]
            Self::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DeviceTask { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl Error {
    /// True for the retryable allocation failure, looking through task wrappers.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::OutOfMemory { .. } => true,
            Self::DeviceTask { source, .. } => source.is_out_of_memory(),
            _ => false,
        }
    }

    /// Protocol violations and corrupt values abort a run no matter the policy.
    pub fn is_fatal(&self) -> bool {
        !self.is_out_of_memory() && !matches!(self, Self::Timeout { .. })
    }

    pub fn computation(op: impl Into<String>, shapes: Vec<Vec<usize>>, message: impl Into<String>) -> Self {
        Self::ComputationError {
            op: op.into(),
            shapes,
            message: message.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Lock
    }
}

/// Rejects the first non-finite element of `data`.
pub fn check_finite(op: &'static str, data: &[f64]) -> Result<()> {
    match data.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(Error::CorruptValue {
            op,
            index,
            value: data[index],
        }),
        None => Ok(()),
    }
}
