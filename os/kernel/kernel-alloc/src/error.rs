//! Crate-wide error type returned by [`MemoryManager`](crate::manager::MemoryManager).

use crate::frame_alloc::FrameAllocError;
use crate::heap::HeapError;
use crate::vmm::VmmError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("address not mapped")]
    NotMapped,
    #[error("heap corruption detected: {0}")]
    CorruptionDetected(&'static str),
}

impl From<FrameAllocError> for MemoryError {
    fn from(value: FrameAllocError) -> Self {
        match value {
            FrameAllocError::OutOfMemory => Self::OutOfMemory,
            FrameAllocError::InvalidArgument(why) => Self::InvalidArgument(why),
        }
    }
}

impl From<VmmError> for MemoryError {
    fn from(value: VmmError) -> Self {
        match value {
            VmmError::OutOfMemory => Self::OutOfMemory,
            VmmError::InvalidArgument(why) => Self::InvalidArgument(why),
            VmmError::NotMapped => Self::NotMapped,
        }
    }
}

impl From<HeapError> for MemoryError {
    fn from(value: HeapError) -> Self {
        match value {
            HeapError::OutOfMemory => Self::OutOfMemory,
            HeapError::InvalidArgument(why) => Self::InvalidArgument(why),
            HeapError::CorruptionDetected(why) => Self::CorruptionDetected(why),
        }
    }
}
