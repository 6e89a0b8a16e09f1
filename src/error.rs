use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmaError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No free range of {size} bytes at alignment {alignment} in block")]
    OutOfBlockSpace { size: u64, alignment: u64 },

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("No memory type satisfies the request (type bits 0x{0:x})")]
    NoSuitableMemoryType(u32),

    #[error("Failed to map device memory")]
    MemoryMapFailed,

    #[error("Invalid or already freed allocation")]
    InvalidAllocation,

    #[error("Invalid pool")]
    InvalidPool,

    #[error("Pool still owns live allocations")]
    PoolInUse,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Defragmentation move failed: {0}")]
    MoveExecutionFailed(String),

    #[error("Wait failed: {0}")]
    WaitFailed(String),

    #[error("Device lost")]
    DeviceLost,

    #[error("Wait scheduler has shut down")]
    SchedulerClosed,
}

impl VmaError {
    /// Whether the error leaves the device unusable, so every unfinished
    /// defragmentation move must be rolled back.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

// A convenient alias
pub type VmaResult<T> = Result<T, VmaError>;
