use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AhciError {
    #[error("HBA reset did not complete")]
    ResetTimeout,
    #[error("port {0} has no device attached")]
    NoDevice(u8),
    #[error("port {0} physical link not established")]
    LinkDown(u8),
    #[error("port {0} command engine did not stop")]
    EngineStuck(u8),
    #[error("port {0} device stayed busy")]
    DeviceBusy(u8),
    #[error("polled command timed out")]
    Timeout,
    #[error("device reported task-file error (status {status:#04x}, error {error:#04x})")]
    TaskFile { status: u8, error: u8 },
    #[error("DMA memory allocation failed")]
    NoMemory,
    #[error("transfer needs more than {0} PRD entries")]
    TooManySegments(usize),
    #[error("channel is not functional")]
    ChannelFailed,
}
