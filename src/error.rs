/// Errors that can occur when talking to the etee dongle.
#[derive(Debug, thiserror::Error)]
pub enum EteeError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dongle not found (VID=239A PID=8029)")]
    DongleNotFound,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Telemetry stream stopped")]
    StreamStopped,
}
