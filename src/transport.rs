use crate::protocol::{PID, VID};
use crate::{EteeError, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Byte-duplex stream to the dongle.
///
/// The core only needs this small surface; port selection and the OS-level
/// details live behind it. Exactly one thread owns a transport at a time.
pub trait Transport: Send {
    /// Read available bytes; returns 0 on timeout rather than an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write one ASCII command line, newline-terminated.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Read one text line, or `None` if the deadline passes first. Used
    /// during calibration bring-up, where the stream is line-oriented; this
    /// mode and binary framing are mutually exclusive on the stream.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    fn flush(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Try to re-establish a dropped connection.
    fn reopen(&mut self) -> Result<()> {
        Err(EteeError::TransportClosed)
    }
}

/// Find the dongle's serial port by USB VID/PID.
///
/// Absence is a persistent "not connected" state for callers that retry,
/// not a fatal condition.
pub fn discover() -> Result<String> {
    for port in serialport::available_ports()? {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            if usb.vid == VID && usb.pid == PID {
                log::debug!("dongle found at {}", port.port_name);
                return Ok(port.port_name);
            }
        }
    }
    Err(EteeError::DongleNotFound)
}

/// Serial transport over the dongle's virtual COM port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
    baud_rate: u32,
    open: bool,
}

impl SerialTransport {
    /// Open the port at 8N1, no flow control, with a short read timeout so
    /// the reader loop can poll its stop flag.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = Self::open_port(path, baud_rate)?;
        log::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(SerialTransport {
            port,
            path: path.to_string(),
            baud_rate,
            open: true,
        })
    }

    fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
        let mut port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()?;
        // The dongle only transmits once DTR is asserted.
        port.write_data_terminal_ready(true)?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => {
                self.open = false;
                Err(e.into())
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => match byte[0] {
                    b'\n' => return Ok(Some(String::from_utf8_lossy(&line).into_owned())),
                    b'\r' => {}
                    b => line.push(b),
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    self.open = false;
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn reopen(&mut self) -> Result<()> {
        self.port = Self::open_port(&self.path, self.baud_rate)?;
        self.open = true;
        log::info!("Re-opened serial port {}", self.path);
        Ok(())
    }
}

/// Scripted transport for tests and offline development.
///
/// Clones share the same buffers, so a test can hold one handle while the
/// reader thread owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    read_bytes: VecDeque<u8>,
    read_lines: VecDeque<String>,
    written_lines: Vec<String>,
    open: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        let t = MockTransport::default();
        t.inner.lock().unwrap().open = true;
        t
    }

    /// Queue raw bytes for `read`.
    pub fn inject_bytes(&self, data: &[u8]) {
        self.inner.lock().unwrap().read_bytes.extend(data);
    }

    /// Queue one response line for `read_line`.
    pub fn inject_line(&self, line: &str) {
        self.inner.lock().unwrap().read_lines.push_back(line.to_string());
    }

    /// Everything written so far, one entry per line.
    pub fn written_lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().written_lines.clone()
    }

    pub fn set_open(&self, open: bool) {
        self.inner.lock().unwrap().open = open;
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(EteeError::TransportClosed);
        }
        let mut n = 0;
        while n < buf.len() {
            match inner.read_bytes.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.lock().unwrap().written_lines.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().read_lines.pop_front())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn reopen(&mut self) -> Result<()> {
        self.inner.lock().unwrap().open = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_byte_roundtrip() {
        let mock = MockTransport::new();
        mock.inject_bytes(&[1, 2, 3, 4, 5]);

        let mut handle: Box<dyn Transport> = Box::new(mock.clone());
        let mut buf = [0u8; 3];
        assert_eq!(handle.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(handle.read(&mut buf).unwrap(), 2);
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mock_lines_and_writes() {
        let mock = MockTransport::new();
        mock.inject_line("R:gf=1 2 3");

        let mut handle: Box<dyn Transport> = Box::new(mock.clone());
        handle.write_line("BP+gf").unwrap();
        assert_eq!(
            handle.read_line(Duration::from_millis(1)).unwrap().as_deref(),
            Some("R:gf=1 2 3")
        );
        assert!(handle.read_line(Duration::from_millis(1)).unwrap().is_none());
        assert_eq!(mock.written_lines(), vec!["BP+gf"]);
    }

    #[test]
    fn test_mock_closed_then_reopened() {
        let mock = MockTransport::new();
        mock.set_open(false);

        let mut handle: Box<dyn Transport> = Box::new(mock.clone());
        assert!(!handle.is_open());
        assert!(handle.read(&mut [0u8; 4]).is_err());
        handle.reopen().unwrap();
        assert!(handle.is_open());
    }
}
