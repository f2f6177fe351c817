//! Byte-level serial transport and the connector used to open it.
//!
//! The engine never touches `serialport` directly: it talks to a boxed
//! [`Transport`] obtained from a [`Connector`], so the whole stack can run
//! against the in-memory [`mock`] device in tests.

use std::io;
use std::sync::{Arc, Mutex};

/// Exclusive handle on an open serial line.
pub trait Transport: Send {
    /// Write the whole buffer to the line. Called on the async runtime, so
    /// implementations must fail within a short driver timeout rather than
    /// block indefinitely.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Return whatever bytes are currently buffered; empty when nothing is.
    /// Must not block beyond the driver's own short read timeout.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Release the device. Further calls may fail.
    fn close(&mut self) {}

    /// Human readable name for logs, e.g. `/dev/ttyUSB0@115200`.
    fn describe(&self) -> String;
}

/// Transport shared between the reader task (reads) and the executor (writes).
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Opens transports and lists candidate devices for probing.
pub trait Connector: Send + Sync {
    /// Devices to try when no port is configured.
    fn candidates(&self) -> Vec<String>;

    fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn Transport>>;
}

#[cfg(feature = "serial")]
pub use self::serial::{SerialConnector, SerialTransport, IO_TIMEOUT};

#[cfg(feature = "serial")]
mod serial {
    use super::{Connector, Transport};
    use log::{debug, trace};
    use serialport::{SerialPort, SerialPortType};
    use std::io::{self, Read, Write};
    use std::time::Duration;

    const READ_CHUNK: usize = 4096;
    /// Driver timeout for reads and writes. Bounds how long `Link::write`
    /// can hold the runtime thread on a stalled line.
    pub const IO_TIMEOUT: Duration = Duration::from_millis(100);

    pub struct SerialTransport {
        name: String,
        baud_rate: u32,
        port: Option<Box<dyn SerialPort>>,
    }

    impl SerialTransport {
        pub fn open(port_name: &str, baud_rate: u32) -> io::Result<Self> {
            debug!("Opening serial port {} at {} baud", port_name, baud_rate);
            let mut builder = serialport::new(port_name, baud_rate).timeout(IO_TIMEOUT);
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let mut port = builder.open().map_err(io::Error::from)?;
            // Many USB modems ignore commands until DTR is asserted
            let _ = port.write_data_terminal_ready(true);
            let _ = port.write_request_to_send(true);
            // Drop boot banners or stale output from a previous session
            let _ = port.clear(serialport::ClearBuffer::Input);
            Ok(Self {
                name: port_name.to_string(),
                baud_rate,
                port: Some(port),
            })
        }

        fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
            self.port
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
        }
    }

    impl Transport for SerialTransport {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let port = self.port()?;
            port.write_all(data)?;
            port.flush()
        }

        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            let port = self.port()?;
            let waiting = port.bytes_to_read().map_err(io::Error::from)? as usize;
            if waiting == 0 {
                return Ok(Vec::new());
            }
            let mut buf = vec![0u8; waiting.min(READ_CHUNK)];
            match port.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    trace!("serial rx {} bytes", n);
                    Ok(buf)
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        }

        fn close(&mut self) {
            if self.port.take().is_some() {
                debug!("Closed serial port {}", self.name);
            }
        }

        fn describe(&self) -> String {
            format!("{}@{}", self.name, self.baud_rate)
        }
    }

    /// Opens real serial devices; candidates are USB serial adapters.
    #[derive(Debug, Default, Clone)]
    pub struct SerialConnector;

    impl Connector for SerialConnector {
        fn candidates(&self) -> Vec<String> {
            let ports = match serialport::available_ports() {
                Ok(p) => p,
                Err(e) => {
                    debug!("Serial port enumeration failed: {}", e);
                    return Vec::new();
                }
            };
            let mut names: Vec<String> = ports
                .into_iter()
                .filter(|p| {
                    matches!(p.port_type, SerialPortType::UsbPort(_))
                        || p.port_name.contains("ttyUSB")
                        || p.port_name.contains("ttyACM")
                })
                .map(|p| p.port_name)
                .collect();
            names.sort();
            names.dedup();
            names
        }

        fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(SerialTransport::open(port, baud_rate)?))
        }
    }
}

/// In-memory modem double: a scripted duplex byte channel.
///
/// Writes are recorded and optionally answered by a responder closure; the
/// answer bytes become readable on the next poll. Bytes can also be injected
/// at any time to simulate unsolicited notifications.
pub mod mock {
    use super::{Connector, Transport};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex, MutexGuard};

    type Responder = Box<dyn FnMut(&str) -> String + Send>;

    #[derive(Default)]
    struct MockState {
        inbound: VecDeque<u8>,
        written: Vec<String>,
        responder: Option<Responder>,
        broken: bool,
        opens: Vec<(String, u32)>,
    }

    /// Format lines the way a modem emits them (`\r\n<line>\r\n`).
    pub fn reply(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("\r\n{}\r\n", l)).collect()
    }

    /// Shared handle on the simulated device.
    #[derive(Clone, Default)]
    pub struct MockModem {
        state: Arc<Mutex<MockState>>,
    }

    impl MockModem {
        pub fn new() -> Self {
            Self::default()
        }

        /// A device that answers every command with `OK`.
        pub fn always_ok() -> Self {
            let m = Self::new();
            m.set_responder(|_| reply(&["OK"]));
            m
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Install the closure answering each write (terminator stripped).
        /// The returned text is queued verbatim for the reader.
        pub fn set_responder<F>(&self, f: F)
        where
            F: FnMut(&str) -> String + Send + 'static,
        {
            self.lock().responder = Some(Box::new(f));
        }

        /// Stop answering writes.
        pub fn silence(&self) {
            self.lock().responder = None;
        }

        /// Queue raw bytes as if the modem had sent them.
        pub fn inject(&self, text: &str) {
            self.lock().inbound.extend(text.as_bytes());
        }

        /// Queue one complete line.
        pub fn inject_line(&self, line: &str) {
            self.inject(&format!("\r\n{}\r\n", line));
        }

        /// Every write so far, terminators stripped.
        pub fn written(&self) -> Vec<String> {
            self.lock().written.clone()
        }

        /// Number of writes equal to `command`.
        pub fn count_writes(&self, command: &str) -> usize {
            self.lock().written.iter().filter(|w| *w == command).count()
        }

        /// Make the next read fail, as an unplugged adapter would.
        pub fn break_link(&self) {
            self.lock().broken = true;
        }

        /// Port/baud pairs opened through a [`MockConnector`].
        pub fn opens(&self) -> Vec<(String, u32)> {
            self.lock().opens.clone()
        }

        pub fn transport(&self, name: &str) -> MockTransport {
            MockTransport {
                modem: self.clone(),
                name: name.to_string(),
            }
        }
    }

    pub struct MockTransport {
        modem: MockModem,
        name: String,
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let mut st = self.modem.lock();
            if st.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link broken"));
            }
            let text = String::from_utf8_lossy(data);
            let text = text.trim_end_matches(['\r', '\n']).to_string();
            st.written.push(text.clone());
            if let Some(responder) = st.responder.as_mut() {
                let answer = responder(&text);
                st.inbound.extend(answer.as_bytes());
            }
            Ok(())
        }

        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            let mut st = self.modem.lock();
            if st.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link broken"));
            }
            Ok(st.inbound.drain(..).collect())
        }

        fn describe(&self) -> String {
            format!("mock:{}", self.name)
        }
    }

    /// Connector handing out transports onto one [`MockModem`].
    ///
    /// `accept` restricts which port/baud pairs open successfully; an empty
    /// list accepts everything.
    pub struct MockConnector {
        modem: MockModem,
        ports: Vec<String>,
        accept: Vec<(String, u32)>,
    }

    impl MockConnector {
        pub fn new(modem: MockModem) -> Self {
            Self {
                modem,
                ports: vec!["/dev/mock0".to_string()],
                accept: Vec::new(),
            }
        }

        pub fn with_ports(mut self, ports: &[&str]) -> Self {
            self.ports = ports.iter().map(|p| p.to_string()).collect();
            self
        }

        pub fn accept_only(mut self, port: &str, baud_rate: u32) -> Self {
            self.accept.push((port.to_string(), baud_rate));
            self
        }
    }

    impl Connector for MockConnector {
        fn candidates(&self) -> Vec<String> {
            self.ports.clone()
        }

        fn open(&self, port: &str, baud_rate: u32) -> io::Result<Box<dyn Transport>> {
            let allowed = self.accept.is_empty()
                || self
                    .accept
                    .iter()
                    .any(|(p, b)| p == port && *b == baud_rate);
            let mut st = self.modem.lock();
            st.opens.push((port.to_string(), baud_rate));
            if !allowed {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("mock refuses {}@{}", port, baud_rate),
                ));
            }
            st.broken = false;
            drop(st);
            Ok(Box::new(self.modem.transport(port)))
        }
    }
}

#[cfg(all(test, feature = "serial"))]
mod tests {
    use super::IO_TIMEOUT;
    use std::time::Duration;

    #[test]
    fn serial_writes_are_bounded_by_a_short_driver_timeout() {
        // Link::write runs on the runtime thread
        assert!(IO_TIMEOUT > Duration::ZERO);
        assert!(IO_TIMEOUT <= Duration::from_millis(250));
    }
}
