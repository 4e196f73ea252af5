//! Command transports for the motion controller and the field probe.
//!
//! - [`CommandTransport`]: line-oriented command/echo/answer exchange used by
//!   the McLennan controllers. One port is usually shared by several axes on a
//!   daisy chain, hence [`SharedTransport`].
//! - [`ScpiTransport`]: write/query pair used by the Metrolab probe.
//!
//! Hardware implementations wrap blocking libraries (`serialport`, `visa-rs`)
//! and are compiled only with their feature; without it `open` fails with a
//! configuration error so callers need no `cfg` of their own.

use crate::config::ControllerSettings;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Line terminator for controller commands.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Sends one command line and collects the reply lines.
#[async_trait]
pub trait CommandTransport: Send {
    /// Write `command` followed by CR LF, wait `reply_wait` and keep reading
    /// until at least two complete lines (echo and answer) have arrived.
    async fn exchange(&mut self, command: &str, reply_wait: Duration) -> AppResult<Vec<String>>;
}

/// A transport shared between every axis on the same port.
pub type SharedTransport = Arc<Mutex<dyn CommandTransport>>;

/// Wrap a transport for sharing.
pub fn shared<T: CommandTransport + 'static>(transport: T) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// SCPI write/query channel.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command that produces no answer.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a query and return the answer without its terminator.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}

/// Count complete CR LF terminated lines in a partial reply.
pub(crate) fn complete_lines(reply: &str) -> usize {
    reply.matches(LINE_TERMINATOR).count()
}

/// Split a reply buffer into lines without terminators.
pub(crate) fn split_reply(reply: &str) -> Vec<String> {
    reply.lines().map(|line| line.to_string()).collect()
}

fn transport_error(err: anyhow::Error) -> DaqError {
    DaqError::Io(std::io::Error::other(format!("{:#}", err)))
}

// =============================================================================
// Serial
// =============================================================================

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// RS-232 link to a chain of McLennan controllers.
///
/// Serial I/O runs on the blocking pool; the port itself sits behind a mutex so
/// the blocking task can take it.
pub struct SerialTransport {
    port_name: String,
    #[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open the port described by the controller settings.
    #[cfg(feature = "instrument_serial")]
    pub fn open(settings: &ControllerSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let data_bits = match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => anyhow::bail!("unsupported data bits: {}", other),
        };
        let parity = match settings.parity.to_lowercase().as_str() {
            "none" => serialport::Parity::None,
            "even" => serialport::Parity::Even,
            "odd" => serialport::Parity::Odd,
            other => anyhow::bail!("unsupported parity: {}", other),
        };

        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .timeout(Duration::from_millis(50))
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    settings.port, settings.baud_rate
                )
            })?;

        tracing::debug!(
            "Serial port '{}' opened at {} baud",
            settings.port,
            settings.baud_rate
        );

        Ok(Self {
            port_name: settings.port.clone(),
            timeout: Duration::from_millis(settings.read_timeout_ms),
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Serial support is compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(settings: &ControllerSettings) -> anyhow::Result<Self> {
        anyhow::bail!(
            "cannot open '{}': built without the instrument_serial feature",
            settings.port
        )
    }

    /// Port this transport talks on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(feature = "instrument_serial")]
enum SerialReply {
    Complete(String),
    Partial(String),
}

#[cfg(feature = "instrument_serial")]
fn exchange_blocking(
    port: &mut dyn SerialPort,
    line: &str,
    reply_wait: Duration,
    timeout: Duration,
) -> anyhow::Result<SerialReply> {
    use anyhow::Context;
    use std::io::{Read, Write};

    port.clear(serialport::ClearBuffer::Input)
        .context("Failed to clear serial input buffer")?;
    port.write_all(line.as_bytes())
        .context("Failed to write to serial port")?;
    port.flush().context("Failed to flush serial port")?;

    let start = std::time::Instant::now();
    let mut reply = String::new();
    while complete_lines(&reply) < 2 {
        if start.elapsed() > timeout {
            return Ok(SerialReply::Partial(reply));
        }
        std::thread::sleep(reply_wait);
        let available = port
            .bytes_to_read()
            .context("Failed to query serial input buffer")? as usize;
        if available == 0 {
            continue;
        }
        let mut buffer = vec![0u8; available];
        let n = port
            .read(&mut buffer)
            .context("Failed to read from serial port")?;
        reply.push_str(&String::from_utf8_lossy(&buffer[..n]));
    }
    Ok(SerialReply::Complete(reply))
}

#[async_trait]
impl CommandTransport for SerialTransport {
    #[cfg(feature = "instrument_serial")]
    async fn exchange(&mut self, command: &str, reply_wait: Duration) -> AppResult<Vec<String>> {
        use anyhow::Context;

        let port = self.port.clone();
        let line = format!("{}{}", command, LINE_TERMINATOR);
        let timeout = self.timeout;

        let reply = tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            exchange_blocking(guard.as_mut(), &line, reply_wait, timeout)
        })
        .await
        .context("Serial I/O task panicked")
        .and_then(|inner| inner)
        .map_err(transport_error)?;

        match reply {
            SerialReply::Complete(text) => {
                tracing::trace!(command, reply = %text.trim_end(), "serial exchange");
                Ok(split_reply(&text))
            }
            SerialReply::Partial(text) => Err(DaqError::timeout(
                self.port_name.clone(),
                format!("reply to '{}' (got {:?})", command, text),
                self.timeout.as_millis() as u64,
            )),
        }
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn exchange(&mut self, command: &str, _reply_wait: Duration) -> AppResult<Vec<String>> {
        Err(transport_error(anyhow::anyhow!(
            "cannot send '{}': built without the instrument_serial feature",
            command
        )))
    }
}

// =============================================================================
// VISA
// =============================================================================

/// USB-TMC/VISA link to an SCPI instrument.
pub struct VisaTransport {
    resource: String,
    #[cfg(feature = "instrument_visa")]
    instrument: visa_rs::Instrument,
}

impl VisaTransport {
    /// Open a VISA resource such as `USB0::0x1BFA::0x0498::0000155::INSTR`,
    /// waiting at most `timeout` for it to become available.
    #[cfg(feature = "instrument_visa")]
    pub fn open(resource: &str, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let rm = DefaultRM::new().context("Failed to open the VISA resource manager")?;
        let expr = visa_rs::VisaString::from(
            CString::new(resource).context("Failed to create CString")?,
        );
        let rsc = rm
            .find_res(&expr)
            .with_context(|| format!("VISA resource '{}' not found", resource))?;
        let instrument = rm
            .open(&rsc, AccessMode::NO_LOCK, timeout)
            .with_context(|| format!("Failed to open VISA resource '{}'", resource))?;

        tracing::info!("Connected to VISA instrument: {}", resource);
        Ok(Self {
            resource: resource.to_string(),
            instrument,
        })
    }

    /// VISA support is compiled out.
    #[cfg(not(feature = "instrument_visa"))]
    pub fn open(resource: &str, _timeout: Duration) -> anyhow::Result<Self> {
        anyhow::bail!(
            "cannot open '{}': built without the instrument_visa feature",
            resource
        )
    }

    /// Resource string this transport talks to.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    #[cfg(feature = "instrument_visa")]
    async fn write(&mut self, command: &str) -> AppResult<()> {
        use anyhow::Context;
        use std::io::Write;

        self.instrument
            .write_all(format!("{}\n", command).as_bytes())
            .with_context(|| format!("Failed to send '{}' to {}", command, self.resource))
            .map_err(transport_error)
    }

    #[cfg(feature = "instrument_visa")]
    async fn query(&mut self, command: &str) -> AppResult<String> {
        use anyhow::Context;
        use std::io::Read;

        self.write(command).await?;

        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self
                .instrument
                .read(&mut buf)
                .with_context(|| format!("Failed to read reply to '{}'", command))
                .map_err(transport_error)?;
            response.extend_from_slice(&buf[..n]);
            if n == 0 || response.last() == Some(&b'\n') {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write(&mut self, command: &str) -> AppResult<()> {
        Err(transport_error(anyhow::anyhow!(
            "cannot send '{}' to {}: built without the instrument_visa feature",
            command,
            self.resource
        )))
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command).await.map(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_counts_terminators() {
        assert_eq!(complete_lines(""), 0);
        assert_eq!(complete_lines("3oa\r\nAP="), 1);
        assert_eq!(complete_lines("3oa\r\nAP=1200\r\n"), 2);
    }

    #[test]
    fn test_split_reply() {
        assert_eq!(
            split_reply("2ma4000\r\n02#OK\r\n"),
            vec!["2ma4000".to_string(), "02#OK".to_string()]
        );
    }

    #[test]
    fn test_transports_fail_cleanly_without_features() {
        let settings = crate::config::Settings::default().controller;
        if cfg!(not(feature = "instrument_serial")) {
            assert!(SerialTransport::open(&settings).is_err());
        }
        if cfg!(not(feature = "instrument_visa")) {
            assert!(VisaTransport::open("USB0::INSTR", Duration::ZERO).is_err());
        }
    }
}
