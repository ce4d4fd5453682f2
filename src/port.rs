use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::host::HostPort;
use crate::transport::Transport;

/// How the serial line is opened.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub dev: String,
    pub baud: u32,
    pub rtscts: bool,
    pub timeout: Duration,
}

pub fn open_port(cfg: &PortConfig) -> io::Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&cfg.dev, cfg.baud)
        .timeout(cfg.timeout)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if cfg.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| io::Error::other(format!("open {}: {}", cfg.dev, e)))
}

const RX_CHUNK: usize = 4096;
const TX_CAP: usize = 4096;
/// Port timeout once serving. Writes that cannot complete within it are
/// left queued, so a host that stops reading never stalls the engine.
const IO_TIMEOUT: Duration = Duration::from_millis(1);

/// Device side of a serial line. The control channel is the line's baud
/// setting, which the host changes through the line-coding request.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    baud: u32,
}

impl SerialTransport {
    pub fn new(mut port: Box<dyn SerialPort>) -> io::Result<Self> {
        port.set_timeout(IO_TIMEOUT)?;
        let baud = port.baud_rate()?;
        Ok(Self {
            port,
            rx: VecDeque::with_capacity(RX_CHUNK),
            tx: Vec::with_capacity(TX_CAP),
            baud,
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let avail = self.port.bytes_to_read()? as usize;
        if avail == 0 {
            return Ok(());
        }
        let mut buf = [0u8; RX_CHUNK];
        let want = avail.min(RX_CHUNK);
        match self.port.read(&mut buf[..want]) {
            Ok(n) => self.rx.extend(&buf[..n]),
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl Transport for SerialTransport {
    fn try_read(&mut self) -> io::Result<Option<u8>> {
        if self.rx.is_empty() {
            self.fill()?;
        }
        Ok(self.rx.pop_front())
    }

    fn try_write(&mut self, byte: u8) -> io::Result<bool> {
        if self.tx.len() >= TX_CAP {
            return Ok(false);
        }
        self.tx.push(byte);
        Ok(true)
    }

    /// Hand the port whatever it takes now. The rest stays queued and
    /// `try_write` refuses bytes once the queue is full.
    fn flush(&mut self) -> io::Result<()> {
        while !self.tx.is_empty() {
            match self.port.write(&self.tx) {
                Ok(0) => break,
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.rx.clear();
        self.tx.clear();
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn control_signal(&mut self) -> io::Result<Option<u32>> {
        let baud = self.port.baud_rate()?;
        if baud == self.baud {
            return Ok(None);
        }
        debug!(from = self.baud, to = baud, "line baud changed");
        self.baud = baud;
        Ok(Some(baud))
    }
}

impl HostPort for Box<dyn SerialPort> {
    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.set_baud_rate(baud)?;
        Ok(())
    }
}
