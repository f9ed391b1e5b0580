//! Bridge connection handling.

use std::io::Read;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sansio::TransactionQueue;
use crate::stream::Stream;

/// A connected DALI bridge.
///
/// Owns the read half of the transport; the write half is handed out once to
/// become the transaction queue's transmit function. Tracks bus activity so
/// the caller can honor an idle-close timeout.
pub struct BridgeConnection {
    stream: Box<dyn Stream>,
    reader: Box<dyn Read + Send>,
    last_activity: Instant,
    close_after_idle: Option<Duration>,
    read_buf: [u8; 64],
}

impl BridgeConnection {
    /// Connect to `tcp:host[:port]` or `unix:/path`.
    pub fn connect(
        address: &str,
        default_port: u16,
        close_after_idle: Option<Duration>,
    ) -> Result<Self> {
        let mut stream: Box<dyn Stream> = if let Some(hostspec) = address.strip_prefix("tcp:") {
            let target = if hostspec.contains(':') {
                hostspec.to_string()
            } else {
                format!("{}:{}", hostspec, default_port)
            };
            Box::new(TcpStream::connect(target)?)
        } else if let Some(path) = address.strip_prefix("unix:") {
            Box::new(UnixStream::connect(path)?)
        } else {
            tracing::error!(address, "unknown bridge address scheme");
            return Err(Error::Io(std::io::ErrorKind::InvalidInput));
        };
        let (reader, _writer) = stream.split()?;
        tracing::info!(address, "connected to DALI bridge");
        Ok(BridgeConnection {
            stream,
            reader,
            last_activity: Instant::now(),
            close_after_idle,
            read_buf: [0u8; 64],
        })
    }

    /// Obtain the write half for use as the queue's transmit function.
    pub fn transmitter(&mut self) -> Result<impl FnMut(&[u8]) -> Result<usize> + 'static> {
        let (_reader, mut writer) = self.stream.split()?;
        Ok(move |bytes: &[u8]| {
            use std::io::Write;
            writer.write_all(bytes)?;
            writer.flush()?;
            Ok(bytes.len())
        })
    }

    /// Read whatever the bridge has sent, waiting at most `timeout`, and
    /// feed it to the queue. Always runs a processing pass so lazy timeouts
    /// are detected even on a silent bus. Returns the number of bytes fed.
    pub fn pump(&mut self, timeout: Duration, queue: &mut TransactionQueue) -> Result<usize> {
        self.stream.set_read_timeout(Some(timeout))?;
        match self.reader.read(&mut self.read_buf) {
            Ok(0) => {
                queue.abort_all(Error::Aborted);
                Err(Error::Io(std::io::ErrorKind::UnexpectedEof))
            }
            Ok(n) => {
                self.last_activity = Instant::now();
                queue.accept_inbound_bytes(&self.read_buf[..n]);
                Ok(n)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                queue.process_operations();
                Ok(0)
            }
            Err(e) => {
                queue.abort_all(Error::Aborted);
                Err(e.into())
            }
        }
    }

    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once the configured idle period has elapsed without traffic.
    pub fn idle_expired(&self) -> bool {
        match self.close_after_idle {
            Some(idle) => self.last_activity.elapsed() >= idle,
            None => false,
        }
    }

    /// Shut the transport down; queued transactions are the caller's to
    /// abort.
    pub fn close(&mut self) -> Result<()> {
        tracing::info!("closing DALI bridge connection");
        self.stream.shutdown()
    }
}
