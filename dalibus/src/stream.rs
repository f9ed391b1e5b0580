use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::*;

/// Transport abstraction for the bridge connection.
pub trait Stream: Read + Write + Send {
    fn split(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
    fn shutdown(&mut self) -> Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl Stream for TcpStream {
    fn split(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        Ok((
            Box::new(TcpStream::try_clone(self)?),
            Box::new(TcpStream::try_clone(self)?),
        ))
    }

    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_read_timeout(self, timeout)?;
        Ok(())
    }
}

impl Stream for UnixStream {
    fn split(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        Ok((
            Box::new(UnixStream::try_clone(self)?),
            Box::new(UnixStream::try_clone(self)?),
        ))
    }

    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        UnixStream::set_read_timeout(self, timeout)?;
        Ok(())
    }
}
