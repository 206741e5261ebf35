//! Byte-stream transports: plain TCP, or TLS behind the `ssl` feature.
use serde_derive::{Deserialize, Serialize};

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[cfg(feature = "ssl")]
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslOptions, SslStream, SslVerifyMode};

/// Encapsulates how to connect to a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamConnector {
    /// Connect to the server through a regular TCP stream.
    Tcp,
    #[cfg(feature = "ssl")]
    /// Connect to the server through a TCP stream encrypted with TLS.
    Ssl {
        ca_file: String,
        certificate_file: String,
        key_file: String,
        verify_peer: bool,
    },
}

impl Default for StreamConnector {
    fn default() -> Self {
        StreamConnector::Tcp
    }
}

impl StreamConnector {
    #[cfg(feature = "ssl")]
    /// Creates a StreamConnector that will connect with TLS.
    ///
    /// SSLv2, SSLv3 and TLS compression are disabled.
    ///
    /// # Arguments
    ///
    /// `ca_file` - Path to the file containing trusted CA certificates.
    /// `certificate_file` - Path to the file containing the client certificate.
    /// `key_file` - Path to the file containing the client private key.
    /// `verify_peer` - Whether or not to verify that the server's certificate is trusted.
    pub fn with_ssl(ca_file: &str, certificate_file: &str, key_file: &str, verify_peer: bool) -> Self {
        StreamConnector::Ssl {
            ca_file: String::from(ca_file),
            certificate_file: String::from(certificate_file),
            key_file: String::from(key_file),
            verify_peer: verify_peer,
        }
    }

    /// Opens a stream to `hostname:port`, trying each resolved address in turn.
    pub fn connect(&self, hostname: &str, port: u16, timeout: Option<Duration>) -> io::Result<Stream> {
        let tcp = connect_tcp(hostname, port, timeout)?;

        match *self {
            StreamConnector::Tcp => Ok(Stream::Tcp(tcp)),
            #[cfg(feature = "ssl")]
            StreamConnector::Ssl {
                ref ca_file,
                ref certificate_file,
                ref key_file,
                verify_peer,
            } => {
                let mut builder = SslConnector::builder(SslMethod::tls())?;
                builder.set_cipher_list("ALL:!EXPORT:!eNULL:!aNULL:HIGH:@STRENGTH")?;
                builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3 | SslOptions::NO_COMPRESSION);
                builder.set_ca_file(ca_file)?;
                builder.set_certificate_file(certificate_file, SslFiletype::PEM)?;
                builder.set_private_key_file(key_file, SslFiletype::PEM)?;

                if !verify_peer {
                    builder.set_verify(SslVerifyMode::NONE);
                }

                match builder.build().connect(hostname, tcp) {
                    Ok(s) => Ok(Stream::Ssl(s)),
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                }
            }
        }
    }
}

fn connect_tcp(hostname: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in (hostname, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };

        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve {}:{}", hostname, port),
        )
    }))
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "ssl")]
    Ssl(SslStream<TcpStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match *self {
            Stream::Tcp(ref s) => s,
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref s) => s.get_ref(),
        }
    }

    /// Bounds how long a single read may block.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_write_timeout(timeout)
    }

    /// Shuts down both halves of the underlying socket.
    pub fn shutdown(&self) -> io::Result<()> {
        self.tcp().shutdown(::std::net::Shutdown::Both)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.read(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Tcp(ref mut s) => s.write(buf),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Tcp(ref mut s) => s.flush(),
            #[cfg(feature = "ssl")]
            Stream::Ssl(ref mut s) => s.flush(),
        }
    }
}
