use bufstream::BufStream;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use crate::cancel::CancellationToken;
use crate::error::Error::{self, OperationError, ResponseError};
use crate::error::Result;
use crate::stream::Stream;
use crate::wire_protocol::header::Header;
use crate::wire_protocol::operations::MAX_MESSAGE_SIZE;
use crate::wire_protocol::Message;

use std::cmp;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::{Connection, ConnectionId};

// Longest a blocked read goes without re-checking its cancellation token.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A connection over a TCP (or TLS) stream.
pub struct BinaryConnection {
    id: ConnectionId,
    stream: BufStream<Stream>,
    open: bool,
    // Bytes read off the socket that do not yet form a complete frame.
    inbound: Vec<u8>,
    socket_timeout: Option<Duration>,
}

impl BinaryConnection {
    pub fn new(id: ConnectionId, stream: Stream, socket_timeout: Option<Duration>) -> BinaryConnection {
        BinaryConnection {
            id: id,
            stream: BufStream::new(stream),
            open: true,
            inbound: Vec::new(),
            socket_timeout: socket_timeout,
        }
    }

    // Closes the connection and hands back the error that broke it.
    fn fail(&mut self, err: Error) -> Error {
        debug!("connection {} failed: {}", self.id, err);
        self.close();
        err
    }

    // Splits one complete frame off the inbound buffer, if there is one.
    fn take_frame(&mut self) -> Result<Option<Message>> {
        if self.inbound.len() < 4 {
            return Ok(None);
        }

        let length = LittleEndian::read_i32(&self.inbound[..4]);
        if length < Header::LENGTH || length > MAX_MESSAGE_SIZE {
            return Err(ResponseError(format!("Received a frame with invalid length {}.", length)));
        }

        let length = length as usize;
        if self.inbound.len() < length {
            return Ok(None);
        }

        let frame: Vec<u8> = self.inbound.drain(..length).collect();
        Message::read(&mut &frame[..]).map(Some)
    }
}

impl Connection for BinaryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        if !self.open {
            return Err(OperationError(format!("Connection {} is closed.", self.id)));
        }

        trace!("connection {} sending request {}", self.id, message.request_id());
        let written = self
            .stream
            .get_ref()
            .set_write_timeout(self.socket_timeout)
            .map_err(Error::from)
            .and_then(|_| message.write(&mut self.stream))
            .and_then(|_| self.stream.flush().map_err(Error::from));

        written.map_err(|err| self.fail(err))
    }

    fn receive_message(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Message> {
        if !self.open {
            return Err(OperationError(format!("Connection {} is closed.", self.id)));
        }

        let start = Instant::now();
        let deadline = timeout.or(self.socket_timeout).and_then(|t| start.checked_add(t));
        let mut chunk = [0u8; 4096];

        loop {
            match self.take_frame() {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => (),
                Err(err) => return Err(self.fail(err)),
            }

            if cancel.is_cancelled() {
                return Err(self.fail(Error::Cancelled));
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let err = Error::timeout("waiting for a reply", now - start);
                        return Err(self.fail(err));
                    }
                    cmp::min(deadline - now, RECEIVE_POLL_INTERVAL)
                }
                None => RECEIVE_POLL_INTERVAL,
            };

            if let Err(err) = self.stream.get_ref().set_read_timeout(Some(slice)) {
                return Err(self.fail(err.into()));
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::UnexpectedEof, "the server closed the connection");
                    return Err(self.fail(err.into()));
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.inbound.clear();
        let _ = self.stream.get_ref().shutdown();
    }
}

impl Drop for BinaryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
