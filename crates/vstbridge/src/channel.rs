//! One bridge channel: a blocking Unix stream carrying framed messages under
//! a strict request/response discipline.
//!
//! Each channel is guarded by its own lock so overlapping calls from the
//! host serialize into clean request/response pairs. The receiving side runs
//! a single loop thread per channel, so its lock is effectively uncontended;
//! it is still taken so a channel handle can be shared freely.

use std::os::unix::net::UnixStream;

use parking_lot::Mutex;

use crate::codec::{self, Decode, Encode, Message};
use crate::error::{BridgeError, Result};

struct ChannelState {
    stream: UnixStream,
    /// Reused for framing in both directions; audio blocks never allocate
    /// once this has grown to the block size.
    scratch: Vec<u8>,
}

pub struct EventChannel {
    name: &'static str,
    state: Mutex<ChannelState>,
    /// A dup of the stream used to shut the channel down while a loop thread
    /// is parked inside a blocking read (and therefore holds the lock).
    shutdown_handle: Option<UnixStream>,
}

impl EventChannel {
    pub fn new(name: &'static str, stream: UnixStream) -> Self {
        let shutdown_handle = stream.try_clone().ok();
        EventChannel {
            name,
            state: Mutex::new(ChannelState {
                stream,
                scratch: Vec::new(),
            }),
            shutdown_handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Send a request and block for its response. The channel lock is held
    /// for the whole pair, which is what keeps concurrent callers FIFO.
    pub fn request<M: Message>(&self, message: &M) -> Result<M::Response> {
        let mut state = self.state.lock();
        let ChannelState { stream, scratch } = &mut *state;
        codec::write_framed(stream, scratch, message).map_err(|err| self.map_error(err))?;
        codec::read_framed(stream, scratch).map_err(|err| self.map_error(err))
    }

    /// Receive one request and answer it with whatever the handler returns.
    ///
    /// The lock is dropped while the handler runs: handlers reenter the host
    /// (or the plugin), and no channel lock may be held across that boundary.
    /// FIFO ordering is preserved because only one loop thread receives per
    /// channel.
    pub fn receive<M, F>(&self, handler: F) -> Result<()>
    where
        M: Message,
        F: FnOnce(M) -> M::Response,
    {
        let request = self.read_unsolicited::<M>()?;
        let response = handler(request);
        self.send_unsolicited(&response)
    }

    /// Read one message outside the request/response pairing. Used for the
    /// initial descriptor handshake and by receive loops.
    pub fn read_unsolicited<T: Decode>(&self) -> Result<T> {
        let mut state = self.state.lock();
        let ChannelState { stream, scratch } = &mut *state;
        codec::read_framed(stream, scratch).map_err(|err| self.map_error(err))
    }

    /// Write one message outside the request/response pairing.
    pub fn send_unsolicited<T: Encode>(&self, message: &T) -> Result<()> {
        let mut state = self.state.lock();
        let ChannelState { stream, scratch } = &mut *state;
        codec::write_framed(stream, scratch, message).map_err(|err| self.map_error(err))
    }

    /// Shut the stream down in both directions, waking any thread blocked on
    /// it. Errors are ignored; the peer may already be gone.
    pub fn shutdown(&self) {
        if let Some(handle) = &self.shutdown_handle {
            let _ = handle.shutdown(std::net::Shutdown::Both);
        }
    }

    fn map_error(&self, err: codec::CodecError) -> BridgeError {
        match err {
            codec::CodecError::Truncated => BridgeError::ChannelClosed { channel: self.name },
            codec::CodecError::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                BridgeError::ChannelClosed { channel: self.name }
            }
            other => BridgeError::Codec(other),
        }
    }
}
