//! Socket rendezvous between the native proxy and the plugin host process.
//!
//! The proxy binds a uniquely named listener, launches the host, and accepts
//! exactly five connections in a fixed order, one per traffic class. Each
//! connection opens with a single tag byte naming the channel it is meant to
//! be, so a host dialing out of order fails startup deterministically
//! instead of silently crossing wires. The listener and its socket file are
//! gone once the last channel is up.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

use crate::channel::EventChannel;
use crate::error::{BridgeError, Result};

/// Cadence of the startup liveness probe.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The five channels, in the order they must be dialed and accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Dispatch,
    DispatchMidi,
    HostCallback,
    Parameters,
    Audio,
}

impl ChannelKind {
    pub const ORDER: [ChannelKind; 5] = [
        ChannelKind::Dispatch,
        ChannelKind::DispatchMidi,
        ChannelKind::HostCallback,
        ChannelKind::Parameters,
        ChannelKind::Audio,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Dispatch => "dispatch",
            ChannelKind::DispatchMidi => "dispatch_midi",
            ChannelKind::HostCallback => "host_callback",
            ChannelKind::Parameters => "parameters",
            ChannelKind::Audio => "audio",
        }
    }
}

/// The five connected channels of one bridge instance.
pub struct ChannelSet {
    pub dispatch: EventChannel,
    pub dispatch_midi: EventChannel,
    pub host_callback: EventChannel,
    pub parameters: EventChannel,
    pub audio: EventChannel,
}

impl ChannelSet {
    fn from_streams(mut streams: Vec<StdUnixStream>) -> Self {
        // Streams arrive in ChannelKind::ORDER.
        let audio = streams.pop().expect("five streams");
        let parameters = streams.pop().expect("five streams");
        let host_callback = streams.pop().expect("five streams");
        let dispatch_midi = streams.pop().expect("five streams");
        let dispatch = streams.pop().expect("five streams");

        ChannelSet {
            dispatch: EventChannel::new(ChannelKind::Dispatch.name(), dispatch),
            dispatch_midi: EventChannel::new(ChannelKind::DispatchMidi.name(), dispatch_midi),
            host_callback: EventChannel::new(ChannelKind::HostCallback.name(), host_callback),
            parameters: EventChannel::new(ChannelKind::Parameters.name(), parameters),
            audio: EventChannel::new(ChannelKind::Audio.name(), audio),
        }
    }
}

/// Scratch directory for socket files: the user's runtime dir when set, the
/// system temp dir otherwise.
pub fn runtime_directory() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|path| path.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// A socket path that is unique per plugin instance within this user
/// session.
pub fn generate_endpoint_path() -> PathBuf {
    static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);
    let discriminator = nanos ^ INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed).rotate_left(16);

    runtime_directory().join(format!(
        "vstbridge-{:08x}-{:08x}.sock",
        std::process::id(),
        discriminator
    ))
}

/// The shared endpoint all instances of one plugin group rendezvous on,
/// derived from the group name, the Wine prefix, and the host architecture.
pub fn group_endpoint_path(group: &str, wine_prefix: Option<&Path>, arch: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    wine_prefix.unwrap_or(Path::new("<default>")).hash(&mut hasher);

    runtime_directory().join(format!(
        "vstbridge-group-{}-{:016x}-{}.sock",
        group,
        hasher.finish(),
        arch
    ))
}

/// The bound listener, waiting for the plugin host to dial back in.
pub struct Rendezvous {
    path: PathBuf,
    listener: UnixListener,
}

impl Rendezvous {
    /// Bind the listener. This must happen before the host process is
    /// launched so the host never dials a missing socket.
    pub fn bind(runtime: &tokio::runtime::Handle, path: PathBuf) -> Result<Self> {
        let listener = runtime.block_on(async { UnixListener::bind(&path) })?;
        Ok(Rendezvous { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the five channels in order, polling `alive` at the liveness
    /// cadence so a host that died mid-startup fails the bridge instead of
    /// hanging it. Consumes the listener; the socket file is unlinked before
    /// returning.
    pub fn accept_channels<F>(self, runtime: &tokio::runtime::Handle, alive: F) -> Result<ChannelSet>
    where
        F: Fn() -> bool,
    {
        self.accept_channels_with_poll(runtime, alive, LIVENESS_POLL_INTERVAL)
    }

    pub fn accept_channels_with_poll<F>(
        self,
        runtime: &tokio::runtime::Handle,
        alive: F,
        poll_interval: Duration,
    ) -> Result<ChannelSet>
    where
        F: Fn() -> bool,
    {
        let result = runtime.block_on(async {
            let mut streams = Vec::with_capacity(ChannelKind::ORDER.len());
            for expected in ChannelKind::ORDER {
                streams.push(accept_one(&self.listener, expected, &alive, poll_interval).await?);
            }
            Ok(streams)
        });

        // The endpoint has served its purpose whether or not the accepts
        // worked out; dropping self unlinks the socket file.
        result.map(ChannelSet::from_streams)
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_one<F>(
    listener: &UnixListener,
    expected: ChannelKind,
    alive: &F,
    poll_interval: Duration,
) -> Result<StdUnixStream>
where
    F: Fn() -> bool,
{
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, _) = accepted?;

                let mut tag = [0u8; 1];
                stream.read_exact(&mut tag).await.map_err(|_| {
                    BridgeError::StartupFailed {
                        reason: format!(
                            "the host disconnected before identifying the {} channel",
                            expected.name()
                        ),
                    }
                })?;
                if tag[0] != expected.tag() {
                    return Err(BridgeError::StartupFailed {
                        reason: format!(
                            "the host dialed its channels out of order: expected {} (tag {}), got tag {}",
                            expected.name(),
                            expected.tag(),
                            tag[0]
                        ),
                    });
                }

                let std_stream = stream.into_std()?;
                std_stream.set_nonblocking(false)?;
                return Ok(std_stream);
            }
            _ = poll.tick() => {
                if !alive() {
                    return Err(BridgeError::StartupFailed {
                        reason: format!(
                            "the host process exited before the {} channel connected",
                            expected.name()
                        ),
                    });
                }
            }
        }
    }
}

/// Dial the five channels from the host side, in order, tagging each
/// connection.
pub fn connect_channels(endpoint: &Path) -> Result<ChannelSet> {
    let mut streams = Vec::with_capacity(ChannelKind::ORDER.len());
    for kind in ChannelKind::ORDER {
        let mut stream = StdUnixStream::connect(endpoint)?;
        stream.write_all(&[kind.tag()])?;
        streams.push(stream);
    }
    Ok(ChannelSet::from_streams(streams))
}

// ---------------------------------------------------------------------------
// Group host rendezvous
// ---------------------------------------------------------------------------

/// Ask a running group host to take over hosting one plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRequest {
    pub plugin_path: PathBuf,
    pub endpoint: PathBuf,
}

/// The group host's acknowledgement. The PID is only used for liveness
/// probing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupResponse {
    pub pid: u32,
}

const MAX_GROUP_MESSAGE_LENGTH: usize = 1 << 20;

pub fn write_group_message<T, S>(stream: &mut S, message: &T) -> Result<()>
where
    T: Serialize,
    S: Write,
{
    let data = bincode::serialize(message).map_err(|err| BridgeError::Group(err.to_string()))?;
    stream.write_all(&(data.len() as u32).to_le_bytes())?;
    stream.write_all(&data)?;
    Ok(())
}

pub fn read_group_message<T, S>(stream: &mut S) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    S: Read,
{
    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf)?;
    let length = u32::from_le_bytes(length_buf) as usize;
    if length > MAX_GROUP_MESSAGE_LENGTH {
        return Err(BridgeError::Group(format!(
            "group message of {length} bytes exceeds the limit"
        )));
    }

    let mut data = vec![0u8; length];
    stream.read_exact(&mut data)?;
    bincode::deserialize(&data).map_err(|err| BridgeError::Group(err.to_string()))
}
