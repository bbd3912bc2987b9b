//! The native side of the bridge.
//!
//! One `Vst2PluginBridge` is created per plugin instance by the entry point.
//! It owns the five channels to the plugin host process, the host-visible
//! `AEffect`, and the helper thread that serves plugin-originated host
//! callbacks. All steady-state traffic is blocking I/O on OS threads; the
//! embedded tokio runtime only drives the startup acceptor and the pipes
//! that feed the host's stdout/stderr into the log.

use std::cell::UnsafeCell;
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, error, info, warn};

use crate::channel::EventChannel;
use crate::config::BridgeConfig;
use crate::converter;
use crate::error::{BridgeError, Result};
use crate::events::{
    AudioRequest, DynamicVstEvents, Event, EventPayload, EventResult, Parameter, ParameterResult,
};
use crate::logging;
use crate::rendezvous::{
    self, generate_endpoint_path, group_endpoint_path, ChannelSet, GroupRequest, GroupResponse,
    Rendezvous,
};
use crate::vst2::abi::{
    host_opcodes, plugin_opcodes, AEffect, VstRect, VstSpeakerArrangement, VstTimeInfo,
};

/// REAPER passes a libSwell handle instead of an X11 window to `effEditOpen`
/// when a plugin answers this can-do, which cannot work with a GUI that
/// lives on the emulated Win32 side. Intercepted locally, never forwarded.
const COCKOS_VIEW_CAN_DO: &str = "hasCockosViewAsConfig";

/// How the plugin host process is supervised.
enum HostMode {
    /// A child process owned by this bridge. Killed on close.
    Individual {
        child: Mutex<Option<tokio::process::Child>>,
    },
    /// A plugin slot inside a shared group host. Closing the dispatch
    /// channel releases the slot; the process itself lives on.
    Group { pid: Arc<AtomicU32> },
    /// Channels handed in by someone else who also supervises the host.
    /// Used by the test harnesses.
    External,
}

pub struct Vst2PluginBridge {
    /// The plugin struct the host sees. Only mutated when the plugin host
    /// sends a descriptor snapshot (and during construction).
    effect: UnsafeCell<AEffect>,
    /// The host's `audioMaster` function.
    host_callback: crate::vst2::abi::HostCallbackProc,
    span: tracing::Span,

    // Drives the startup acceptor and the stdout/stderr pumps; nothing on
    // the audio path touches it.
    _runtime: tokio::runtime::Runtime,

    dispatch: EventChannel,
    dispatch_midi: EventChannel,
    host_callback_channel: EventChannel,
    parameters: EventChannel,
    audio: EventChannel,

    /// Chunk bytes handed to the host after `effGetChunk`. The pointer the
    /// host receives points in here, so the buffer lives until the next
    /// chunk request.
    chunk_data: Mutex<Vec<u8>>,
    /// Editor rectangle storage for `effEditGetRect`, same lifetime story.
    editor_rect: Mutex<VstRect>,
    /// Host-bound MIDI parked until the end of the current audio block.
    /// Unbounded, but drained every block; growth is bounded by what a
    /// plugin emits within one block.
    incoming_midi: Mutex<Vec<DynamicVstEvents>>,

    mode: HostMode,
    host_callback_handler: Mutex<Option<JoinHandle<()>>>,
    group_connect_handler: Mutex<Option<JoinHandle<()>>>,
    /// Tells the group connect helper to stop retrying.
    shutting_down: Arc<AtomicBool>,
}

// SAFETY: the raw pointers inside `effect` are the host's problem, not ours;
// every piece of bridge state shared between threads is behind a lock or
// atomic, and `AEffect` itself is only written per the descriptor invariant.
unsafe impl Send for Vst2PluginBridge {}
unsafe impl Sync for Vst2PluginBridge {}

/// Raw bridge pointer that helper threads capture. The bridge joins those
/// threads before it is dropped, which is what makes the dereference sound.
struct BridgePtr(*const Vst2PluginBridge);
unsafe impl Send for BridgePtr {}

impl Vst2PluginBridge {
    /// Launch the plugin host, rendezvous with it, and return a ready
    /// bridge. This is the whole constructor the entry point calls.
    pub fn launch(host_callback: crate::vst2::abi::HostCallbackProc) -> Result<Box<Self>> {
        logging::init();
        let config = BridgeConfig::from_environment()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("vstbridge-io")
            .enable_all()
            .build()?;

        let endpoint = generate_endpoint_path();
        let span = logging::bridge_span(&endpoint);
        let _guard = span.enter();

        info!(
            plugin = %config.plugin_path.display(),
            endpoint = %endpoint.display(),
            host = %config.host_binary.display(),
            mode = if config.group.is_some() { "group" } else { "individual" },
            "initializing bridge"
        );

        let rendezvous = Rendezvous::bind(runtime.handle(), endpoint.clone())?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let (mode, group_connect_handler) =
            launch_host(&runtime, &config, rendezvous.path(), &shutting_down)?;

        let channels = match &mode {
            HostMode::Individual { child } => {
                rendezvous.accept_channels(runtime.handle(), || {
                    child
                        .lock()
                        .as_mut()
                        .map(|child| matches!(child.try_wait(), Ok(None)))
                        .unwrap_or(false)
                })
            }
            HostMode::Group { pid } => rendezvous.accept_channels(runtime.handle(), || {
                match pid.load(Ordering::Acquire) {
                    // The group response hasn't arrived yet; give the
                    // connect helper the benefit of the doubt.
                    0 => !shutting_down.load(Ordering::Acquire),
                    pid => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
                }
            }),
            HostMode::External => unreachable!("launch never produces external mode"),
        };
        let channels = match channels {
            Ok(channels) => channels,
            Err(err) => {
                shutting_down.store(true, Ordering::Release);
                if let Some(handle) = group_connect_handler {
                    let _ = handle.join();
                }
                return Err(err);
            }
        };

        drop(_guard);
        let bridge = match Self::finish(
            host_callback,
            channels,
            mode,
            runtime,
            span,
            Arc::clone(&shutting_down),
        ) {
            Ok(bridge) => bridge,
            Err(err) => {
                shutting_down.store(true, Ordering::Release);
                if let Some(handle) = group_connect_handler {
                    let _ = handle.join();
                }
                return Err(err);
            }
        };
        *bridge.group_connect_handler.lock() = group_connect_handler;
        Ok(bridge)
    }

    /// Attach a bridge to channels someone else connected, skipping process
    /// supervision. This is how the tests drive a bridge against a mock
    /// plugin host.
    #[doc(hidden)]
    pub fn attach_to_channels(
        host_callback: crate::vst2::abi::HostCallbackProc,
        channels: ChannelSet,
    ) -> Result<Box<Self>> {
        logging::init();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("vstbridge-io")
            .enable_all()
            .build()?;
        let span = logging::bridge_span(std::path::Path::new("external"));
        Self::finish(
            host_callback,
            channels,
            HostMode::External,
            runtime,
            span,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Shared tail of construction: wire up the struct, start the host
    /// callback handler, and run the descriptor handshake.
    fn finish(
        host_callback: crate::vst2::abi::HostCallbackProc,
        channels: ChannelSet,
        mode: HostMode,
        runtime: tokio::runtime::Runtime,
        span: tracing::Span,
        shutting_down: Arc<AtomicBool>,
    ) -> Result<Box<Self>> {
        let ChannelSet {
            dispatch,
            dispatch_midi,
            host_callback: host_callback_channel,
            parameters,
            audio,
        } = channels;

        let bridge = Box::new(Vst2PluginBridge {
            effect: UnsafeCell::new(AEffect::inert(
                dispatch_trampoline,
                process_trampoline,
                process_replacing_trampoline,
                set_parameter_trampoline,
                get_parameter_trampoline,
            )),
            host_callback,
            span,
            _runtime: runtime,
            dispatch,
            dispatch_midi,
            host_callback_channel,
            parameters,
            audio,
            chunk_data: Mutex::new(Vec::new()),
            editor_rect: Mutex::new(VstRect::default()),
            incoming_midi: Mutex::new(Vec::new()),
            mode,
            host_callback_handler: Mutex::new(None),
            group_connect_handler: Mutex::new(None),
            shutting_down,
        });

        // The trampolines find their way back through this pointer. The box
        // gives the struct a stable address before it leaks to the host.
        unsafe {
            (*bridge.effect.get()).object = &*bridge as *const Self as *mut c_void;
        }

        // Serve host callbacks before the handshake: the plugin will likely
        // call into the host while it initializes.
        let ptr = BridgePtr(&*bridge as *const Self);
        let handler = std::thread::Builder::new()
            .name("host-callback".to_string())
            .spawn(move || {
                let ptr = ptr;
                let bridge = unsafe { &*ptr.0 };
                bridge.host_callback_loop();
            })?;
        *bridge.host_callback_handler.lock() = Some(handler);

        // The plugin host sends the loaded plugin's descriptor as one
        // unsolicited result on the dispatch channel.
        let initialization: EventResult = bridge.dispatch.read_unsolicited()?;
        match initialization.payload {
            EventPayload::Descriptor(descriptor) => unsafe {
                descriptor.apply_to(&mut *bridge.effect.get());
            },
            other => {
                return Err(BridgeError::ProtocolMismatch {
                    channel: "dispatch",
                    reason: format!("expected the initial descriptor, got {other:?}"),
                })
            }
        }

        let _guard = bridge.span.enter();
        info!("bridge is up");
        drop(_guard);

        Ok(bridge)
    }

    /// Leak the bridge to the host, returning the `AEffect` pointer the
    /// entry point hands back. Freed again when the host dispatches
    /// `effClose`.
    pub fn into_effect(bridge: Box<Self>) -> *mut AEffect {
        let raw = Box::into_raw(bridge);
        unsafe { (*raw).effect.get() }
    }

    fn effect_ptr(&self) -> *mut AEffect {
        self.effect.get()
    }

    // -----------------------------------------------------------------------
    // Host-facing entry points (called through the trampolines)
    // -----------------------------------------------------------------------

    pub fn dispatch(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> isize {
        let _guard = self.span.enter();

        // Some hosts have been seen dispatching before initialization
        // finished; answering locally beats crashing them.
        if unsafe { (*self.effect.get()).magic == 0 } {
            warn!(
                opcode,
                "the host dispatched an event before the plugin finished initializing, ignoring"
            );
            return 0;
        }

        if opcode == plugin_opcodes::CAN_DO {
            let query = unsafe { converter::read_c_string(data) };
            if query == COCKOS_VIEW_CAN_DO {
                info!("the host asked for libSwell GUI support, which cannot work here, declining");
                return -1;
            }
        }

        let event = unsafe { converter::read_dispatch_event(opcode, index, value, data, option) };
        debug!(opcode, index, value, "dispatch");

        // MIDI delivery gets its own channel so an open dropdown in the
        // plugin GUI (which blocks the dispatch loop's thread over there)
        // cannot starve it.
        let channel = if opcode == plugin_opcodes::PROCESS_EVENTS {
            &self.dispatch_midi
        } else {
            &self.dispatch
        };

        let response = match channel.request(&event) {
            Ok(response) => response,
            Err(err) => {
                error!(opcode, "dispatch failed: {err}");
                return 0;
            }
        };

        unsafe { self.write_back(opcode, data, value, &response) };
        response.return_value
    }

    pub fn process_replacing(
        &self,
        inputs: *const *const f32,
        outputs: *mut *mut f32,
        frames: i32,
    ) {
        let _guard = self.span.enter();

        let (num_inputs, num_outputs) = unsafe {
            let effect = &*self.effect.get();
            (
                effect.num_inputs.max(0) as usize,
                effect.num_outputs.max(0) as usize,
            )
        };
        let frame_count = frames.max(0) as usize;

        let mut request = AudioRequest {
            inputs: Vec::with_capacity(num_inputs),
            frames,
        };
        unsafe {
            for channel in 0..num_inputs {
                let plane = *inputs.add(channel);
                request
                    .inputs
                    .push(std::slice::from_raw_parts(plane, frame_count).to_vec());
            }
        }

        let response = match self.audio.request(&request) {
            Ok(response) => response,
            Err(err) => {
                error!("audio request failed, filling silence: {err}");
                unsafe { fill_silence(outputs, num_outputs, frame_count) };
                return;
            }
        };

        if response.outputs.len() != num_outputs {
            error!(
                got = response.outputs.len(),
                expected = num_outputs,
                "audio response has the wrong channel count, filling silence"
            );
            unsafe { fill_silence(outputs, num_outputs, frame_count) };
            return;
        }

        unsafe {
            for (channel, plane) in response.outputs.iter().enumerate() {
                let out = *outputs.add(channel);
                std::ptr::copy_nonoverlapping(
                    plane.as_ptr(),
                    out,
                    frame_count.min(plane.len()),
                );
            }
        }

        // MIDI the plugin produced arrives on the host callback channel and
        // waits in the queue; hosts only accept it inside the block, so it
        // is delivered now, in arrival order, audio first.
        let batches = std::mem::take(&mut *self.incoming_midi.lock());
        for batch in &batches {
            let mut buffer = batch.to_buffer();
            unsafe {
                (self.host_callback)(
                    self.effect_ptr(),
                    host_opcodes::PROCESS_EVENTS,
                    0,
                    0,
                    buffer.as_ptr() as *mut c_void,
                    0.0,
                );
            }
        }
        // The reconstructed native batches drop here, at the block boundary.
    }

    pub fn get_parameter(&self, index: i32) -> f32 {
        let _guard = self.span.enter();

        match self.parameters.request(&Parameter { index, value: None }) {
            Ok(ParameterResult { value: Some(value) }) => value,
            Ok(ParameterResult { value: None }) => {
                error!(index, "get-parameter was answered without a value");
                debug_assert!(false, "get-parameter response must carry a value");
                0.0
            }
            Err(err) => {
                error!(index, "get-parameter failed: {err}");
                0.0
            }
        }
    }

    pub fn set_parameter(&self, index: i32, value: f32) {
        let _guard = self.span.enter();

        match self.parameters.request(&Parameter {
            index,
            value: Some(value),
        }) {
            // An empty result is the acknowledgement.
            Ok(ParameterResult { value: None }) => {}
            Ok(ParameterResult { value: Some(_) }) => {
                error!(index, "set-parameter was acknowledged with a value");
                debug_assert!(false, "set-parameter response must be empty");
            }
            Err(err) => error!(index, "set-parameter failed: {err}"),
        }
    }

    /// `effClose`: let the plugin shut down, then tear the bridge down. The
    /// caller (the trampoline) frees the bridge afterwards.
    fn handle_close(&self, index: i32, value: isize, option: f32) -> isize {
        let _guard = self.span.enter();
        info!("closing bridge");
        self.shutting_down.store(true, Ordering::Release);

        let event = Event {
            opcode: plugin_opcodes::CLOSE,
            index,
            value,
            option,
            payload: EventPayload::None,
            value_payload: None,
        };
        // Best effort: the plugin is allowed to crash during shutdown.
        let return_value = match self.dispatch.request(&event) {
            Ok(response) => response.return_value,
            Err(err) => {
                info!("the plugin crashed during shutdown, ignoring: {err}");
                0
            }
        };

        match &self.mode {
            HostMode::Individual { child } => {
                if let Some(child) = child.lock().as_mut() {
                    let _ = child.start_kill();
                }
            }
            // Group hosts outlive their plugins; closing the dispatch
            // channel is the signal to release this plugin's slot.
            HostMode::Group { .. } | HostMode::External => {
                self.dispatch.shutdown();
            }
        }

        return_value
    }

    // -----------------------------------------------------------------------
    // Host callback handling
    // -----------------------------------------------------------------------

    fn host_callback_loop(&self) {
        loop {
            let result = self
                .host_callback_channel
                .receive::<Event, _>(|event| self.handle_host_event(event));

            if let Err(err) = result {
                let _guard = self.span.enter();
                if err.is_disconnect() {
                    debug!("host callback channel closed, stopping the handler");
                } else {
                    error!("host callback handler failed: {err}");
                }
                return;
            }
        }
    }

    fn handle_host_event(&self, event: Event) -> EventResult {
        let _guard = self.span.enter();

        // MIDI sent from the plugin to the host must reach the host inside
        // an audio block. Park the batch and acknowledge; the audio path
        // flushes the queue right after the current block's response.
        if event.opcode == host_opcodes::PROCESS_EVENTS {
            if let EventPayload::MidiEvents(batch) = event.payload {
                self.incoming_midi.lock().push(batch);
                return EventResult {
                    return_value: 1,
                    payload: EventPayload::None,
                    value_payload: None,
                };
            }
        }

        // An IO change comes with a fresh descriptor; the host must see the
        // updated struct before the callback reaches it.
        if event.opcode == host_opcodes::IO_CHANGED {
            if let EventPayload::Descriptor(descriptor) = &event.payload {
                unsafe { descriptor.apply_to(&mut *self.effect.get()) };
            }
        }

        self.passthrough_host_event(event)
    }

    /// Rebuild the pointer-bearing host callback from an event and invoke
    /// the host with it.
    fn passthrough_host_event(&self, event: Event) -> EventResult {
        let Event {
            opcode,
            index,
            value,
            option,
            payload,
            ..
        } = event;

        let call = |data: *mut c_void| -> isize {
            unsafe { (self.host_callback)(self.effect_ptr(), opcode, index, value, data, option) }
        };

        match payload {
            EventPayload::None | EventPayload::Descriptor(_) => EventResult {
                return_value: call(std::ptr::null_mut()),
                payload: EventPayload::None,
                value_payload: None,
            },
            EventPayload::String(string) => {
                let data = CString::new(string).unwrap_or_default();
                EventResult {
                    return_value: call(data.as_ptr() as *mut c_void),
                    payload: EventPayload::None,
                    value_payload: None,
                }
            }
            EventPayload::WantsString => {
                let mut buffer = [0u8; 512];
                let return_value = call(buffer.as_mut_ptr() as *mut c_void);
                EventResult {
                    return_value,
                    payload: EventPayload::String(unsafe {
                        converter::read_c_string(buffer.as_mut_ptr() as *mut c_void)
                    }),
                    value_payload: None,
                }
            }
            EventPayload::WantsTimeInfo => {
                // The host returns a pointer to its transport info, or null
                // when it has none. The pointer is useless across the
                // process boundary, so the struct itself travels back.
                let return_value = call(std::ptr::null_mut());
                let payload = if return_value == 0 {
                    EventPayload::None
                } else {
                    let time_info = unsafe { *(return_value as *const VstTimeInfo) };
                    EventPayload::TimeInfo(time_info)
                };
                EventResult {
                    return_value,
                    payload,
                    value_payload: None,
                }
            }
            EventPayload::MidiEvents(batch) => {
                let mut buffer = batch.to_buffer();
                EventResult {
                    return_value: call(buffer.as_ptr() as *mut c_void),
                    payload: EventPayload::None,
                    value_payload: None,
                }
            }
            other => {
                warn!(
                    opcode,
                    "unsupported host callback payload {other:?}, calling with no data"
                );
                EventResult {
                    return_value: call(std::ptr::null_mut()),
                    payload: EventPayload::None,
                    value_payload: None,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Response write-back
    // -----------------------------------------------------------------------

    /// Apply a dispatch response to the host's out-parameters.
    unsafe fn write_back(
        &self,
        opcode: i32,
        data: *mut c_void,
        value: isize,
        response: &EventResult,
    ) {
        use plugin_opcodes::*;

        match opcode {
            // Late-initializing plugins only fill in their descriptor while
            // handling `effOpen`; refresh the host's view.
            OPEN => {
                if let EventPayload::Descriptor(descriptor) = &response.payload {
                    descriptor.apply_to(&mut *self.effect.get());
                }
            }
            EDIT_GET_RECT => {
                // The plugin either produced its editor dimensions or wrote
                // nothing at all.
                if let EventPayload::Rect(rect) = &response.payload {
                    let mut stored = self.editor_rect.lock();
                    *stored = *rect;
                    if !data.is_null() {
                        *(data as *mut *const VstRect) = &*stored as *const VstRect;
                    }
                }
            }
            GET_CHUNK => {
                if let EventPayload::Chunk(bytes) = &response.payload {
                    let mut chunk = self.chunk_data.lock();
                    chunk.clear();
                    chunk.extend_from_slice(bytes);
                    if !data.is_null() {
                        *(data as *mut *const u8) = chunk.as_ptr();
                    }
                }
            }
            GET_SPEAKER_ARRANGEMENT => {
                // The plugin filled in both configurations; write them back
                // through the two pointers the host passed.
                if let EventPayload::SpeakerArrangement(arrangement) = &response.payload {
                    if !data.is_null() {
                        arrangement.write_to(data as *mut VstSpeakerArrangement);
                    }
                }
                if let Some(EventPayload::SpeakerArrangement(arrangement)) =
                    &response.value_payload
                {
                    if value != 0 {
                        arrangement.write_to(value as *mut VstSpeakerArrangement);
                    }
                }
            }
            _ => {
                converter::write_struct_payload(&response.payload, data);
            }
        }
    }
}

impl Drop for Vst2PluginBridge {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);

        // Wake every thread that may be parked in a blocking read, ours and
        // the peer's.
        self.dispatch.shutdown();
        self.dispatch_midi.shutdown();
        self.host_callback_channel.shutdown();
        self.parameters.shutdown();
        self.audio.shutdown();

        if let Some(handle) = self.host_callback_handler.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.group_connect_handler.lock().take() {
            let _ = handle.join();
        }

        if let HostMode::Individual { child } = &self.mode {
            if let Some(child) = child.lock().as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

unsafe fn fill_silence(outputs: *mut *mut f32, num_outputs: usize, frames: usize) {
    for channel in 0..num_outputs {
        let plane = *outputs.add(channel);
        if !plane.is_null() {
            std::ptr::write_bytes(plane, 0, frames);
        }
    }
}

// ---------------------------------------------------------------------------
// Host process launch
// ---------------------------------------------------------------------------

/// Start (or rendezvous with) the plugin host process and return the
/// supervision mode, plus the connect helper thread in group mode.
fn launch_host(
    runtime: &tokio::runtime::Runtime,
    config: &BridgeConfig,
    endpoint: &std::path::Path,
    shutting_down: &Arc<AtomicBool>,
) -> Result<(HostMode, Option<JoinHandle<()>>)> {
    match &config.group {
        None => {
            let child = spawn_host_process(
                runtime,
                &config.host_binary,
                &[
                    config.plugin_path.as_os_str(),
                    endpoint.as_os_str(),
                ],
            )?;
            Ok((
                HostMode::Individual {
                    child: Mutex::new(Some(child)),
                },
                None,
            ))
        }
        Some(group) => {
            let group_endpoint =
                group_endpoint_path(group, config.wine_prefix.as_deref(), config.arch());
            let request = GroupRequest {
                plugin_path: config.plugin_path.clone(),
                endpoint: endpoint.to_path_buf(),
            };

            // First try a group host that is already running.
            if let Ok(pid) = request_group_hosting(&group_endpoint, &request) {
                return Ok((
                    HostMode::Group {
                        pid: Arc::new(AtomicU32::new(pid)),
                    },
                    None,
                ));
            }

            // None answered; spawn one. It detaches and will outlive this
            // instance, so the handle is only kept around while we wait for
            // it to start accepting.
            let mut child =
                spawn_host_process(runtime, &config.host_binary, &[group_endpoint.as_os_str()])?;

            let pid = Arc::new(AtomicU32::new(0));
            let connect_pid = Arc::clone(&pid);
            let stop = Arc::clone(shutting_down);
            let handle = std::thread::Builder::new()
                .name("group-connect".to_string())
                .spawn(move || {
                    // The group host needs a moment to bind its socket; retry
                    // on a short cadence until it answers or dies. If two
                    // instances raced to spawn it, whichever process bound
                    // the socket first answers both requests and the loser
                    // exits on its own.
                    while !stop.load(Ordering::Acquire) {
                        if !matches!(child.try_wait(), Ok(None)) {
                            warn!("the group host exited before accepting our request");
                            return;
                        }
                        if let Ok(pid) = request_group_hosting(&group_endpoint, &request) {
                            connect_pid.store(pid, Ordering::Release);
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(20));
                    }
                })?;

            Ok((HostMode::Group { pid }, Some(handle)))
        }
    }
}

fn request_group_hosting(
    group_endpoint: &std::path::Path,
    request: &GroupRequest,
) -> Result<u32> {
    let mut stream = std::os::unix::net::UnixStream::connect(group_endpoint)?;
    rendezvous::write_group_message(&mut stream, request)?;
    let response: GroupResponse = rendezvous::read_group_message(&mut stream)?;
    Ok(response.pid)
}

/// Spawn the host with its stdout/stderr piped into our log.
fn spawn_host_process(
    runtime: &tokio::runtime::Runtime,
    binary: &std::path::Path,
    args: &[&std::ffi::OsStr],
) -> Result<tokio::process::Child> {
    let _enter = runtime.enter();

    let mut child = tokio::process::Command::new(binary)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|err| BridgeError::StartupFailed {
            reason: format!("could not spawn {}: {err}", binary.display()),
        })?;

    if let Some(stdout) = child.stdout.take() {
        runtime.spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[host stdout] {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        runtime.spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[host stderr] {line}");
            }
        });
    }

    Ok(child)
}

// ---------------------------------------------------------------------------
// Free function trampolines
//
// The plugin API wants plain C function pointers; these recover the bridge
// from the pointer stashed in the `AEffect` and forward.
// ---------------------------------------------------------------------------

unsafe fn bridge_from_effect<'a>(effect: *mut AEffect) -> &'a Vst2PluginBridge {
    &*((*effect).object as *const Vst2PluginBridge)
}

pub(crate) unsafe extern "C" fn dispatch_trampoline(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> isize {
    if effect.is_null() || (*effect).object.is_null() {
        return 0;
    }

    if opcode == plugin_opcodes::CLOSE {
        // The bridge was allocated by the entry point; `effClose` is where
        // it dies. The host must not touch the plugin after this call.
        let bridge = Box::from_raw((*effect).object as *mut Vst2PluginBridge);
        (*effect).object = std::ptr::null_mut();
        return bridge.handle_close(index, value, option);
    }

    bridge_from_effect(effect).dispatch(opcode, index, value, data, option)
}

pub(crate) unsafe extern "C" fn process_trampoline(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    // The accumulating `process` variant goes down the identical path; no
    // host observed in the wild still relies on the accumulate semantics.
    process_replacing_trampoline(effect, inputs, outputs, frames);
}

pub(crate) unsafe extern "C" fn process_replacing_trampoline(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
) {
    if effect.is_null() || (*effect).object.is_null() {
        return;
    }
    bridge_from_effect(effect).process_replacing(inputs, outputs, frames);
}

pub(crate) unsafe extern "C" fn set_parameter_trampoline(
    effect: *mut AEffect,
    index: i32,
    value: f32,
) {
    if effect.is_null() || (*effect).object.is_null() {
        return;
    }
    bridge_from_effect(effect).set_parameter(index, value);
}

pub(crate) unsafe extern "C" fn get_parameter_trampoline(
    effect: *mut AEffect,
    index: i32,
) -> f32 {
    if effect.is_null() || (*effect).object.is_null() {
        return 0.0;
    }
    bridge_from_effect(effect).get_parameter(index)
}
