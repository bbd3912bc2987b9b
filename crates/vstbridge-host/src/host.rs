//! The plugin-side mirror of the bridge.
//!
//! After dialing the five channels this module loads the plugin, ships its
//! descriptor, and runs one loop per inbound channel: control dispatch, MIDI
//! dispatch, parameters, and audio. MIDI dispatch gets its own thread
//! because the plugin's message pump blocks the control loop whenever a
//! modal dialog or dropdown is open, and MIDI has to keep flowing through
//! that. Host callbacks made by the plugin travel the other way on their
//! dedicated channel.

use std::cell::Cell;
use std::ffi::{c_void, CString};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, warn};

use vstbridge::channel::EventChannel;
use vstbridge::converter;
use vstbridge::error::Result;
use vstbridge::events::{
    AudioRequest, AudioResponse, DynamicSpeakerArrangement, Event, EventPayload, EventResult,
    Parameter, ParameterResult,
};
use vstbridge::rendezvous::{connect_channels, ChannelSet};
use vstbridge::vst2::abi::{
    plugin_opcodes, speaker_arrangement_size, AEffect, VstIoProperties, VstMidiKeyName,
    VstParameterProperties, VstRect, VstSpeakerArrangement, VstSpeakerProperties, VstTimeInfo,
    VST_VERSION, SPEAKER_ARRANGEMENT_HEADER_SIZE,
};

use crate::plugin::LoadedPlugin;

/// Per-plugin state the host callback trampoline needs to find.
pub struct HostShared {
    pub host_callback_channel: EventChannel,
    /// The last transport info answer. The pointer handed to the plugin
    /// points into this; the plugin API promises it stays valid until the
    /// next query.
    time_info: ArcSwapOption<VstTimeInfo>,
}

thread_local! {
    /// Context for host callbacks made during the plugin's entry point,
    /// before any `AEffect` exists to carry the user slot.
    static LOADING_SHARED: Cell<*const HostShared> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn set_loading_shared(shared: *const HostShared) {
    LOADING_SHARED.with(|cell| cell.set(shared));
}

/// The `audioMaster` implementation handed to the plugin. Forwards across
/// the bridge; the native side reenters the real host.
pub(crate) unsafe extern "C" fn host_callback_trampoline(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> isize {
    let shared = if !effect.is_null() && !(*effect).user.is_null() {
        (*effect).user as *const HostShared
    } else {
        LOADING_SHARED.with(|cell| cell.get())
    };

    if shared.is_null() {
        // A callback with no bridge attached; answer the probe hosts always
        // make and ignore the rest.
        return if opcode == vstbridge::vst2::abi::host_opcodes::VERSION {
            VST_VERSION
        } else {
            0
        };
    }

    (*shared).handle_callback(effect, opcode, index, value, data, option)
}

impl HostShared {
    pub fn new(host_callback_channel: EventChannel) -> Self {
        HostShared {
            host_callback_channel,
            time_info: ArcSwapOption::default(),
        }
    }

    fn handle_callback(
        &self,
        effect: *mut AEffect,
        opcode: i32,
        index: i32,
        value: isize,
        data: *mut c_void,
        option: f32,
    ) -> isize {
        let event = unsafe {
            converter::read_host_callback_event(effect, opcode, index, value, data, option)
        };
        let wants_string = matches!(event.payload, EventPayload::WantsString);

        let response = match self.host_callback_channel.request(&event) {
            Ok(response) => response,
            Err(err) => {
                debug!(opcode, "host callback could not be forwarded: {err}");
                return 0;
            }
        };

        match response.payload {
            // `audioMasterGetTime` answers with a pointer; park the struct
            // so the pointer survives until the next query replaces it.
            EventPayload::TimeInfo(info) => {
                let info = Arc::new(info);
                let pointer = Arc::as_ptr(&info);
                self.time_info.store(Some(info));
                pointer as isize
            }
            EventPayload::String(string) if wants_string => {
                unsafe { converter::write_c_string(data, &string) };
                response.return_value
            }
            _ => response.return_value,
        }
    }
}

/// Host one plugin instance over the given endpoint. Returns when the
/// native side closes the plugin or disappears.
pub fn run(plugin_path: &Path, endpoint: &Path) -> Result<()> {
    info!(
        plugin = %plugin_path.display(),
        endpoint = %endpoint.display(),
        "hosting plugin"
    );

    // Same fixed order as the acceptor on the other side.
    let ChannelSet {
        dispatch,
        dispatch_midi,
        host_callback,
        parameters,
        audio,
    } = connect_channels(endpoint)?;

    let shared = Arc::new(HostShared::new(host_callback));
    let plugin = LoadedPlugin::load(plugin_path, &shared)?;

    // The unsolicited descriptor handshake the native side blocks on.
    dispatch.send_unsolicited(&EventResult {
        return_value: 0,
        payload: EventPayload::Descriptor(plugin.descriptor()),
        value_payload: None,
    })?;

    let closing = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            run_dispatch_loop(&dispatch_midi, &plugin, None);
        });
        scope.spawn(|| {
            run_parameter_loop(&parameters, &plugin);
        });
        scope.spawn(|| {
            run_audio_loop(&audio, &plugin);
        });

        run_dispatch_loop(&dispatch, &plugin, Some(&closing));

        // The control loop is done (close opcode or lost peer); unblock the
        // helpers so the scope can join them.
        dispatch_midi.shutdown();
        parameters.shutdown();
        audio.shutdown();
        shared.host_callback_channel.shutdown();
    });

    info!("plugin released");
    Ok(())
}

/// Serve events from one of the two dispatch channels until the peer goes
/// away, or until `effClose` arrives on the channel watching for it.
fn run_dispatch_loop(channel: &EventChannel, plugin: &LoadedPlugin, closing: Option<&AtomicBool>) {
    loop {
        let result = channel.receive::<Event, _>(|event| {
            if event.opcode == plugin_opcodes::CLOSE {
                if let Some(closing) = closing {
                    closing.store(true, Ordering::Release);
                }
            }
            handle_dispatch_event(plugin, event)
        });

        match result {
            Ok(()) => {
                if closing.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                    return;
                }
            }
            Err(err) => {
                if err.is_disconnect() {
                    debug!(channel = channel.name(), "channel closed, stopping loop");
                } else {
                    error!(channel = channel.name(), "dispatch loop failed: {err}");
                }
                return;
            }
        }
    }
}

fn run_parameter_loop(channel: &EventChannel, plugin: &LoadedPlugin) {
    loop {
        let result = channel.receive::<Parameter, _>(|request| match request.value {
            Some(value) => {
                plugin.set_parameter(request.index, value);
                ParameterResult { value: None }
            }
            None => ParameterResult {
                value: Some(plugin.get_parameter(request.index)),
            },
        });

        if let Err(err) = result {
            if !err.is_disconnect() {
                error!("parameter loop failed: {err}");
            }
            return;
        }
    }
}

fn run_audio_loop(channel: &EventChannel, plugin: &LoadedPlugin) {
    // Planes are reused across blocks; only a block size change reallocates.
    let mut input_planes: Vec<Vec<f32>> = Vec::new();
    let mut response = AudioResponse::default();

    loop {
        let request: AudioRequest = match channel.read_unsolicited() {
            Ok(request) => request,
            Err(err) => {
                if !err.is_disconnect() {
                    error!("audio loop failed: {err}");
                }
                return;
            }
        };

        process_block(plugin, &request, &mut input_planes, &mut response);

        if channel.send_unsolicited(&response).is_err() {
            return;
        }
    }
}

fn process_block(
    plugin: &LoadedPlugin,
    request: &AudioRequest,
    input_planes: &mut Vec<Vec<f32>>,
    response: &mut AudioResponse,
) {
    let frames = request.frames.max(0) as usize;
    let num_inputs = plugin.num_inputs();
    let num_outputs = plugin.num_outputs();

    // The native side sends exactly the plugin's input count, but a silent
    // plane is substituted for anything missing rather than handing the
    // plugin a short array.
    input_planes.resize(num_inputs, Vec::new());
    for (channel, plane) in input_planes.iter_mut().enumerate() {
        match request.inputs.get(channel) {
            Some(data) if data.len() >= frames => {
                plane.clear();
                plane.extend_from_slice(&data[..frames]);
            }
            _ => {
                plane.clear();
                plane.resize(frames, 0.0);
            }
        }
    }

    response.outputs.resize(num_outputs, Vec::new());
    for plane in response.outputs.iter_mut() {
        plane.clear();
        plane.resize(frames, 0.0);
    }

    let input_pointers: Vec<*const f32> =
        input_planes.iter().map(|plane| plane.as_ptr()).collect();
    let mut output_pointers: Vec<*mut f32> = response
        .outputs
        .iter_mut()
        .map(|plane| plane.as_mut_ptr())
        .collect();

    plugin.process_replacing(&input_pointers, &mut output_pointers, frames as i32);
}

/// Replay an event against the plugin's dispatcher, rebuilding whatever
/// pointer its payload stands for, and lift the plugin's answer back into a
/// serializable result. This is the reverse of the converter table applied
/// on the native side.
fn handle_dispatch_event(plugin: &LoadedPlugin, event: Event) -> EventResult {
    use plugin_opcodes::*;

    let Event {
        opcode,
        index,
        value,
        option,
        payload,
        value_payload,
    } = event;

    let simple = |return_value: isize| EventResult {
        return_value,
        payload: EventPayload::None,
        value_payload: None,
    };

    match payload {
        EventPayload::None => simple(plugin.dispatch(opcode, index, value, std::ptr::null_mut(), option)),
        EventPayload::Pointer(pointer) => {
            simple(plugin.dispatch(opcode, index, value, pointer as *mut c_void, option))
        }
        EventPayload::String(string) => {
            let data = CString::new(string).unwrap_or_default();
            simple(plugin.dispatch(opcode, index, value, data.as_ptr() as *mut c_void, option))
        }
        EventPayload::Chunk(bytes) => {
            // `effSetChunk`; the byte length already rode in on `value`.
            simple(plugin.dispatch(opcode, index, value, bytes.as_ptr() as *mut c_void, option))
        }
        EventPayload::MidiEvents(batch) => {
            let mut buffer = batch.to_buffer();
            let return_value =
                plugin.dispatch(opcode, index, value, buffer.as_ptr() as *mut c_void, option);
            // The reconstructed batch lives until here, after the dispatcher
            // returned; plugins must copy events they want to keep.
            simple(return_value)
        }
        EventPayload::WantsString => {
            let mut buffer = [0u8; 512];
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                buffer.as_mut_ptr() as *mut c_void,
                option,
            );
            EventResult {
                return_value,
                payload: EventPayload::String(unsafe {
                    converter::read_c_string(buffer.as_mut_ptr() as *mut c_void)
                }),
                value_payload: None,
            }
        }
        EventPayload::WantsRect => {
            // The plugin writes a pointer to its (usually static) rect into
            // the location the host passed.
            let mut rect_pointer: *const VstRect = std::ptr::null();
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                &mut rect_pointer as *mut *const VstRect as *mut c_void,
                option,
            );
            let payload = if rect_pointer.is_null() {
                EventPayload::None
            } else {
                EventPayload::Rect(unsafe { *rect_pointer })
            };
            EventResult {
                return_value,
                payload,
                value_payload: None,
            }
        }
        EventPayload::WantsDescriptor => {
            let return_value =
                plugin.dispatch(opcode, index, value, std::ptr::null_mut(), option);
            EventResult {
                return_value,
                payload: EventPayload::Descriptor(plugin.descriptor()),
                value_payload: None,
            }
        }
        EventPayload::WantsChunk => {
            let mut chunk_pointer: *const u8 = std::ptr::null();
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                &mut chunk_pointer as *mut *const u8 as *mut c_void,
                option,
            );
            // The dispatcher's return value is the chunk's byte length.
            let payload = if chunk_pointer.is_null() || return_value <= 0 {
                EventPayload::None
            } else {
                let bytes = unsafe {
                    std::slice::from_raw_parts(chunk_pointer, return_value as usize)
                };
                EventPayload::Chunk(bytes.to_vec())
            };
            EventResult {
                return_value,
                payload,
                value_payload: None,
            }
        }
        EventPayload::PortProperties(properties) => {
            let mut copy: VstIoProperties = properties;
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                &mut copy as *mut VstIoProperties as *mut c_void,
                option,
            );
            EventResult {
                return_value,
                payload: EventPayload::PortProperties(copy),
                value_payload: None,
            }
        }
        EventPayload::ParameterProperties(properties) => {
            let mut copy: VstParameterProperties = properties;
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                &mut copy as *mut VstParameterProperties as *mut c_void,
                option,
            );
            EventResult {
                return_value,
                payload: EventPayload::ParameterProperties(copy),
                value_payload: None,
            }
        }
        EventPayload::MidiKeyName(key_name) => {
            let mut copy: VstMidiKeyName = key_name;
            let return_value = plugin.dispatch(
                opcode,
                index,
                value,
                &mut copy as *mut VstMidiKeyName as *mut c_void,
                option,
            );
            EventResult {
                return_value,
                payload: EventPayload::MidiKeyName(copy),
                value_payload: None,
            }
        }
        EventPayload::SpeakerArrangement(arrangement) => {
            // Two buffers: the output configuration travels in `data`, the
            // input configuration in `value`. For the query opcode the
            // plugin overwrites both.
            let mut data_buffer = ArrangementBuffer::new(&arrangement);
            let value_arrangement = match &value_payload {
                Some(EventPayload::SpeakerArrangement(inner)) => inner.clone(),
                _ => DynamicSpeakerArrangement::default(),
            };
            let mut value_buffer = ArrangementBuffer::new(&value_arrangement);

            let return_value = plugin.dispatch(
                opcode,
                index,
                value_buffer.as_mut_ptr() as isize,
                data_buffer.as_mut_ptr() as *mut c_void,
                option,
            );

            if opcode == GET_SPEAKER_ARRANGEMENT {
                EventResult {
                    return_value,
                    payload: EventPayload::SpeakerArrangement(data_buffer.capture()),
                    value_payload: Some(EventPayload::SpeakerArrangement(
                        value_buffer.capture(),
                    )),
                }
            } else {
                simple(return_value)
            }
        }
        other => {
            warn!(
                opcode,
                "unexpected payload {other:?} on the plugin dispatch side, sending no data"
            );
            simple(plugin.dispatch(opcode, index, value, std::ptr::null_mut(), option))
        }
    }
}

/// Pointer-aligned scratch for a `VstSpeakerArrangement` the plugin may
/// read from or write into. Sized for the larger of the incoming data and a
/// full eight speaker struct, so a plugin answering the query has room.
struct ArrangementBuffer {
    storage: Vec<u64>,
}

impl ArrangementBuffer {
    fn new(arrangement: &DynamicSpeakerArrangement) -> Self {
        let size = arrangement
            .as_bytes()
            .len()
            .max(std::mem::size_of::<VstSpeakerArrangement>());
        let mut storage = vec![0u64; size.div_ceil(8)];

        let bytes = arrangement.as_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                storage.as_mut_ptr() as *mut u8,
                bytes.len(),
            );
        }

        ArrangementBuffer { storage }
    }

    fn as_mut_ptr(&mut self) -> *mut VstSpeakerArrangement {
        self.storage.as_mut_ptr() as *mut VstSpeakerArrangement
    }

    /// Lift the (possibly plugin-modified) buffer contents back into the
    /// serializable form.
    fn capture(&mut self) -> DynamicSpeakerArrangement {
        let capacity = self.storage.len() * 8;
        let header = self.storage.as_mut_ptr() as *mut VstSpeakerArrangement;

        // Never read past our own allocation, whatever the plugin wrote
        // into the channel count.
        let declared = unsafe { (*header).num_channels.max(0) } as usize;
        if speaker_arrangement_size(declared) > capacity {
            let fitting = (capacity - SPEAKER_ARRANGEMENT_HEADER_SIZE)
                / std::mem::size_of::<VstSpeakerProperties>();
            warn!(
                declared,
                fitting, "plugin declared more speakers than the buffer holds, truncating"
            );
            unsafe { (*header).num_channels = fitting as i32 };
        }

        unsafe { DynamicSpeakerArrangement::from_raw(header) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrangement_buffer_is_aligned_and_sized() {
        let empty = DynamicSpeakerArrangement::default();
        let mut buffer = ArrangementBuffer::new(&empty);

        let pointer = buffer.as_mut_ptr();
        assert_eq!(pointer as usize % std::mem::align_of::<VstSpeakerArrangement>(), 0);
        assert!(buffer.storage.len() * 8 >= std::mem::size_of::<VstSpeakerArrangement>());
    }

    #[test]
    fn test_arrangement_buffer_roundtrip() {
        let mut raw: VstSpeakerArrangement = unsafe { std::mem::zeroed() };
        raw.arrangement_type = 3;
        raw.num_channels = 2;
        raw.speakers[0].speaker_type = 1;
        raw.speakers[1].speaker_type = 2;
        let arrangement = unsafe { DynamicSpeakerArrangement::from_raw(&raw) };

        let mut buffer = ArrangementBuffer::new(&arrangement);
        let captured = buffer.capture();
        assert_eq!(captured.as_bytes(), arrangement.as_bytes());
    }
}
