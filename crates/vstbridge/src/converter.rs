//! Opcode to payload conversion.
//!
//! The VST2 dispatcher and the host callback both smuggle their real argument
//! through an untyped `void*` whose meaning depends on the opcode. The two
//! tables in this module are the single source of truth for that mapping, one
//! per direction; the plugin host applies them in reverse when it rebuilds
//! the pointer-bearing call on its side.

use std::ffi::{c_void, CStr};

use tracing::warn;

use crate::events::{
    DynamicSpeakerArrangement, DynamicVstEvents, Event, EventPayload, PluginDescriptor,
};
use crate::vst2::abi::{
    host_opcodes, plugin_opcodes, AEffect, VstEvents, VstIoProperties, VstMidiKeyName,
    VstParameterProperties, VstSpeakerArrangement,
};

/// Whether this dispatcher opcode passes a second pointer through the value
/// argument. The speaker arrangement query/set family is the only one that
/// does.
pub fn is_multi_pointer_opcode(opcode: i32) -> bool {
    matches!(
        opcode,
        plugin_opcodes::SET_SPEAKER_ARRANGEMENT | plugin_opcodes::GET_SPEAKER_ARRANGEMENT
    )
}

/// Lower a host-to-plugin `dispatch()` call into an [`Event`].
///
/// # Safety
///
/// `data` and `value` must be whatever the plugin API defines for `opcode`;
/// the caller is the VST2 host, so this is its side of the contract.
pub unsafe fn read_dispatch_event(
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> Event {
    use plugin_opcodes::*;

    let payload = match opcode {
        // Some improperly coded plugins only fill in parts of their
        // descriptor while handling `effOpen`, so the response carries a
        // fresh snapshot.
        OPEN => EventPayload::WantsDescriptor,
        EDIT_GET_RECT => EventPayload::WantsRect,
        // The host passes a platform window handle in the data pointer. The
        // plugin host embeds its own window into it on the other side.
        EDIT_OPEN => EventPayload::Pointer(data as usize),
        GET_CHUNK => EventPayload::WantsChunk,
        SET_CHUNK => {
            let length = value.max(0) as usize;
            let bytes = if data.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(data as *const u8, length).to_vec()
            };
            EventPayload::Chunk(bytes)
        }
        PROCESS_EVENTS => {
            EventPayload::MidiEvents(DynamicVstEvents::from_raw(data as *const VstEvents))
        }
        // The host may have prefilled these structs, so they are copied in
        // both directions instead of sending an empty marker.
        GET_INPUT_PROPERTIES | GET_OUTPUT_PROPERTIES => {
            EventPayload::PortProperties(*(data as *const VstIoProperties))
        }
        GET_PARAMETER_PROPERTIES => {
            EventPayload::ParameterProperties(*(data as *const VstParameterProperties))
        }
        GET_MIDI_KEY_NAME => EventPayload::MidiKeyName(*(data as *const VstMidiKeyName)),
        SET_SPEAKER_ARRANGEMENT | GET_SPEAKER_ARRANGEMENT => EventPayload::SpeakerArrangement(
            DynamicSpeakerArrangement::from_raw(data as *const VstSpeakerArrangement),
        ),
        // Opcodes that hand the plugin an empty string buffer to fill.
        GET_PROGRAM_NAME | GET_PARAM_LABEL | GET_PARAM_DISPLAY | GET_PARAM_NAME
        | GET_PROGRAM_NAME_INDEXED | GET_EFFECT_NAME | GET_VENDOR_STRING | GET_PRODUCT_STRING
        | SHELL_GET_NEXT_PLUGIN => EventPayload::WantsString,
        // Opcodes whose data argument is a C string from the host.
        CAN_DO | SET_PROGRAM_NAME | STRING_TO_PARAMETER => {
            EventPayload::String(read_c_string(data))
        }
        _ => default_payload("dispatch", opcode, data),
    };

    // The speaker arrangement calls pass the input configuration through the
    // value argument at the same time.
    let value_payload = match opcode {
        SET_SPEAKER_ARRANGEMENT | GET_SPEAKER_ARRANGEMENT => {
            Some(EventPayload::SpeakerArrangement(
                DynamicSpeakerArrangement::from_raw(value as *const VstSpeakerArrangement),
            ))
        }
        _ => None,
    };

    Event {
        opcode,
        index,
        value,
        option,
        payload,
        value_payload,
    }
}

/// Lower a plugin-to-host `audioMaster` call into an [`Event`]. Runs on the
/// plugin host side; `effect` is the live plugin struct for callbacks that
/// announce descriptor changes.
///
/// # Safety
///
/// `data` must match the plugin API's contract for `opcode`, and `effect`
/// must point to the loaded plugin's `AEffect`.
pub unsafe fn read_host_callback_event(
    effect: *const AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> Event {
    use host_opcodes::*;

    let payload = match opcode {
        GET_TIME => EventPayload::WantsTimeInfo,
        PROCESS_EVENTS => {
            EventPayload::MidiEvents(DynamicVstEvents::from_raw(data as *const VstEvents))
        }
        // The plugin changed its IO layout; ship a fresh descriptor snapshot
        // so the native side can update the struct the host sees before the
        // callback reaches it.
        IO_CHANGED if !effect.is_null() => {
            EventPayload::Descriptor(PluginDescriptor::from_effect(&*effect))
        }
        CAN_DO => EventPayload::String(read_c_string(data)),
        // The plugin hands the host an empty buffer to fill with its
        // identity strings.
        GET_VENDOR_STRING | GET_PRODUCT_STRING => EventPayload::WantsString,
        _ => default_payload("host callback", opcode, data),
    };

    Event {
        opcode,
        index,
        value,
        option,
        payload,
        value_payload: None,
    }
}

/// The fallback rule: a null pointer carries nothing, anything else is read
/// as a C string. Hosts zero their buffers, so for unknown opcodes this is
/// the least bad interpretation; it gets logged so misbehaving plugins can
/// be diagnosed.
unsafe fn default_payload(direction: &'static str, opcode: i32, data: *mut c_void) -> EventPayload {
    if data.is_null() {
        EventPayload::None
    } else {
        warn!(
            opcode,
            "unknown {direction} opcode with a data pointer, reading it as a C string"
        );
        EventPayload::String(read_c_string(data))
    }
}

/// Read a NUL terminated string out of an event data pointer.
///
/// # Safety
///
/// `data` must be null or point to a NUL terminated buffer.
pub unsafe fn read_c_string(data: *mut c_void) -> String {
    if data.is_null() {
        return String::new();
    }
    CStr::from_ptr(data as *const std::ffi::c_char)
        .to_string_lossy()
        .into_owned()
}

/// Copy a response string into the buffer a caller passed with a `Wants*`
/// marker, NUL terminated.
///
/// # Safety
///
/// `data` must be null or point to a writable buffer of at least
/// `string.len() + 1` bytes. The plugin API sizes these buffers generously
/// relative to the strings plugins produce.
pub unsafe fn write_c_string(data: *mut c_void, string: &str) {
    if data.is_null() {
        return;
    }
    let target = data as *mut u8;
    std::ptr::copy_nonoverlapping(string.as_ptr(), target, string.len());
    *target.add(string.len()) = 0;
}

/// Write a fixed-size struct payload back into the caller's out-parameter.
/// Returns false for payload kinds that need special handling (chunks,
/// rects, descriptors, speaker arrangements).
///
/// # Safety
///
/// `data` must point to a writable struct of the kind the payload carries.
pub unsafe fn write_struct_payload(payload: &EventPayload, data: *mut c_void) -> bool {
    if data.is_null() {
        return false;
    }

    match payload {
        EventPayload::PortProperties(properties) => {
            *(data as *mut VstIoProperties) = *properties;
            true
        }
        EventPayload::ParameterProperties(properties) => {
            *(data as *mut VstParameterProperties) = *properties;
            true
        }
        EventPayload::MidiKeyName(key_name) => {
            *(data as *mut VstMidiKeyName) = *key_name;
            true
        }
        EventPayload::String(string) => {
            write_c_string(data, string);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vst2::abi::VstEvent;

    #[test]
    fn test_multi_pointer_set() {
        assert!(is_multi_pointer_opcode(
            plugin_opcodes::SET_SPEAKER_ARRANGEMENT
        ));
        assert!(is_multi_pointer_opcode(
            plugin_opcodes::GET_SPEAKER_ARRANGEMENT
        ));
        assert!(!is_multi_pointer_opcode(plugin_opcodes::PROCESS_EVENTS));
        assert!(!is_multi_pointer_opcode(plugin_opcodes::CAN_DO));
    }

    #[test]
    fn test_value_payload_present_iff_multi_pointer() {
        for opcode in [
            plugin_opcodes::OPEN,
            plugin_opcodes::EDIT_GET_RECT,
            plugin_opcodes::GET_CHUNK,
            plugin_opcodes::CAN_BE_AUTOMATED,
            plugin_opcodes::SET_SPEAKER_ARRANGEMENT,
            plugin_opcodes::GET_SPEAKER_ARRANGEMENT,
        ] {
            // Speaker arrangement opcodes dereference their pointers, so
            // hand them real structs.
            let arrangement = VstSpeakerArrangement {
                arrangement_type: 0,
                num_channels: 0,
                speakers: unsafe { std::mem::zeroed() },
            };
            let (value, data) = if is_multi_pointer_opcode(opcode) {
                (
                    &arrangement as *const _ as isize,
                    &arrangement as *const _ as *mut c_void,
                )
            } else {
                (0, std::ptr::null_mut())
            };

            let event = unsafe { read_dispatch_event(opcode, 0, value, data, 0.0) };
            assert_eq!(
                event.value_payload.is_some(),
                is_multi_pointer_opcode(opcode),
                "value payload mismatch for opcode {opcode}"
            );
        }
    }

    #[test]
    fn test_dispatch_string_query() {
        let query = c"hasCockosViewAsConfig";
        let event = unsafe {
            read_dispatch_event(
                plugin_opcodes::CAN_DO,
                0,
                0,
                query.as_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(
            event.payload,
            EventPayload::String("hasCockosViewAsConfig".to_string())
        );
    }

    #[test]
    fn test_dispatch_chunk_copies_value_bytes() {
        let chunk = [1u8, 2, 3, 4, 5];
        let event = unsafe {
            read_dispatch_event(
                plugin_opcodes::SET_CHUNK,
                0,
                chunk.len() as isize,
                chunk.as_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::Chunk(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_dispatch_markers() {
        let cases = [
            (plugin_opcodes::OPEN, EventPayload::WantsDescriptor),
            (plugin_opcodes::EDIT_GET_RECT, EventPayload::WantsRect),
            (plugin_opcodes::GET_CHUNK, EventPayload::WantsChunk),
            (plugin_opcodes::GET_EFFECT_NAME, EventPayload::WantsString),
            (plugin_opcodes::GET_PROGRAM_NAME, EventPayload::WantsString),
        ];
        for (opcode, expected) in cases {
            let event =
                unsafe { read_dispatch_event(opcode, 0, 0, std::ptr::null_mut(), 0.0) };
            assert_eq!(event.payload, expected, "opcode {opcode}");
        }
    }

    #[test]
    fn test_dispatch_edit_open_window_handle() {
        let handle = 0x00C0_FFEE_usize;
        let event = unsafe {
            read_dispatch_event(
                plugin_opcodes::EDIT_OPEN,
                0,
                0,
                handle as *mut c_void,
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::Pointer(handle));
    }

    #[test]
    fn test_dispatch_midi_events() {
        let mut batch = DynamicVstEvents::default();
        batch.events.push(VstEvent::midi(0, [0x90, 60, 100]));
        let mut buffer = batch.to_buffer();

        let event = unsafe {
            read_dispatch_event(
                plugin_opcodes::PROCESS_EVENTS,
                0,
                0,
                buffer.as_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::MidiEvents(batch));
    }

    #[test]
    fn test_unknown_opcode_null_data() {
        let event =
            unsafe { read_dispatch_event(plugin_opcodes::MAINS_CHANGED, 0, 1, std::ptr::null_mut(), 0.0) };
        assert_eq!(event.payload, EventPayload::None);
        assert_eq!(event.value, 1);
    }

    #[test]
    fn test_unknown_opcode_with_data_reads_c_string() {
        let text = c"some opaque data";
        // 9999 is not a known opcode in either direction.
        let event = unsafe {
            read_dispatch_event(9999, 0, 0, text.as_ptr() as *mut c_void, 0.0)
        };
        assert_eq!(
            event.payload,
            EventPayload::String("some opaque data".to_string())
        );
    }

    #[test]
    fn test_host_callback_get_time() {
        let event = unsafe {
            read_host_callback_event(
                std::ptr::null(),
                host_opcodes::GET_TIME,
                0,
                0,
                std::ptr::null_mut(),
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::WantsTimeInfo);
    }

    #[test]
    fn test_host_callback_midi_events() {
        let mut batch = DynamicVstEvents::default();
        batch.events.push(VstEvent::midi(3, [0x90, 72, 90]));
        let mut buffer = batch.to_buffer();

        let event = unsafe {
            read_host_callback_event(
                std::ptr::null(),
                host_opcodes::PROCESS_EVENTS,
                0,
                0,
                buffer.as_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(event.payload, EventPayload::MidiEvents(batch));
    }

    #[test]
    fn test_write_c_string_nul_terminates() {
        let mut buffer = [0xFFu8; 32];
        unsafe { write_c_string(buffer.as_mut_ptr() as *mut c_void, "GainPlugin") };
        assert_eq!(&buffer[..10], b"GainPlugin");
        assert_eq!(buffer[10], 0);
    }

    #[test]
    fn test_write_struct_payload() {
        let mut properties = VstIoProperties::default();
        properties.label[..2].copy_from_slice(b"In");
        properties.flags = 1;

        let mut target = VstIoProperties::default();
        let written = unsafe {
            write_struct_payload(
                &EventPayload::PortProperties(properties),
                &mut target as *mut _ as *mut c_void,
            )
        };
        assert!(written);
        assert_eq!(target, properties);

        // Chunks need the bridge's owned buffer, not a blind struct copy.
        let written = unsafe {
            write_struct_payload(
                &EventPayload::Chunk(vec![1, 2, 3]),
                &mut target as *mut _ as *mut c_void,
            )
        };
        assert!(!written);
    }
}
