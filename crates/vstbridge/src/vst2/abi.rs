//! `#[repr(C)]` declarations for the VST2 plugin ABI.
//!
//! The layout follows the reverse engineered `aeffectx.h` header that every
//! open source VST2 host uses. Only the structs and opcodes the bridge
//! actually forwards are declared here.

use std::ffi::c_void;

/// The `AEffect::magic` value, `'VstP'` as a big-endian four character code.
pub const VST_MAGIC: i32 = i32::from_be_bytes(*b"VstP");

/// The VST version the bridge reports for `audioMasterVersion`.
pub const VST_VERSION: isize = 2400;

pub type DispatcherProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    data: *mut c_void,
    option: f32,
) -> isize;

/// The host's `audioMaster` callback. Same shape as the dispatcher, opposite
/// direction.
pub type HostCallbackProc = DispatcherProc;

pub type ProcessProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    frames: i32,
);

pub type SetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32, value: f32);
pub type GetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32) -> f32;

/// The plugin struct a VST2 host sees. The function pointer table is set up
/// once at construction; the data fields are only written when the plugin
/// host sends a new descriptor snapshot.
#[repr(C)]
pub struct AEffect {
    pub magic: i32,
    pub dispatcher: DispatcherProc,
    /// Deprecated accumulating process call. Routed to the same path as
    /// `process_replacing`.
    pub process: ProcessProc,
    pub set_parameter: SetParameterProc,
    pub get_parameter: GetParameterProc,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub ptr1: *mut c_void,
    pub ptr2: *mut c_void,
    pub initial_delay: i32,
    pub empty2: [u8; 8],
    pub io_ratio: f32,
    /// Reserved object pointer. The bridge stores its own instance pointer
    /// here so the free function trampolines can find their way back.
    pub object: *mut c_void,
    pub user: *mut c_void,
    pub unique_id: i32,
    pub version: i32,
    pub process_replacing: ProcessProc,
    pub future: [u8; 60],
}

impl AEffect {
    /// An `AEffect` with the given function pointer table and every data
    /// field zeroed. `magic` stays zero until the first descriptor snapshot
    /// from the plugin host is applied, which is what the pre-init dispatch
    /// guard keys off.
    pub fn inert(
        dispatcher: DispatcherProc,
        process: ProcessProc,
        process_replacing: ProcessProc,
        set_parameter: SetParameterProc,
        get_parameter: GetParameterProc,
    ) -> Self {
        AEffect {
            magic: 0,
            dispatcher,
            process,
            set_parameter,
            get_parameter,
            num_programs: 0,
            num_params: 0,
            num_inputs: 0,
            num_outputs: 0,
            flags: 0,
            ptr1: std::ptr::null_mut(),
            ptr2: std::ptr::null_mut(),
            initial_delay: 0,
            empty2: [0; 8],
            io_ratio: 1.0,
            object: std::ptr::null_mut(),
            user: std::ptr::null_mut(),
            unique_id: 0,
            version: 0,
            process_replacing,
            future: [0; 60],
        }
    }
}

/// Base event record inside a `VstEvents` batch. MIDI events reinterpret the
/// 16 byte data tail; the bridge copies events as plain 32 byte records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VstEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub data: [u8; 16],
}

pub const VST_EVENT_TYPE_MIDI: i32 = 1;

impl VstEvent {
    /// A realtime MIDI event carrying the given status/data bytes.
    pub fn midi(delta_frames: i32, midi_data: [u8; 3]) -> Self {
        let mut data = [0u8; 16];
        data[..3].copy_from_slice(&midi_data);
        VstEvent {
            event_type: VST_EVENT_TYPE_MIDI,
            byte_size: std::mem::size_of::<VstEvent>() as i32,
            delta_frames,
            flags: 0,
            data,
        }
    }
}

/// Header of the packed, variable length `VstEvents` struct. The pointer
/// array nominally has two elements; batches with more events are allocated
/// with extra room behind the header.
#[repr(C)]
pub struct VstEvents {
    pub num_events: i32,
    pub reserved: isize,
    pub events: [*mut VstEvent; 2],
}

/// Editor rectangle returned through `effEditGetRect`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VstRect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

/// Pin properties exchanged through `effGet{Input,Output}Properties`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VstIoProperties {
    pub label: [u8; 64],
    pub flags: i32,
    pub arrangement_type: i32,
    pub short_label: [u8; 8],
    pub future: [u8; 48],
}

impl Default for VstIoProperties {
    fn default() -> Self {
        VstIoProperties {
            label: [0; 64],
            flags: 0,
            arrangement_type: 0,
            short_label: [0; 8],
            future: [0; 48],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VstParameterProperties {
    pub step_float: f32,
    pub small_step_float: f32,
    pub large_step_float: f32,
    pub label: [u8; 64],
    pub flags: i32,
    pub min_integer: i32,
    pub max_integer: i32,
    pub step_integer: i32,
    pub large_step_integer: i32,
    pub short_label: [u8; 8],
    pub display_index: i16,
    pub category: i16,
    pub num_parameters_in_category: i16,
    pub reserved: i16,
    pub category_label: [u8; 24],
    pub future: [u8; 16],
}

impl Default for VstParameterProperties {
    fn default() -> Self {
        VstParameterProperties {
            step_float: 0.0,
            small_step_float: 0.0,
            large_step_float: 0.0,
            label: [0; 64],
            flags: 0,
            min_integer: 0,
            max_integer: 0,
            step_integer: 0,
            large_step_integer: 0,
            short_label: [0; 8],
            display_index: 0,
            category: 0,
            num_parameters_in_category: 0,
            reserved: 0,
            category_label: [0; 24],
            future: [0; 16],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VstMidiKeyName {
    pub this_program_index: i32,
    pub this_key_number: i32,
    pub key_name: [u8; 64],
    pub reserved: i32,
    pub flags: i32,
}

impl Default for VstMidiKeyName {
    fn default() -> Self {
        VstMidiKeyName {
            this_program_index: 0,
            this_key_number: 0,
            key_name: [0; 64],
            reserved: 0,
            flags: 0,
        }
    }
}

/// Transport and tempo information returned by `audioMasterGetTime`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VstTimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub nano_seconds: f64,
    pub ppq_pos: f64,
    pub tempo: f64,
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub smpte_offset: i32,
    pub smpte_frame_rate: i32,
    pub samples_to_next_clock: i32,
    pub flags: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VstSpeakerProperties {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    pub reserved: f32,
    pub name: [u8; 64],
    pub speaker_type: i32,
    pub future: [u8; 28],
}

/// Header of the variable length speaker arrangement struct. `speakers` is a
/// flexible tail with `num_channels` elements.
#[repr(C)]
pub struct VstSpeakerArrangement {
    pub arrangement_type: i32,
    pub num_channels: i32,
    pub speakers: [VstSpeakerProperties; 8],
}

/// Byte offset of the `speakers` tail within `VstSpeakerArrangement`.
pub const SPEAKER_ARRANGEMENT_HEADER_SIZE: usize = 8;

/// Total size in bytes of a speaker arrangement with `num_channels` entries.
pub fn speaker_arrangement_size(num_channels: usize) -> usize {
    SPEAKER_ARRANGEMENT_HEADER_SIZE
        + num_channels * std::mem::size_of::<VstSpeakerProperties>()
}

/// Opcodes a host passes to the plugin's dispatcher.
pub mod plugin_opcodes {
    pub const OPEN: i32 = 0;
    pub const CLOSE: i32 = 1;
    pub const SET_PROGRAM: i32 = 2;
    pub const GET_PROGRAM: i32 = 3;
    pub const SET_PROGRAM_NAME: i32 = 4;
    pub const GET_PROGRAM_NAME: i32 = 5;
    pub const GET_PARAM_LABEL: i32 = 6;
    pub const GET_PARAM_DISPLAY: i32 = 7;
    pub const GET_PARAM_NAME: i32 = 8;
    pub const SET_SAMPLE_RATE: i32 = 10;
    pub const SET_BLOCK_SIZE: i32 = 11;
    pub const MAINS_CHANGED: i32 = 12;
    pub const EDIT_GET_RECT: i32 = 13;
    pub const EDIT_OPEN: i32 = 14;
    pub const EDIT_CLOSE: i32 = 15;
    pub const EDIT_IDLE: i32 = 19;
    pub const GET_CHUNK: i32 = 23;
    pub const SET_CHUNK: i32 = 24;
    pub const PROCESS_EVENTS: i32 = 25;
    pub const CAN_BE_AUTOMATED: i32 = 26;
    pub const STRING_TO_PARAMETER: i32 = 27;
    pub const GET_PROGRAM_NAME_INDEXED: i32 = 29;
    pub const GET_INPUT_PROPERTIES: i32 = 33;
    pub const GET_OUTPUT_PROPERTIES: i32 = 34;
    pub const GET_PLUG_CATEGORY: i32 = 35;
    pub const SET_SPEAKER_ARRANGEMENT: i32 = 42;
    pub const GET_EFFECT_NAME: i32 = 45;
    pub const GET_VENDOR_STRING: i32 = 47;
    pub const GET_PRODUCT_STRING: i32 = 48;
    pub const GET_VENDOR_VERSION: i32 = 49;
    pub const VENDOR_SPECIFIC: i32 = 50;
    pub const CAN_DO: i32 = 51;
    pub const GET_TAIL_SIZE: i32 = 52;
    pub const GET_PARAMETER_PROPERTIES: i32 = 56;
    pub const GET_VST_VERSION: i32 = 58;
    pub const GET_MIDI_KEY_NAME: i32 = 66;
    pub const GET_SPEAKER_ARRANGEMENT: i32 = 69;
    pub const SHELL_GET_NEXT_PLUGIN: i32 = 70;
    pub const START_PROCESS: i32 = 71;
    pub const STOP_PROCESS: i32 = 72;
    pub const SET_PROCESS_PRECISION: i32 = 77;
}

/// Opcodes a plugin passes to the host's `audioMaster` callback.
pub mod host_opcodes {
    pub const AUTOMATE: i32 = 0;
    pub const VERSION: i32 = 1;
    pub const CURRENT_ID: i32 = 2;
    pub const IDLE: i32 = 3;
    pub const WANT_MIDI: i32 = 6;
    pub const GET_TIME: i32 = 7;
    pub const PROCESS_EVENTS: i32 = 8;
    pub const IO_CHANGED: i32 = 13;
    pub const SIZE_WINDOW: i32 = 15;
    pub const GET_SAMPLE_RATE: i32 = 16;
    pub const GET_BLOCK_SIZE: i32 = 17;
    pub const GET_CURRENT_PROCESS_LEVEL: i32 = 23;
    pub const GET_AUTOMATION_STATE: i32 = 24;
    pub const GET_VENDOR_STRING: i32 = 32;
    pub const GET_PRODUCT_STRING: i32 = 33;
    pub const GET_VENDOR_VERSION: i32 = 34;
    pub const CAN_DO: i32 = 37;
    pub const UPDATE_DISPLAY: i32 = 42;
    pub const BEGIN_EDIT: i32 = 43;
    pub const END_EDIT: i32 = 44;
}
