//! The event model the bridge channels carry.
//!
//! Everything a host and a plugin exchange through the VST2 C API is lowered
//! into one of the owned, serializable types in this module, sent across a
//! channel, and reconstructed into the pointer-bearing C representation on
//! the other side.

use std::io::{Read, Write};

use smallvec::SmallVec;

use crate::codec::{self, CodecError, Decode, Encode, Message};
use crate::vst2::abi::{
    speaker_arrangement_size, AEffect, VstEvent, VstEvents, VstIoProperties, VstMidiKeyName,
    VstParameterProperties, VstRect, VstSpeakerArrangement, VstTimeInfo,
    SPEAKER_ARRANGEMENT_HEADER_SIZE,
};

/// A control event sent through `dispatch` (host to plugin) or the host
/// callback (plugin to host).
///
/// `value_payload` is only used by the speaker arrangement opcode family,
/// the one call in the API that passes two pointers at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub opcode: i32,
    pub index: i32,
    pub value: isize,
    pub option: f32,
    pub payload: EventPayload,
    pub value_payload: Option<EventPayload>,
}

impl Message for Event {
    type Response = EventResult;
}

/// The result of a dispatched [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventResult {
    pub return_value: isize,
    pub payload: EventPayload,
    pub value_payload: Option<EventPayload>,
}

/// The data pointer argument of an event, lowered to an owned value.
///
/// The `Wants*` variants are request markers: they tell the receiving side
/// that the caller passed a writable out-parameter, and the matching response
/// carries the filled-in value (or `None` when the plugin wrote nothing).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// Raw chunk bytes (`effSetChunk`, and `effGetChunk` responses).
    Chunk(Vec<u8>),
    String(String),
    /// A raw pointer-sized value passed through as-is. Used for the X11
    /// window handle the host hands to `effEditOpen`.
    Pointer(usize),
    WantsString,
    WantsRect,
    WantsDescriptor,
    WantsChunk,
    WantsTimeInfo,
    Rect(VstRect),
    TimeInfo(VstTimeInfo),
    Descriptor(PluginDescriptor),
    PortProperties(VstIoProperties),
    ParameterProperties(VstParameterProperties),
    MidiKeyName(VstMidiKeyName),
    SpeakerArrangement(DynamicSpeakerArrangement),
    MidiEvents(DynamicVstEvents),
}

mod payload_tags {
    pub const NONE: u8 = 0;
    pub const CHUNK: u8 = 1;
    pub const STRING: u8 = 2;
    pub const POINTER: u8 = 3;
    pub const WANTS_STRING: u8 = 4;
    pub const WANTS_RECT: u8 = 5;
    pub const WANTS_DESCRIPTOR: u8 = 6;
    pub const WANTS_CHUNK: u8 = 7;
    pub const WANTS_TIME_INFO: u8 = 8;
    pub const RECT: u8 = 9;
    pub const TIME_INFO: u8 = 10;
    pub const DESCRIPTOR: u8 = 11;
    pub const PORT_PROPERTIES: u8 = 12;
    pub const PARAMETER_PROPERTIES: u8 = 13;
    pub const MIDI_KEY_NAME: u8 = 14;
    pub const SPEAKER_ARRANGEMENT: u8 = 15;
    pub const MIDI_EVENTS: u8 = 16;
}

impl Encode for EventPayload {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        use payload_tags::*;

        match self {
            EventPayload::None => NONE.encode(writer),
            EventPayload::Chunk(bytes) => {
                CHUNK.encode(writer)?;
                codec::write_bytes(writer, bytes)
            }
            EventPayload::String(string) => {
                STRING.encode(writer)?;
                string.encode(writer)
            }
            EventPayload::Pointer(value) => {
                POINTER.encode(writer)?;
                value.encode(writer)
            }
            EventPayload::WantsString => WANTS_STRING.encode(writer),
            EventPayload::WantsRect => WANTS_RECT.encode(writer),
            EventPayload::WantsDescriptor => WANTS_DESCRIPTOR.encode(writer),
            EventPayload::WantsChunk => WANTS_CHUNK.encode(writer),
            EventPayload::WantsTimeInfo => WANTS_TIME_INFO.encode(writer),
            EventPayload::Rect(rect) => {
                RECT.encode(writer)?;
                rect.encode(writer)
            }
            EventPayload::TimeInfo(time_info) => {
                TIME_INFO.encode(writer)?;
                time_info.encode(writer)
            }
            EventPayload::Descriptor(descriptor) => {
                DESCRIPTOR.encode(writer)?;
                descriptor.encode(writer)
            }
            EventPayload::PortProperties(properties) => {
                PORT_PROPERTIES.encode(writer)?;
                properties.encode(writer)
            }
            EventPayload::ParameterProperties(properties) => {
                PARAMETER_PROPERTIES.encode(writer)?;
                properties.encode(writer)
            }
            EventPayload::MidiKeyName(key_name) => {
                MIDI_KEY_NAME.encode(writer)?;
                key_name.encode(writer)
            }
            EventPayload::SpeakerArrangement(arrangement) => {
                SPEAKER_ARRANGEMENT.encode(writer)?;
                arrangement.encode(writer)
            }
            EventPayload::MidiEvents(events) => {
                MIDI_EVENTS.encode(writer)?;
                events.encode(writer)
            }
        }
    }
}

impl Decode for EventPayload {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        use payload_tags::*;

        Ok(match u8::decode(reader)? {
            NONE => EventPayload::None,
            CHUNK => EventPayload::Chunk(codec::read_bytes(reader)?),
            STRING => EventPayload::String(String::decode(reader)?),
            POINTER => EventPayload::Pointer(usize::decode(reader)?),
            WANTS_STRING => EventPayload::WantsString,
            WANTS_RECT => EventPayload::WantsRect,
            WANTS_DESCRIPTOR => EventPayload::WantsDescriptor,
            WANTS_CHUNK => EventPayload::WantsChunk,
            WANTS_TIME_INFO => EventPayload::WantsTimeInfo,
            RECT => EventPayload::Rect(VstRect::decode(reader)?),
            TIME_INFO => EventPayload::TimeInfo(VstTimeInfo::decode(reader)?),
            DESCRIPTOR => EventPayload::Descriptor(PluginDescriptor::decode(reader)?),
            PORT_PROPERTIES => EventPayload::PortProperties(VstIoProperties::decode(reader)?),
            PARAMETER_PROPERTIES => {
                EventPayload::ParameterProperties(VstParameterProperties::decode(reader)?)
            }
            MIDI_KEY_NAME => EventPayload::MidiKeyName(VstMidiKeyName::decode(reader)?),
            SPEAKER_ARRANGEMENT => {
                EventPayload::SpeakerArrangement(DynamicSpeakerArrangement::decode(reader)?)
            }
            MIDI_EVENTS => EventPayload::MidiEvents(DynamicVstEvents::decode(reader)?),
            tag => {
                return Err(CodecError::BadTag {
                    type_name: "EventPayload",
                    tag,
                })
            }
        })
    }
}

impl Encode for Event {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.opcode.encode(writer)?;
        self.index.encode(writer)?;
        self.value.encode(writer)?;
        self.option.encode(writer)?;
        self.payload.encode(writer)?;
        self.value_payload.encode(writer)
    }
}

impl Decode for Event {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(Event {
            opcode: i32::decode(reader)?,
            index: i32::decode(reader)?,
            value: isize::decode(reader)?,
            option: f32::decode(reader)?,
            payload: EventPayload::decode(reader)?,
            value_payload: Option::decode(reader)?,
        })
    }
}

impl Encode for EventResult {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.return_value.encode(writer)?;
        self.payload.encode(writer)?;
        self.value_payload.encode(writer)
    }
}

impl Decode for EventResult {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(EventResult {
            return_value: isize::decode(reader)?,
            payload: EventPayload::decode(reader)?,
            value_payload: Option::decode(reader)?,
        })
    }
}

/// A `getParameter`/`setParameter` request. An absent value means "get"; a
/// present value means "set".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parameter {
    pub index: i32,
    pub value: Option<f32>,
}

impl Message for Parameter {
    type Response = ParameterResult;
}

/// Mirrors the request: a value for "get", empty acknowledgement for "set".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterResult {
    pub value: Option<f32>,
}

impl Encode for Parameter {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.index.encode(writer)?;
        self.value.encode(writer)
    }
}

impl Decode for Parameter {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(Parameter {
            index: i32::decode(reader)?,
            value: Option::decode(reader)?,
        })
    }
}

impl Encode for ParameterResult {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.value.encode(writer)
    }
}

impl Decode for ParameterResult {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(ParameterResult {
            value: Option::decode(reader)?,
        })
    }
}

/// One block of input audio, `num_inputs` planes of `frames` samples each.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioRequest {
    pub inputs: Vec<Vec<f32>>,
    pub frames: i32,
}

impl Message for AudioRequest {
    type Response = AudioResponse;
}

/// The processed block, `num_outputs` planes of `frames` samples each.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioResponse {
    pub outputs: Vec<Vec<f32>>,
}

impl Encode for AudioRequest {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.inputs.encode(writer)?;
        self.frames.encode(writer)
    }
}

impl Decode for AudioRequest {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(AudioRequest {
            inputs: Vec::decode(reader)?,
            frames: i32::decode(reader)?,
        })
    }
}

impl Encode for AudioResponse {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.outputs.encode(writer)
    }
}

impl Decode for AudioResponse {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(AudioResponse {
            outputs: Vec::decode(reader)?,
        })
    }
}

/// Serializable snapshot of the data fields of an `AEffect`.
///
/// The plugin host sends one of these after loading the plugin and again
/// whenever the plugin changes its own descriptor (some plugins only finish
/// initializing in response to `effOpen`, or announce IO changes through
/// `audioMasterIOChanged`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginDescriptor {
    pub magic: i32,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

impl PluginDescriptor {
    pub fn from_effect(effect: &AEffect) -> Self {
        PluginDescriptor {
            magic: effect.magic,
            num_programs: effect.num_programs,
            num_params: effect.num_params,
            num_inputs: effect.num_inputs,
            num_outputs: effect.num_outputs,
            flags: effect.flags,
            initial_delay: effect.initial_delay,
            unique_id: effect.unique_id,
            version: effect.version,
        }
    }

    /// Copy the snapshot into the host-visible struct. Only data fields are
    /// written; the function pointer table and the instance pointer stay
    /// untouched.
    pub fn apply_to(&self, effect: &mut AEffect) {
        effect.magic = self.magic;
        effect.num_programs = self.num_programs;
        effect.num_params = self.num_params;
        effect.num_inputs = self.num_inputs;
        effect.num_outputs = self.num_outputs;
        effect.flags = self.flags;
        effect.initial_delay = self.initial_delay;
        effect.unique_id = self.unique_id;
        effect.version = self.version;
    }
}

impl Encode for PluginDescriptor {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.magic.encode(writer)?;
        self.num_programs.encode(writer)?;
        self.num_params.encode(writer)?;
        self.num_inputs.encode(writer)?;
        self.num_outputs.encode(writer)?;
        self.flags.encode(writer)?;
        self.initial_delay.encode(writer)?;
        self.unique_id.encode(writer)?;
        self.version.encode(writer)
    }
}

impl Decode for PluginDescriptor {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(PluginDescriptor {
            magic: i32::decode(reader)?,
            num_programs: i32::decode(reader)?,
            num_params: i32::decode(reader)?,
            num_inputs: i32::decode(reader)?,
            num_outputs: i32::decode(reader)?,
            flags: i32::decode(reader)?,
            initial_delay: i32::decode(reader)?,
            unique_id: i32::decode(reader)?,
            version: i32::decode(reader)?,
        })
    }
}

/// A batch of MIDI events lifted out of the packed `VstEvents` C struct.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicVstEvents {
    pub events: SmallVec<[VstEvent; 32]>,
}

impl DynamicVstEvents {
    /// Copy a plugin-API event batch out of its packed C representation.
    ///
    /// # Safety
    ///
    /// `events` must point to a valid `VstEvents` struct whose pointer array
    /// holds `num_events` valid event pointers. Only the 32 byte base record
    /// of each event is copied; SysEx events carry their payload behind
    /// another pointer which does not survive the bridge.
    pub unsafe fn from_raw(events: *const VstEvents) -> Self {
        let count = (*events).num_events.max(0) as usize;
        let slots =
            (events as *const u8).add(std::mem::offset_of!(VstEvents, events))
                as *const *const VstEvent;

        let mut batch = SmallVec::with_capacity(count);
        for i in 0..count {
            let event = *slots.add(i);
            if !event.is_null() {
                batch.push(*event);
            }
        }

        DynamicVstEvents { events: batch }
    }

    /// Rebuild the packed C representation. The returned buffer owns the
    /// storage; the pointer it hands out stays valid until the buffer is
    /// dropped.
    pub fn to_buffer(&self) -> VstEventsBuffer {
        VstEventsBuffer::new(&self.events)
    }
}

impl Encode for DynamicVstEvents {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.events.encode(writer)
    }
}

impl Decode for DynamicVstEvents {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(DynamicVstEvents {
            events: SmallVec::decode(reader)?,
        })
    }
}

/// Owned storage for a reconstructed `VstEvents` struct.
///
/// `VstEvents` is a header followed by a flexible pointer array, so batches
/// with more than two events need more room than the nominal struct size.
/// The header is built inside a `u64` buffer to satisfy the struct's
/// pointer alignment.
pub struct VstEventsBuffer {
    events: Vec<VstEvent>,
    storage: Vec<u64>,
}

impl VstEventsBuffer {
    fn new(batch: &[VstEvent]) -> Self {
        let mut events = batch.to_vec();

        let slots_offset = std::mem::offset_of!(VstEvents, events);
        let needed = slots_offset + events.len() * std::mem::size_of::<*mut VstEvent>();
        let alloc_size = needed.max(std::mem::size_of::<VstEvents>());
        let mut storage = vec![0u64; alloc_size.div_ceil(8)];

        unsafe {
            let base = storage.as_mut_ptr() as *mut u8;
            let header = &mut *(base as *mut VstEvents);
            header.num_events = events.len() as i32;
            header.reserved = 0;

            let slots = base.add(slots_offset) as *mut *mut VstEvent;
            for (i, event) in events.iter_mut().enumerate() {
                *slots.add(i) = event as *mut VstEvent;
            }
        }

        VstEventsBuffer { events, storage }
    }

    pub fn as_ptr(&mut self) -> *mut VstEvents {
        self.storage.as_mut_ptr() as *mut VstEvents
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A speaker arrangement captured as raw bytes.
///
/// `VstSpeakerArrangement` is a header plus a variable length tail of channel
/// descriptors, so it is carried with an explicit byte length and written
/// back verbatim, which round-trips the dynamic tail exactly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicSpeakerArrangement {
    data: Vec<u8>,
}

impl DynamicSpeakerArrangement {
    /// Copy an arrangement out of the C struct, header plus however many
    /// channel descriptors it declares.
    ///
    /// # Safety
    ///
    /// `arrangement` must point to a valid `VstSpeakerArrangement` whose
    /// allocation covers `num_channels` speaker descriptors.
    pub unsafe fn from_raw(arrangement: *const VstSpeakerArrangement) -> Self {
        let num_channels = (*arrangement).num_channels.max(0) as usize;
        let size = speaker_arrangement_size(num_channels);

        let mut data = vec![0u8; size];
        std::ptr::copy_nonoverlapping(arrangement as *const u8, data.as_mut_ptr(), size);

        DynamicSpeakerArrangement { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn arrangement_type(&self) -> i32 {
        self.header_field(0)
    }

    pub fn num_channels(&self) -> i32 {
        self.header_field(4)
    }

    fn header_field(&self, offset: usize) -> i32 {
        match self.data.get(offset..offset + 4) {
            Some(bytes) => i32::from_le_bytes(bytes.try_into().unwrap_or_default()),
            None => 0,
        }
    }

    /// Write the arrangement back into a caller-provided struct.
    ///
    /// # Safety
    ///
    /// `target` must point to an allocation at least `self.as_bytes().len()`
    /// bytes large.
    pub unsafe fn write_to(&self, target: *mut VstSpeakerArrangement) {
        std::ptr::copy_nonoverlapping(self.data.as_ptr(), target as *mut u8, self.data.len());
    }
}

impl Encode for DynamicSpeakerArrangement {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        codec::write_bytes(writer, &self.data)
    }
}

impl Decode for DynamicSpeakerArrangement {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        let data = codec::read_bytes(reader)?;
        if !data.is_empty() && data.len() < SPEAKER_ARRANGEMENT_HEADER_SIZE {
            return Err(CodecError::Truncated);
        }
        Ok(DynamicSpeakerArrangement { data })
    }
}

impl Encode for VstRect {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.top.encode(writer)?;
        self.left.encode(writer)?;
        self.bottom.encode(writer)?;
        self.right.encode(writer)
    }
}

impl Decode for VstRect {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstRect {
            top: i16::decode(reader)?,
            left: i16::decode(reader)?,
            bottom: i16::decode(reader)?,
            right: i16::decode(reader)?,
        })
    }
}

impl Encode for VstIoProperties {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.label.encode(writer)?;
        self.flags.encode(writer)?;
        self.arrangement_type.encode(writer)?;
        self.short_label.encode(writer)?;
        self.future.encode(writer)
    }
}

impl Decode for VstIoProperties {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstIoProperties {
            label: <[u8; 64]>::decode(reader)?,
            flags: i32::decode(reader)?,
            arrangement_type: i32::decode(reader)?,
            short_label: <[u8; 8]>::decode(reader)?,
            future: <[u8; 48]>::decode(reader)?,
        })
    }
}

impl Encode for VstParameterProperties {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.step_float.encode(writer)?;
        self.small_step_float.encode(writer)?;
        self.large_step_float.encode(writer)?;
        self.label.encode(writer)?;
        self.flags.encode(writer)?;
        self.min_integer.encode(writer)?;
        self.max_integer.encode(writer)?;
        self.step_integer.encode(writer)?;
        self.large_step_integer.encode(writer)?;
        self.short_label.encode(writer)?;
        self.display_index.encode(writer)?;
        self.category.encode(writer)?;
        self.num_parameters_in_category.encode(writer)?;
        self.reserved.encode(writer)?;
        self.category_label.encode(writer)?;
        self.future.encode(writer)
    }
}

impl Decode for VstParameterProperties {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstParameterProperties {
            step_float: f32::decode(reader)?,
            small_step_float: f32::decode(reader)?,
            large_step_float: f32::decode(reader)?,
            label: <[u8; 64]>::decode(reader)?,
            flags: i32::decode(reader)?,
            min_integer: i32::decode(reader)?,
            max_integer: i32::decode(reader)?,
            step_integer: i32::decode(reader)?,
            large_step_integer: i32::decode(reader)?,
            short_label: <[u8; 8]>::decode(reader)?,
            display_index: i16::decode(reader)?,
            category: i16::decode(reader)?,
            num_parameters_in_category: i16::decode(reader)?,
            reserved: i16::decode(reader)?,
            category_label: <[u8; 24]>::decode(reader)?,
            future: <[u8; 16]>::decode(reader)?,
        })
    }
}

impl Encode for VstMidiKeyName {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.this_program_index.encode(writer)?;
        self.this_key_number.encode(writer)?;
        self.key_name.encode(writer)?;
        self.reserved.encode(writer)?;
        self.flags.encode(writer)
    }
}

impl Decode for VstMidiKeyName {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstMidiKeyName {
            this_program_index: i32::decode(reader)?,
            this_key_number: i32::decode(reader)?,
            key_name: <[u8; 64]>::decode(reader)?,
            reserved: i32::decode(reader)?,
            flags: i32::decode(reader)?,
        })
    }
}

impl Encode for VstTimeInfo {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.sample_pos.encode(writer)?;
        self.sample_rate.encode(writer)?;
        self.nano_seconds.encode(writer)?;
        self.ppq_pos.encode(writer)?;
        self.tempo.encode(writer)?;
        self.bar_start_pos.encode(writer)?;
        self.cycle_start_pos.encode(writer)?;
        self.cycle_end_pos.encode(writer)?;
        self.time_sig_numerator.encode(writer)?;
        self.time_sig_denominator.encode(writer)?;
        self.smpte_offset.encode(writer)?;
        self.smpte_frame_rate.encode(writer)?;
        self.samples_to_next_clock.encode(writer)?;
        self.flags.encode(writer)
    }
}

impl Decode for VstTimeInfo {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstTimeInfo {
            sample_pos: f64::decode(reader)?,
            sample_rate: f64::decode(reader)?,
            nano_seconds: f64::decode(reader)?,
            ppq_pos: f64::decode(reader)?,
            tempo: f64::decode(reader)?,
            bar_start_pos: f64::decode(reader)?,
            cycle_start_pos: f64::decode(reader)?,
            cycle_end_pos: f64::decode(reader)?,
            time_sig_numerator: i32::decode(reader)?,
            time_sig_denominator: i32::decode(reader)?,
            smpte_offset: i32::decode(reader)?,
            smpte_frame_rate: i32::decode(reader)?,
            samples_to_next_clock: i32::decode(reader)?,
            flags: i32::decode(reader)?,
        })
    }
}

impl Encode for VstEvent {
    fn encode<W: Write>(&self, writer: &mut W) -> codec::Result<()> {
        self.event_type.encode(writer)?;
        self.byte_size.encode(writer)?;
        self.delta_frames.encode(writer)?;
        self.flags.encode(writer)?;
        self.data.encode(writer)
    }
}

impl Decode for VstEvent {
    fn decode<R: Read>(reader: &mut R) -> codec::Result<Self> {
        Ok(VstEvent {
            event_type: i32::decode(reader)?,
            byte_size: i32::decode(reader)?,
            delta_frames: i32::decode(reader)?,
            flags: i32::decode(reader)?,
            data: <[u8; 16]>::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vst2::abi::{plugin_opcodes, VstSpeakerProperties};

    fn roundtrip<T: Encode + Decode>(value: &T) -> T {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        let mut cursor = buf.as_slice();
        let decoded = T::decode(&mut cursor).unwrap();
        assert!(cursor.is_empty(), "decode left {} trailing bytes", cursor.len());
        decoded
    }

    fn stereo_arrangement() -> DynamicSpeakerArrangement {
        let mut raw = VstSpeakerArrangement {
            arrangement_type: 1,
            num_channels: 2,
            speakers: [VstSpeakerProperties {
                azimuth: 0.0,
                elevation: 0.0,
                radius: 1.0,
                reserved: 0.0,
                name: [0; 64],
                speaker_type: 0,
                future: [0; 28],
            }; 8],
        };
        raw.speakers[0].name[0] = b'L';
        raw.speakers[0].speaker_type = 1;
        raw.speakers[1].name[0] = b'R';
        raw.speakers[1].speaker_type = 2;

        unsafe { DynamicSpeakerArrangement::from_raw(&raw) }
    }

    // -----------------------------------------------------------------------
    // Round trips, one per message type
    // -----------------------------------------------------------------------

    #[test]
    fn test_event_roundtrip() {
        let event = Event {
            opcode: plugin_opcodes::SET_CHUNK,
            index: 0,
            value: 4,
            option: 0.0,
            payload: EventPayload::Chunk(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            value_payload: None,
        };
        assert_eq!(roundtrip(&event), event);
    }

    #[test]
    fn test_event_with_value_payload_roundtrip() {
        let event = Event {
            opcode: plugin_opcodes::GET_SPEAKER_ARRANGEMENT,
            index: 0,
            value: 0,
            option: 0.0,
            payload: EventPayload::SpeakerArrangement(stereo_arrangement()),
            value_payload: Some(EventPayload::SpeakerArrangement(stereo_arrangement())),
        };
        assert_eq!(roundtrip(&event), event);
    }

    #[test]
    fn test_event_result_roundtrip() {
        let result = EventResult {
            return_value: -1,
            payload: EventPayload::Rect(VstRect {
                top: 0,
                left: 0,
                bottom: 600,
                right: 800,
            }),
            value_payload: None,
        };
        assert_eq!(roundtrip(&result), result);
    }

    #[test]
    fn test_parameter_roundtrip() {
        let get = Parameter {
            index: 3,
            value: None,
        };
        assert_eq!(roundtrip(&get), get);

        let set = Parameter {
            index: 3,
            value: Some(0.75),
        };
        assert_eq!(roundtrip(&set), set);

        let ack = ParameterResult { value: None };
        assert_eq!(roundtrip(&ack), ack);

        let response = ParameterResult { value: Some(0.75) };
        assert_eq!(roundtrip(&response), response);
    }

    #[test]
    fn test_audio_roundtrip() {
        let request = AudioRequest {
            inputs: vec![vec![0.0; 64], vec![0.5; 64]],
            frames: 64,
        };
        assert_eq!(roundtrip(&request), request);

        let response = AudioResponse {
            outputs: vec![vec![-0.25; 64], vec![0.25; 64]],
        };
        assert_eq!(roundtrip(&response), response);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let descriptor = PluginDescriptor {
            magic: crate::vst2::abi::VST_MAGIC,
            num_programs: 16,
            num_params: 43,
            num_inputs: 2,
            num_outputs: 2,
            flags: 0x31,
            initial_delay: 128,
            unique_id: 0x54_41_4C_31,
            version: 1001,
        };
        assert_eq!(roundtrip(&descriptor), descriptor);
    }

    #[test]
    fn test_midi_events_roundtrip() {
        let mut batch = DynamicVstEvents::default();
        batch.events.push(VstEvent::midi(0, [0x90, 60, 100]));
        batch.events.push(VstEvent::midi(32, [0x80, 60, 0]));
        assert_eq!(roundtrip(&batch), batch);
    }

    #[test]
    fn test_payload_marker_roundtrips() {
        for payload in [
            EventPayload::None,
            EventPayload::WantsString,
            EventPayload::WantsRect,
            EventPayload::WantsDescriptor,
            EventPayload::WantsChunk,
            EventPayload::WantsTimeInfo,
            EventPayload::Pointer(0xDEAD_BEEF),
            EventPayload::String("hasCockosViewAsConfig".to_string()),
        ] {
            assert_eq!(roundtrip(&payload), payload);
        }
    }

    #[test]
    fn test_payload_struct_roundtrips() {
        let mut properties = VstIoProperties::default();
        properties.label[..4].copy_from_slice(b"Main");
        properties.flags = 3;
        assert_eq!(
            roundtrip(&EventPayload::PortProperties(properties)),
            EventPayload::PortProperties(properties)
        );

        let mut key_name = VstMidiKeyName::default();
        key_name.this_key_number = 60;
        key_name.key_name[..2].copy_from_slice(b"C4");
        assert_eq!(
            roundtrip(&EventPayload::MidiKeyName(key_name)),
            EventPayload::MidiKeyName(key_name)
        );

        let time_info = VstTimeInfo {
            sample_pos: 44100.0,
            sample_rate: 44100.0,
            tempo: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            flags: 0x0602,
            ..Default::default()
        };
        assert_eq!(
            roundtrip(&EventPayload::TimeInfo(time_info)),
            EventPayload::TimeInfo(time_info)
        );
    }

    #[test]
    fn test_payload_bad_tag() {
        let buf = [200u8];
        let mut cursor = buf.as_slice();
        assert!(matches!(
            EventPayload::decode(&mut cursor),
            Err(CodecError::BadTag {
                type_name: "EventPayload",
                tag: 200,
            })
        ));
    }

    // -----------------------------------------------------------------------
    // Dynamic struct reconstruction
    // -----------------------------------------------------------------------

    #[test]
    fn test_events_buffer_reconstruction() {
        let mut batch = DynamicVstEvents::default();
        for i in 0..5 {
            batch.events.push(VstEvent::midi(i, [0x90, 60 + i as u8, 100]));
        }

        let mut buffer = batch.to_buffer();
        assert_eq!(buffer.len(), 5);

        let raw = buffer.as_ptr();
        let recovered = unsafe { DynamicVstEvents::from_raw(raw) };
        assert_eq!(recovered, batch);
    }

    #[test]
    fn test_events_buffer_empty() {
        let batch = DynamicVstEvents::default();
        let mut buffer = batch.to_buffer();
        assert!(buffer.is_empty());
        assert_eq!(unsafe { (*buffer.as_ptr()).num_events }, 0);
    }

    #[test]
    fn test_speaker_arrangement_byte_exact_roundtrip() {
        let arrangement = stereo_arrangement();
        assert_eq!(arrangement.num_channels(), 2);
        assert_eq!(arrangement.arrangement_type(), 1);
        assert_eq!(
            arrangement.as_bytes().len(),
            speaker_arrangement_size(2)
        );

        let decoded = roundtrip(&arrangement);
        assert_eq!(decoded.as_bytes(), arrangement.as_bytes());

        // Writing back into a full-size struct must reproduce the dynamic
        // tail exactly.
        let mut target = VstSpeakerArrangement {
            arrangement_type: 0,
            num_channels: 0,
            speakers: [VstSpeakerProperties {
                azimuth: 0.0,
                elevation: 0.0,
                radius: 0.0,
                reserved: 0.0,
                name: [0; 64],
                speaker_type: 0,
                future: [0; 28],
            }; 8],
        };
        unsafe { decoded.write_to(&mut target) };
        assert_eq!(target.num_channels, 2);
        assert_eq!(target.speakers[0].name[0], b'L');
        assert_eq!(target.speakers[1].name[0], b'R');
        assert_eq!(target.speakers[1].speaker_type, 2);
    }

    #[test]
    fn test_descriptor_apply_preserves_pointers() {
        unsafe extern "C" fn noop_dispatcher(
            _: *mut AEffect,
            _: i32,
            _: i32,
            _: isize,
            _: *mut std::ffi::c_void,
            _: f32,
        ) -> isize {
            0
        }
        unsafe extern "C" fn noop_process(
            _: *mut AEffect,
            _: *const *const f32,
            _: *mut *mut f32,
            _: i32,
        ) {
        }
        unsafe extern "C" fn noop_set(_: *mut AEffect, _: i32, _: f32) {}
        unsafe extern "C" fn noop_get(_: *mut AEffect, _: i32) -> f32 {
            0.0
        }

        let mut effect = AEffect::inert(
            noop_dispatcher,
            noop_process,
            noop_process,
            noop_set,
            noop_get,
        );
        let original_object = 0x1234 as *mut std::ffi::c_void;
        effect.object = original_object;

        let descriptor = PluginDescriptor {
            magic: crate::vst2::abi::VST_MAGIC,
            num_inputs: 2,
            num_outputs: 4,
            num_params: 7,
            ..Default::default()
        };
        descriptor.apply_to(&mut effect);

        assert_eq!(effect.magic, crate::vst2::abi::VST_MAGIC);
        assert_eq!(effect.num_outputs, 4);
        assert_eq!(effect.object, original_object);
    }
}
