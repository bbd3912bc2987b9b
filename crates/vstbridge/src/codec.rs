//! Positional wire codec for the bridge channels.
//!
//! Messages are not self-describing: both ends agree on the message type per
//! channel and per direction, so only the field values travel over the wire.
//! The encoding rules are fixed:
//!
//! - integers are fixed-width little-endian (pointer-sized values travel as
//!   eight bytes),
//! - strings and byte buffers are a `u32` length followed by the raw bytes,
//! - optionals are a one-byte present flag followed by the value if present,
//! - containers are a `u32` element count followed by the elements,
//! - tagged variants are a single tag byte followed by the variant payload.
//!
//! Every message is framed with a `u32` little-endian length prefix so a
//! reader can always consume a whole message from the stream.

use std::io::{Read, Write};

use thiserror::Error;

/// Upper bound for string fields. Matches the longest strings the plugin API
/// can produce (effect names, vendor strings, can-do queries).
pub const MAX_STRING_LENGTH: usize = 4096;

/// Upper bound for chunk data and whole frames. Plugin state chunks for
/// sample-based instruments can get large, but anything beyond this is a
/// corrupted stream.
pub const MAX_BINARY_LENGTH: usize = 64 * 1024 * 1024;

/// Upper bound for container element counts.
pub const MAX_CONTAINER_LENGTH: usize = 1 << 24;

#[derive(Error, Debug)]
pub enum CodecError {
    /// The stream ended in the middle of a message.
    #[error("unexpected end of stream while decoding")]
    Truncated,

    /// A length or count field exceeds its configured maximum.
    #[error("length {length} exceeds the maximum of {max}")]
    Overflow { length: usize, max: usize },

    /// An unknown variant tag was read.
    #[error("unknown tag {tag} while decoding {type_name}")]
    BadTag { type_name: &'static str, tag: u8 },

    #[error("string field does not contain valid UTF-8")]
    InvalidString,

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// A value that can be written to a channel in the fixed field order.
pub trait Encode {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// A value that can be read back from a channel in the fixed field order.
pub trait Decode: Sized {
    fn decode<R: Read>(reader: &mut R) -> Result<Self>;
}

/// A request message. Declares the response type the sender must block for on
/// the same channel, which is what keeps both sides of every channel in
/// lockstep.
pub trait Message: Encode + Decode {
    type Response: Encode + Decode;
}

macro_rules! impl_codec_for_int {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
                    writer.write_all(&self.to_le_bytes())?;
                    Ok(())
                }
            }

            impl Decode for $ty {
                fn decode<R: Read>(reader: &mut R) -> Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    reader.read_exact(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_codec_for_int!(u8, i16, u16, i32, u32, i64, u64, f32, f64);

// Pointer-sized values always travel as eight bytes so a 32-bit plugin host
// and a 64-bit native side agree on the layout.
impl Encode for isize {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        (*self as i64).encode(writer)
    }
}

impl Decode for isize {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(i64::decode(reader)? as isize)
    }
}

impl Encode for usize {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        (*self as u64).encode(writer)
    }
}

impl Decode for usize {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(u64::decode(reader)? as usize)
    }
}

impl Encode for bool {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        (u8::from(*self)).encode(writer)
    }
}

impl Decode for bool {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        match u8::decode(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::BadTag {
                type_name: "bool",
                tag,
            }),
        }
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Some(value) => {
                1u8.encode(writer)?;
                value.encode(writer)
            }
            None => 0u8.encode(writer),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader)?)),
            tag => Err(CodecError::BadTag {
                type_name: "Option",
                tag,
            }),
        }
    }
}

impl Encode for String {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.len() > MAX_STRING_LENGTH {
            return Err(CodecError::Overflow {
                length: self.len(),
                max: MAX_STRING_LENGTH,
            });
        }
        (self.len() as u32).encode(writer)?;
        writer.write_all(self.as_bytes())?;
        Ok(())
    }
}

impl Decode for String {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let bytes = read_length_prefixed(reader, MAX_STRING_LENGTH)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidString)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.len() > MAX_CONTAINER_LENGTH {
            return Err(CodecError::Overflow {
                length: self.len(),
                max: MAX_CONTAINER_LENGTH,
            });
        }
        (self.len() as u32).encode(writer)?;
        for element in self {
            element.encode(writer)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let count = u32::decode(reader)? as usize;
        if count > MAX_CONTAINER_LENGTH {
            return Err(CodecError::Overflow {
                length: count,
                max: MAX_CONTAINER_LENGTH,
            });
        }
        let mut elements = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            elements.push(T::decode(reader)?);
        }
        Ok(elements)
    }
}

impl<A: smallvec::Array> Encode for smallvec::SmallVec<A>
where
    A::Item: Encode,
{
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.len() > MAX_CONTAINER_LENGTH {
            return Err(CodecError::Overflow {
                length: self.len(),
                max: MAX_CONTAINER_LENGTH,
            });
        }
        (self.len() as u32).encode(writer)?;
        for element in self {
            element.encode(writer)?;
        }
        Ok(())
    }
}

impl<A: smallvec::Array> Decode for smallvec::SmallVec<A>
where
    A::Item: Decode,
{
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let count = u32::decode(reader)? as usize;
        if count > MAX_CONTAINER_LENGTH {
            return Err(CodecError::Overflow {
                length: count,
                max: MAX_CONTAINER_LENGTH,
            });
        }
        let mut elements = smallvec::SmallVec::new();
        for _ in 0..count {
            elements.push(A::Item::decode(reader)?);
        }
        Ok(elements)
    }
}

// Fixed-width record fields (character arrays inside the plugin API structs)
// are written verbatim, without a length prefix.
impl<const N: usize> Encode for [u8; N] {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self)?;
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; N];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Write a length-prefixed byte buffer (used for chunk data).
pub fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_BINARY_LENGTH {
        return Err(CodecError::Overflow {
            length: bytes.len(),
            max: MAX_BINARY_LENGTH,
        });
    }
    (bytes.len() as u32).encode(writer)?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Read a length-prefixed byte buffer.
pub fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    read_length_prefixed(reader, MAX_BINARY_LENGTH)
}

fn read_length_prefixed<R: Read>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
    let length = u32::decode(reader)? as usize;
    if length > max {
        return Err(CodecError::Overflow { length, max });
    }
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Serialize `value` into `scratch` and write it to `stream` as one framed
/// message. The scratch buffer is reused between calls so steady-state
/// traffic does not allocate.
pub fn write_framed<W, T>(stream: &mut W, scratch: &mut Vec<u8>, value: &T) -> Result<()>
where
    W: Write,
    T: Encode,
{
    scratch.clear();
    value.encode(scratch)?;
    if scratch.len() > MAX_BINARY_LENGTH {
        return Err(CodecError::Overflow {
            length: scratch.len(),
            max: MAX_BINARY_LENGTH,
        });
    }
    stream.write_all(&(scratch.len() as u32).to_le_bytes())?;
    stream.write_all(scratch)?;
    stream.flush()?;
    Ok(())
}

/// Read one framed message from `stream`, staging the raw bytes in `scratch`.
pub fn read_framed<R, T>(stream: &mut R, scratch: &mut Vec<u8>) -> Result<T>
where
    R: Read,
    T: Decode,
{
    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf)?;
    let length = u32::from_le_bytes(length_buf) as usize;
    if length > MAX_BINARY_LENGTH {
        return Err(CodecError::Overflow {
            length,
            max: MAX_BINARY_LENGTH,
        });
    }

    scratch.resize(length, 0);
    stream.read_exact(scratch)?;

    let mut cursor = scratch.as_slice();
    T::decode(&mut cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encode + Decode>(value: &T) -> T {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        let mut cursor = buf.as_slice();
        let decoded = T::decode(&mut cursor).unwrap();
        assert!(cursor.is_empty(), "decode left {} trailing bytes", cursor.len());
        decoded
    }

    #[test]
    fn test_integer_roundtrip() {
        assert_eq!(roundtrip(&0x1234_5678_u32), 0x1234_5678);
        assert_eq!(roundtrip(&-42i32), -42);
        assert_eq!(roundtrip(&isize::MIN), isize::MIN);
        assert_eq!(roundtrip(&0.75f32), 0.75);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut buf = Vec::new();
        0x0102_0304_u32.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_roundtrip() {
        assert_eq!(roundtrip(&"hasCockosViewAsConfig".to_string()), "hasCockosViewAsConfig");
        assert_eq!(roundtrip(&String::new()), "");
    }

    #[test]
    fn test_string_length_limit() {
        let oversized = "x".repeat(MAX_STRING_LENGTH + 1);
        let mut buf = Vec::new();
        match oversized.encode(&mut buf) {
            Err(CodecError::Overflow { length, max }) => {
                assert_eq!(length, MAX_STRING_LENGTH + 1);
                assert_eq!(max, MAX_STRING_LENGTH);
            }
            other => panic!("Expected Overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_string() {
        // A hand-built buffer claiming a 1 GiB string.
        let mut buf = Vec::new();
        (1u32 << 30).encode(&mut buf).unwrap();
        let mut cursor = buf.as_slice();
        assert!(matches!(
            String::decode(&mut cursor),
            Err(CodecError::Overflow { .. })
        ));
    }

    #[test]
    fn test_optional_roundtrip() {
        assert_eq!(roundtrip(&Some(0.5f32)), Some(0.5));
        assert_eq!(roundtrip(&None::<f32>), None);
    }

    #[test]
    fn test_optional_flag_is_one_byte() {
        let mut buf = Vec::new();
        Some(1.0f32).encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 1 + 4);
        assert_eq!(buf[0], 1);

        buf.clear();
        None::<f32>.encode(&mut buf).unwrap();
        assert_eq!(buf, [0]);
    }

    #[test]
    fn test_optional_bad_flag() {
        let buf = [7u8];
        let mut cursor = buf.as_slice();
        assert!(matches!(
            Option::<f32>::decode(&mut cursor),
            Err(CodecError::BadTag { tag: 7, .. })
        ));
    }

    #[test]
    fn test_container_roundtrip() {
        let planes = vec![vec![0.0f32, 0.25, -1.0], vec![0.5, 0.5, 0.5]];
        assert_eq!(roundtrip(&planes), planes);

        let empty: Vec<Vec<f32>> = Vec::new();
        assert_eq!(roundtrip(&empty), empty);
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = Vec::new();
        0x1234_5678_u32.encode(&mut buf).unwrap();
        let mut cursor = &buf[..2];
        assert!(matches!(
            u32::decode(&mut cursor),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_framing_roundtrip() {
        let mut wire = Vec::new();
        let mut scratch = Vec::new();
        write_framed(&mut wire, &mut scratch, &vec![1.0f32, 2.0, 3.0]).unwrap();

        // u32 length prefix + 4-byte count + three floats
        assert_eq!(wire.len(), 4 + 4 + 12);

        let mut cursor = wire.as_slice();
        let decoded: Vec<f32> = read_framed(&mut cursor, &mut scratch).unwrap();
        assert_eq!(decoded, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_framed_read_truncated_body() {
        let mut wire = Vec::new();
        let mut scratch = Vec::new();
        write_framed(&mut wire, &mut scratch, &0u64).unwrap();
        wire.truncate(wire.len() - 1);

        let mut cursor = wire.as_slice();
        assert!(matches!(
            read_framed::<_, u64>(&mut cursor, &mut scratch),
            Err(CodecError::Truncated)
        ));
    }
}
