//! Serializers which write addresses as hex strings in human-readable formats.
//!
//! Deserialization needs no counterpart: YAML integers already accept the `0x` notation.

use serde::{ser::SerializeSeq as _, ser::SerializeStruct as _, Serialize, Serializer};
use std::ops::Range;

/// Integer types which can be written as a hex string or as a plain number.
pub(crate) trait HexInt: Copy + std::fmt::LowerHex + Serialize {
    fn serialize_plain<S: Serializer>(self, serializer: S) -> Result<S::Ok, S::Error>;
}

macro_rules! hex_int {
    ($($ty:ty => $method:ident),* $(,)?) => {
        $(
            impl HexInt for $ty {
                fn serialize_plain<S: Serializer>(self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.$method(self)
                }
            }
        )*
    };
}

hex_int!(u8 => serialize_u8, u16 => serialize_u16, u32 => serialize_u32, u64 => serialize_u64);

pub(crate) fn hex_u_int<T: HexInt, S: Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("{value:#x}"))
    } else {
        value.serialize_plain(serializer)
    }
}

pub(crate) fn hex_option<T: HexInt, S: Serializer>(
    value: &Option<T>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) if serializer.is_human_readable() => {
            serializer.serialize_some(&format!("{value:#x}"))
        }
        Some(value) => serializer.serialize_some(value),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn hex_vec<T: HexInt, S: Serializer>(
    values: &[T],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let human_readable = serializer.is_human_readable();
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        if human_readable {
            seq.serialize_element(&format!("{value:#x}"))?;
        } else {
            seq.serialize_element(value)?;
        }
    }
    seq.end()
}

pub(crate) fn hex_range<S: Serializer>(range: &Range<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    let human_readable = serializer.is_human_readable();
    let mut state = serializer.serialize_struct("Range", 2)?;
    if human_readable {
        state.serialize_field("start", &format!("{:#x}", range.start))?;
        state.serialize_field("end", &format!("{:#x}", range.end))?;
    } else {
        state.serialize_field("start", &range.start)?;
        state.serialize_field("end", &range.end)?;
    }
    state.end()
}

/// Encodes a list of little-endian 32-bit words as base64 text.
pub(crate) mod words_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(words: &[u32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect::<Vec<u8>>();
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u32>, D::Error> {
        struct Base64Visitor;

        impl<'de> de::Visitor<'de> for Base64Visitor {
            type Value = Vec<u32>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "base64 encoded little-endian 32-bit words")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let bytes = BASE64.decode(v).map_err(E::custom)?;
                if bytes.len() % 4 != 0 {
                    return Err(E::custom(format!(
                        "instruction image of {} bytes is not a whole number of words",
                        bytes.len()
                    )));
                }

                Ok(bytes
                    .chunks_exact(4)
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect())
            }
        }

        deserializer.deserialize_str(Base64Visitor)
    }
}
