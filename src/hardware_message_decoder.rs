//! Decoder for the line protocol spoken by the EVB1000 boards.
//!
//! Every message is one ASCII line terminated by `\r\n`. Fields are separated
//! by single spaces and the first field is a three character message type.
//! Unsigned integers are written as base-16 text and floats as exactly eight
//! hex characters holding the big-endian IEEE-754 single precision bits, so
//! `412570a4` is `10.34`.
//!
//! ```text
//! tpr 02 412570a4 412570a4 412570a4
//! ```

use nom::{
    bytes::complete::take_while_m_n,
    character::complete::hex_digit1,
    combinator::{all_consuming, map, map_res},
    Finish, IResult,
};

use std::{borrow::Cow, fmt, str::FromStr};

/// The type of a single field in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Passed through as is
    String,
    /// Base-16 unsigned integer
    Unsigned,
    /// Eight hex characters, big-endian IEEE-754 single precision
    Float,
}

/// The ordered list of field names and types of a message, including the
/// message type itself as the first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    fields: &'static [(&'static str, FieldType)],
}

impl Schema {
    /// Number of space separated tokens a line of this schema has.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Schemas are never empty, they always contain `msg_type`.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names, in wire order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(name, _)| *name)
    }

    /// Field names and types, in wire order.
    pub fn fields(&self) -> &'static [(&'static str, FieldType)] {
        self.fields
    }
}

use FieldType::{Float as F, String as S, Unsigned as U};

const TPR_SCHEMA: Schema = Schema {
    fields: &[("msg_type", S), ("tag_id", U), ("x", F), ("y", F), ("z", F)],
};

const APR_SCHEMA: Schema = Schema {
    fields: &[
        ("msg_type", S),
        ("tag_id", U),
        ("a0_x", F),
        ("a0_y", F),
        ("a0_z", F),
        ("a1_x", F),
        ("a1_y", F),
        ("a1_z", F),
        ("a2_x", F),
        ("a2_y", F),
        ("a2_z", F),
        ("a3_x", F),
        ("a3_y", F),
        ("a3_z", F),
    ],
};

// Filtered estimate: position followed by roll, pitch and yaw.
const KMF_SCHEMA: Schema = Schema {
    fields: &[
        ("msg_type", S),
        ("tag_id", U),
        ("x", F),
        ("y", F),
        ("z", F),
        ("R", F),
        ("P", F),
        ("Y", F),
    ],
};

/// The kinds of messages we know how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Tag position report
    Tpr,
    /// Anchor positions report
    Apr,
    /// Filtered tag position and attitude estimate
    Kmf,
}

impl MessageType {
    /// All known message types.
    pub const ALL: [MessageType; 3] = [MessageType::Tpr, MessageType::Apr, MessageType::Kmf];

    /// The three character tag that starts a line of this type.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageType::Tpr => "tpr",
            MessageType::Apr => "apr",
            MessageType::Kmf => "kmf",
        }
    }

    /// Looks up a message type by its wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// The field layout of this message type.
    pub fn schema(&self) -> Schema {
        match self {
            MessageType::Tpr => TPR_SCHEMA,
            MessageType::Apr => APR_SCHEMA,
            MessageType::Kmf => KMF_SCHEMA,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string field
    Str(String),
    /// An unsigned integer field
    Unsigned(u64),
    /// A single precision float field
    Float(f32),
}

impl Value {
    /// The string, if this is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is an unsigned field.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(u) => Some(*u),
            _ => None,
        }
    }

    /// The float, if this is a float field.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn field_type(&self) -> FieldType {
        match self {
            Value::Str(_) => FieldType::String,
            Value::Unsigned(_) => FieldType::Unsigned,
            Value::Float(_) => FieldType::Float,
        }
    }

    fn encode(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Unsigned(u) => format!("{:02x}", u),
            Value::Float(v) => format!("{:08x}", v.to_bits()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Unsigned(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Everything that can go wrong turning a line into a [`Record`]. None of
/// these are fatal, the line should just be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line is not valid UTF-8
    EncodingInvalid,
    /// The line is shorter than a message type tag
    TooShort,
    /// The first three characters are not a known message type
    UnknownMessageType(String),
    /// The line does not have as many fields as its schema
    FieldCountMismatch {
        /// Fields in the schema
        expected: usize,
        /// Fields on the line
        found: usize,
    },
    /// An unsigned field is not valid hex
    BadInteger {
        /// Name of the field
        field: &'static str,
        /// The offending token
        token: String,
    },
    /// A float field is not exactly eight hex characters
    BadFloat {
        /// Name of the field
        field: &'static str,
        /// The offending token
        token: String,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DecodeError as DE;
        let msg = match self {
            DE::EncodingInvalid => Cow::from("line is not valid utf-8"),
            DE::TooShort => Cow::from("line is too short to contain a message type"),
            DE::UnknownMessageType(tag) => Cow::from(format!("unknown message type {:?}", tag)),
            DE::FieldCountMismatch { expected, found } => Cow::from(format!(
                "expected {} fields, found {}",
                expected, found
            )),
            DE::BadInteger { field, token } => {
                Cow::from(format!("field {} is not a hex integer: {:?}", field, token))
            }
            DE::BadFloat { field, token } => {
                Cow::from(format!("field {} is not a hex float: {:?}", field, token))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for DecodeError {}

/// One decoded message. Records are never modified once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    msg_type: MessageType,
    fields: Vec<(&'static str, Value)>,
}

impl Record {
    /// Builds a record out of values, checking them against the schema of
    /// `msg_type`. The first value is the message type string.
    pub fn new(msg_type: MessageType, values: Vec<Value>) -> Result<Self, DecodeError> {
        let schema = msg_type.schema();
        if values.len() != schema.len() {
            return Err(DecodeError::FieldCountMismatch {
                expected: schema.len(),
                found: values.len(),
            });
        }

        let fields = schema
            .fields()
            .iter()
            .zip(values)
            .map(|(&(name, ty), value)| match (ty, value.field_type()) {
                (expected, found) if expected == found => Ok((name, value)),
                (FieldType::Float, _) => Err(DecodeError::BadFloat {
                    field: name,
                    token: value.to_string(),
                }),
                _ => Err(DecodeError::BadInteger {
                    field: name,
                    token: value.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { msg_type, fields })
    }

    /// The message type of this record.
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Field names and values, in wire order.
    pub fn fields(&self) -> &[(&'static str, Value)] {
        &self.fields
    }

    /// Field names, in wire order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(name, _)| *name)
    }

    /// Looks up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    fn float(&self, name: &str) -> Option<f32> {
        self.get(name).and_then(Value::as_f32)
    }

    /// The id of the tag that sent this record.
    pub fn tag_id(&self) -> Option<u64> {
        self.get("tag_id").and_then(Value::as_u64)
    }

    /// The `(x, y, z)` position carried by `tpr` and `kmf` records.
    pub fn position(&self) -> Option<[f32; 3]> {
        Some([self.float("x")?, self.float("y")?, self.float("z")?])
    }

    /// The `(roll, pitch, yaw)` attitude carried by `kmf` records.
    pub fn attitude(&self) -> Option<[f32; 3]> {
        Some([self.float("R")?, self.float("P")?, self.float("Y")?])
    }

    /// The positions of the four anchors carried by `apr` records.
    pub fn anchors(&self) -> Option<[[f32; 3]; 4]> {
        let mut anchors = [[0.0; 3]; 4];
        for (i, anchor) in anchors.iter_mut().enumerate() {
            for (axis, v) in ["x", "y", "z"].iter().zip(anchor.iter_mut()) {
                *v = self.float(&format!("a{}_{}", i, axis))?;
            }
        }
        Some(anchors)
    }

    /// Writes the record back out in wire format, without the line
    /// terminator.
    pub fn encode(&self) -> String {
        self.fields
            .iter()
            .map(|(_, value)| value.encode())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg_type)?;
        for (name, value) in self.fields.iter().skip(1) {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

fn hex_unsigned(s: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |h| u64::from_str_radix(h, 16))(s)
}

fn hex_float(s: &str) -> IResult<&str, f32> {
    map(
        map_res(
            take_while_m_n(8, 8, |c: char| c.is_ascii_hexdigit()),
            |h| u32::from_str_radix(h, 16),
        ),
        f32::from_bits,
    )(s)
}

fn decode_field(name: &'static str, ty: FieldType, token: &str) -> Result<Value, DecodeError> {
    match ty {
        FieldType::String => Ok(Value::Str(token.to_owned())),
        FieldType::Unsigned => all_consuming(hex_unsigned)(token)
            .finish()
            .map(|(_, u)| Value::Unsigned(u))
            .map_err(|_: nom::error::Error<&str>| DecodeError::BadInteger {
                field: name,
                token: token.to_owned(),
            }),
        FieldType::Float => all_consuming(hex_float)(token)
            .finish()
            .map(|(_, v)| Value::Float(v))
            .map_err(|_: nom::error::Error<&str>| DecodeError::BadFloat {
                field: name,
                token: token.to_owned(),
            }),
    }
}

fn decode_str(line: &str) -> Result<Record, DecodeError> {
    let tag: String = line.chars().take(3).collect();
    if tag.chars().count() < 3 {
        return Err(DecodeError::TooShort);
    }

    let msg_type = MessageType::from_tag(&tag).ok_or(DecodeError::UnknownMessageType(tag))?;
    let schema = msg_type.schema();

    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != schema.len() {
        return Err(DecodeError::FieldCountMismatch {
            expected: schema.len(),
            found: tokens.len(),
        });
    }

    let fields = schema
        .fields()
        .iter()
        .zip(tokens)
        .map(|(&(name, ty), token)| decode_field(name, ty, token).map(|v| (name, v)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Record { msg_type, fields })
}

/// Decodes one line as received from the serial port, terminator included.
pub fn decode(line: &[u8]) -> Result<Record, DecodeError> {
    let line = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    let line = std::str::from_utf8(line).map_err(|_| DecodeError::EncodingInvalid)?;
    decode_str(line)
}

impl FromStr for Record {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_str(s)
    }
}
