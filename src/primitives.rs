//! Atomic application types (Clause 20.2)
//!
//! Each atomic type has a fixed application tag number and a canonical
//! content encoding. Rust-native types are used where the mapping is exact
//! (`bool`, `u64`, `i64`, `f32`, `f64`, `String`); the rest are newtypes.

use core::fmt;
use std::str::FromStr;

use crate::{
    error::{DecodeError, DecodeResult, EncodeResult},
    object::ObjectType,
    tag::{Tag, TagClass, number},
};

/// An atomic type: a fixed application tag number plus content codec.
///
/// `from_tag` accepts either an application tag of the type's number or a
/// context tag (the caller vouches for the type when the position implies it).
pub trait Primitive: Sized {
    /// the application tag number
    const TAG_NUMBER: u8;
    /// short name for diagnostics
    const NAME: &'static str;

    /// encode the content octets
    fn encode_content(&self) -> EncodeResult<Vec<u8>>;

    /// decode from content octets
    fn decode_content(data: &[u8]) -> DecodeResult<Self>;

    /// wrap in an application tag
    fn to_tag(&self) -> EncodeResult<Tag> {
        Ok(Tag::application(Self::TAG_NUMBER, self.encode_content()?))
    }

    /// wrap in a context tag of the given number
    fn to_context_tag(&self, context: u8) -> EncodeResult<Tag> {
        Ok(Tag::context(context, self.encode_content()?))
    }

    /// decode from a tag, checking the application tag number
    fn from_tag(tag: &Tag) -> DecodeResult<Self> {
        match tag.class {
            TagClass::Application if tag.number == Self::TAG_NUMBER => {
                Self::decode_content(&tag.data)
            }
            TagClass::Context => Self::decode_content(&tag.data),
            _ => Err(tag.mismatch(Self::NAME)),
        }
    }
}

/// Null, tag 0; no content
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Null;

impl Primitive for Null {
    const TAG_NUMBER: u8 = number::NULL;
    const NAME: &'static str = "Null";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(vec![])
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        if !data.is_empty() {
            return Err(DecodeError::OutOfRange("null"));
        }
        Ok(Null)
    }
}

impl Primitive for bool {
    const TAG_NUMBER: u8 = number::BOOLEAN;
    const NAME: &'static str = "Boolean";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(vec![u8::from(*self)])
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        match data {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(DecodeError::OutOfRange("boolean")),
        }
    }
}

impl Primitive for u64 {
    const TAG_NUMBER: u8 = number::UNSIGNED;
    const NAME: &'static str = "Unsigned";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        let mut buf = vec![];
        crate::encoder::Encoder::new(&mut buf).write_unsigned(*self)?;
        Ok(buf)
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        crate::decoder::Decoder::new(data).read_unsigned(data.len())
    }
}

impl Primitive for i64 {
    const TAG_NUMBER: u8 = number::SIGNED;
    const NAME: &'static str = "Integer";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        let mut buf = vec![];
        crate::encoder::Encoder::new(&mut buf).write_signed(*self)?;
        Ok(buf)
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        crate::decoder::Decoder::new(data).read_signed(data.len())
    }
}

impl Primitive for f32 {
    const TAG_NUMBER: u8 = number::REAL;
    const NAME: &'static str = "Real";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(self.to_be_bytes().to_vec())
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let mut d = crate::decoder::Decoder::new(data);
        let v = d.read_f32()?;
        if !d.is_empty() {
            return Err(DecodeError::OutOfRange("real"));
        }
        Ok(v)
    }
}

impl Primitive for f64 {
    const TAG_NUMBER: u8 = number::DOUBLE;
    const NAME: &'static str = "Double";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(self.to_be_bytes().to_vec())
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let mut d = crate::decoder::Decoder::new(data);
        let v = d.read_f64()?;
        if !d.is_empty() {
            return Err(DecodeError::OutOfRange("double"));
        }
        Ok(v)
    }
}

/// Octet string, tag 6
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OctetString(pub Vec<u8>);

impl fmt::Debug for OctetString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OctetString({})", hex::encode(&self.0))
    }
}

impl Primitive for OctetString {
    const TAG_NUMBER: u8 = number::OCTET_STRING;
    const NAME: &'static str = "OctetString";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(self.0.clone())
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        Ok(OctetString(data.to_vec()))
    }
}

/// character-set octet for UTF-8 (ANSI X3.4 in the standard's terms)
const CHARSET_UTF8: u8 = 0;

impl Primitive for String {
    const TAG_NUMBER: u8 = number::CHARACTER_STRING;
    const NAME: &'static str = "CharacterString";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        let mut content = Vec::with_capacity(self.len() + 1);
        content.push(CHARSET_UTF8);
        content.extend_from_slice(self.as_bytes());
        Ok(content)
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        match data.split_first() {
            Some((&CHARSET_UTF8, rest)) => Ok(std::str::from_utf8(rest)?.to_owned()),
            Some(_) => Err(DecodeError::OutOfRange("character-string encoding")),
            None => Err(DecodeError::NotEnoughBytes),
        }
    }
}

/// Bit string, tag 8: a declared number of bits, most significant first.
///
/// The first content octet counts the unused bits in the final octet.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitString {
    length: usize,
    octets: Vec<u8>,
}

impl BitString {
    /// all-clear bit string of `length` bits
    pub fn new(length: usize) -> Self {
        BitString {
            length,
            octets: vec![0; length.div_ceil(8)],
        }
    }

    /// build from booleans, first bit first
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut bs = BitString::new(bits.len());
        for (i, bit) in bits.iter().enumerate() {
            bs.set(i, *bit);
        }
        bs
    }

    /// number of declared bits
    pub fn len(&self) -> usize {
        self.length
    }

    /// true when no bits are declared
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// read bit `i`; out-of-range reads are false
    pub fn bit(&self, i: usize) -> bool {
        if i >= self.length {
            return false;
        }
        self.octets[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// set bit `i`
    pub fn set(&mut self, i: usize, value: bool) {
        if i >= self.length {
            return;
        }
        let mask = 0x80 >> (i % 8);
        if value {
            self.octets[i / 8] |= mask;
        } else {
            self.octets[i / 8] &= !mask;
        }
    }
}

impl fmt::Debug for BitString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitString(")?;
        for i in 0..self.length {
            write!(f, "{}", u8::from(self.bit(i)))?;
        }
        write!(f, ")")
    }
}

impl Primitive for BitString {
    const TAG_NUMBER: u8 = number::BIT_STRING;
    const NAME: &'static str = "BitString";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        let unused = (8 - self.length % 8) % 8;
        let mut content = Vec::with_capacity(self.octets.len() + 1);
        content.push(unused as u8);
        content.extend_from_slice(&self.octets);
        Ok(content)
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let (unused, octets) = data.split_first().ok_or(DecodeError::NotEnoughBytes)?;
        if *unused > 7 || (*unused > 0 && octets.is_empty()) {
            return Err(DecodeError::OutOfRange("bit-string unused count"));
        }
        Ok(BitString {
            length: octets.len() * 8 - *unused as usize,
            octets: octets.to_vec(),
        })
    }
}

/// Enumerated, tag 9; the variant meaning is context-dependent
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Enumerated(pub u32);

impl Primitive for Enumerated {
    const TAG_NUMBER: u8 = number::ENUMERATED;
    const NAME: &'static str = "Enumerated";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        u64::from(self.0).encode_content()
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let v = u64::decode_content(data)?;
        u32::try_from(v)
            .map(Enumerated)
            .map_err(|_| DecodeError::OutOfRange("enumerated"))
    }
}

/// octet value meaning "unspecified" in Date and Time fields
pub const UNSPECIFIED: u8 = 0xFF;

/// Date, tag 10: `(year-1900, month, day, day-of-week)` with 0xFF wildcards.
///
/// Month also admits 13 (odd months) and 14 (even months); day admits
/// 32 (last day of month) and 33/34/35 (ordinal weekday codes).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Date {
    /// years since 1900, or 0xFF
    pub year: u8,
    /// 1..=12, 13 odd, 14 even, or 0xFF
    pub month: u8,
    /// 1..=31, 32 last, 33..=35 ordinal weekday, or 0xFF
    pub day: u8,
    /// 1 = Monday .. 7 = Sunday, or 0xFF
    pub day_of_week: u8,
}

impl Date {
    /// every field unspecified
    pub const ANY: Date = Date {
        year: UNSPECIFIED,
        month: UNSPECIFIED,
        day: UNSPECIFIED,
        day_of_week: UNSPECIFIED,
    };

    /// a fully-specified calendar date; day-of-week left unspecified
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Date {
            year: (year.saturating_sub(1900)).min(254) as u8,
            month,
            day,
            day_of_week: UNSPECIFIED,
        }
    }

    /// true when any octet is a wildcard or pattern code
    pub fn is_pattern(&self) -> bool {
        self.year == UNSPECIFIED
            || self.month >= 13
            || self.day >= 32
            || self.day_of_week == UNSPECIFIED
    }
}

impl fmt::Debug for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Date({}-{}-{} dow {})",
            self.year as u16 + 1900,
            self.month,
            self.day,
            self.day_of_week
        )
    }
}

impl Primitive for Date {
    const TAG_NUMBER: u8 = number::DATE;
    const NAME: &'static str = "Date";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(vec![self.year, self.month, self.day, self.day_of_week])
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let [year, month, day, day_of_week]: [u8; 4] = data
            .try_into()
            .map_err(|_| DecodeError::OutOfRange("date"))?;
        if month != UNSPECIFIED && !(1..=14).contains(&month) {
            return Err(DecodeError::OutOfRange("date month"));
        }
        if day != UNSPECIFIED && !(1..=35).contains(&day) {
            return Err(DecodeError::OutOfRange("date day"));
        }
        if day_of_week != UNSPECIFIED && !(1..=7).contains(&day_of_week) {
            return Err(DecodeError::OutOfRange("date day-of-week"));
        }
        Ok(Date {
            year,
            month,
            day,
            day_of_week,
        })
    }
}

/// Time, tag 11: HH MM SS hundredths with 0xFF wildcards
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl Time {
    /// every field unspecified
    pub const ANY: Time = Time {
        hour: UNSPECIFIED,
        minute: UNSPECIFIED,
        second: UNSPECIFIED,
        hundredths: UNSPECIFIED,
    };

    /// a fully-specified time of day
    pub fn new(hour: u8, minute: u8, second: u8, hundredths: u8) -> Self {
        Time {
            hour,
            minute,
            second,
            hundredths,
        }
    }

    /// true when any octet is a wildcard
    pub fn is_pattern(&self) -> bool {
        self.hour == UNSPECIFIED
            || self.minute == UNSPECIFIED
            || self.second == UNSPECIFIED
            || self.hundredths == UNSPECIFIED
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time({:02}:{:02}:{:02}.{:02})",
            self.hour, self.minute, self.second, self.hundredths
        )
    }
}

impl Primitive for Time {
    const TAG_NUMBER: u8 = number::TIME;
    const NAME: &'static str = "Time";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(vec![self.hour, self.minute, self.second, self.hundredths])
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let [hour, minute, second, hundredths]: [u8; 4] = data
            .try_into()
            .map_err(|_| DecodeError::OutOfRange("time"))?;
        if (hour != UNSPECIFIED && hour > 23)
            || (minute != UNSPECIFIED && minute > 59)
            || (second != UNSPECIFIED && second > 59)
            || (hundredths != UNSPECIFIED && hundredths > 99)
        {
            return Err(DecodeError::OutOfRange("time"));
        }
        Ok(Time {
            hour,
            minute,
            second,
            hundredths,
        })
    }
}

/// instance number meaning "unspecified" (all 22 bits set)
pub const UNSPECIFIED_INSTANCE: u32 = 0x3F_FFFF;

/// Object identifier, tag 12: 10 bits of object type, 22 bits of instance
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentifier {
    /// object type (10 bits)
    pub object_type: ObjectType,
    /// instance number (22 bits)
    pub instance: u32,
}

impl ObjectIdentifier {
    /// a new identifier; instance is masked to 22 bits
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        ObjectIdentifier {
            object_type,
            instance: instance & UNSPECIFIED_INSTANCE,
        }
    }

    /// a device object identifier
    pub fn device(instance: u32) -> Self {
        ObjectIdentifier::new(ObjectType::Device, instance)
    }

    /// true when the instance is the unspecified wildcard
    pub fn is_unspecified(&self) -> bool {
        self.instance == UNSPECIFIED_INSTANCE
    }
}

impl fmt::Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?},{})", self.object_type, self.instance)
    }
}

impl From<ObjectIdentifier> for u32 {
    fn from(oid: ObjectIdentifier) -> u32 {
        (u32::from(u16::from(oid.object_type)) << 22) | (oid.instance & UNSPECIFIED_INSTANCE)
    }
}

impl From<u32> for ObjectIdentifier {
    fn from(raw: u32) -> Self {
        ObjectIdentifier {
            object_type: ObjectType::from((raw >> 22) as u16),
            instance: raw & UNSPECIFIED_INSTANCE,
        }
    }
}

impl FromStr for ObjectIdentifier {
    type Err = DecodeError;

    /// parse `"analog-input,5"` or `"8,5"` forms
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_part, inst_part) = s
            .split_once(',')
            .ok_or(DecodeError::OutOfRange("object identifier"))?;
        let object_type = type_part
            .trim()
            .parse::<ObjectType>()
            .map_err(|_| DecodeError::OutOfRange("object type"))?;
        let instance = inst_part
            .trim()
            .parse::<u32>()
            .map_err(|_| DecodeError::OutOfRange("object instance"))?;
        if instance > UNSPECIFIED_INSTANCE {
            return Err(DecodeError::OutOfRange("object instance"));
        }
        Ok(ObjectIdentifier::new(object_type, instance))
    }
}

impl Primitive for ObjectIdentifier {
    const TAG_NUMBER: u8 = number::OBJECT_IDENTIFIER;
    const NAME: &'static str = "ObjectIdentifier";

    fn encode_content(&self) -> EncodeResult<Vec<u8>> {
        Ok(u32::from(*self).to_be_bytes().to_vec())
    }

    fn decode_content(data: &[u8]) -> DecodeResult<Self> {
        let raw: [u8; 4] = data
            .try_into()
            .map_err(|_| DecodeError::OutOfRange("object identifier"))?;
        Ok(u32::from_be_bytes(raw).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encodable;

    fn content_roundtrip<T: Primitive + PartialEq + fmt::Debug>(v: T) {
        let content = v.encode_content().unwrap();
        assert_eq!(T::decode_content(&content).unwrap(), v);
    }

    #[test]
    fn unsigned_boundaries() {
        for v in [0u64, 1, 127, 128, 255, 256, 65535, 65536, u32::MAX as u64] {
            content_roundtrip(v);
        }
        assert_eq!(0u64.encode_content().unwrap(), vec![0x00]);
    }

    #[test]
    fn signed_boundaries() {
        for v in [0i64, 1, -1, 127, -128, 128, -129, 32767, -32768] {
            content_roundtrip(v);
        }
    }

    #[test]
    fn real_tagged() {
        let tag = 72.5f32.to_tag().unwrap();
        assert_eq!(tag.to_vec().unwrap(), vec![0x44, 0x42, 0x91, 0x00, 0x00]);
        assert_eq!(f32::from_tag(&tag).unwrap(), 72.5);
    }

    #[test]
    fn character_string_utf8() {
        let s = String::from("Analog Input 1");
        let content = s.encode_content().unwrap();
        assert_eq!(content[0], 0);
        content_roundtrip(s);
        // non-utf8 charset is refused
        assert!(String::decode_content(&[4, 0x41]).is_err());
    }

    #[test]
    fn bit_string_unused_bits() {
        let bs = BitString::from_bits(&[true, false, true]);
        let content = bs.encode_content().unwrap();
        assert_eq!(content, vec![5, 0b1010_0000]);
        content_roundtrip(bs);
        // unused count must stay under 8
        assert!(BitString::decode_content(&[8, 0xFF]).is_err());
    }

    #[test]
    fn date_patterns() {
        content_roundtrip(Date::new(2024, 6, 15));
        content_roundtrip(Date::ANY);
        // odd-months code
        let d = Date {
            year: 124,
            month: 13,
            day: 32,
            day_of_week: UNSPECIFIED,
        };
        assert!(d.is_pattern());
        content_roundtrip(d);
        assert!(Date::decode_content(&[124, 15, 1, 1]).is_err());
    }

    #[test]
    fn time_wildcards() {
        content_roundtrip(Time::new(14, 30, 0, 0));
        content_roundtrip(Time::ANY);
        assert!(Time::decode_content(&[24, 0, 0, 0]).is_err());
    }

    #[test]
    fn object_identifier_packing() {
        let oid = ObjectIdentifier::new(ObjectType::AnalogInput, 5);
        // analog-input is type 0: high 10 bits zero
        assert_eq!(u32::from(oid), 5);
        let dev = ObjectIdentifier::device(150);
        assert_eq!(u32::from(dev), (8 << 22) | 150);
        content_roundtrip(dev);
        assert!(!dev.is_unspecified());
        assert!(ObjectIdentifier::new(ObjectType::Device, UNSPECIFIED_INSTANCE).is_unspecified());
    }

    #[test]
    fn object_identifier_parse() {
        let oid: ObjectIdentifier = "analog-input,5".parse().unwrap();
        assert_eq!(oid, ObjectIdentifier::new(ObjectType::AnalogInput, 5));
        let oid: ObjectIdentifier = "8,150".parse().unwrap();
        assert_eq!(oid, ObjectIdentifier::device(150));
        assert!("device".parse::<ObjectIdentifier>().is_err());
    }

    #[test]
    fn context_tag_accepted() {
        // a positionally-typed unsigned inside a context tag
        let tag = 42u64.to_context_tag(3).unwrap();
        assert_eq!(u64::from_tag(&tag).unwrap(), 42);
        // wrong application number is refused
        let tag = 42u64.to_tag().unwrap();
        assert!(f32::from_tag(&tag).is_err());
    }
}
