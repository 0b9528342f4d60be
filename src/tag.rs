//! BACnet tag and tag-list codec (Clause 20.2.1)
//!
//! Every application value on the wire is carried as a tag: a header octet
//! packing the tag number, a class bit, and a length/value/type field,
//! followed by the content octets.
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +---+---+---+---+---+---+---+---+
//! | tag number    |cls| len/val/typ|
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! Tag numbers 15 and above escape to a following octet. Length/value/type
//! values 0-4 carry the content length inline; 5 escapes to one octet, with
//! further escapes 254 (two-octet length) and 255 (four-octet length);
//! 6 and 7 mark opening and closing constructor tags.

use core::fmt;

use crate::{
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeError, EncodeResult},
};

/// Application tag numbers for the atomic types (Clause 20.2.1.4)
pub mod number {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_IDENTIFIER: u8 = 12;
}

/// Tag class
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TagClass {
    /// application-class tag, the number names an atomic type
    Application,
    /// context-class tag, the number is positional within the enclosing production
    Context,
    /// opening constructor tag
    Opening,
    /// closing constructor tag
    Closing,
}

/// A single decoded tag: class, number, and content octets.
///
/// Application Boolean is the one oddball: its value lives in the
/// length/value/type field and it has no content octets. It is normalized
/// here to a single content octet of 0 or 1 so the rest of the crate can
/// treat `data` uniformly.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, Eq)]
pub struct Tag {
    /// tag class
    pub class: TagClass,
    /// tag number (0..=255; 15 and above use the extended header octet)
    pub number: u8,
    /// content octets
    pub data: Vec<u8>,
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag({:?}, {}, {})",
            self.class,
            self.number,
            hex::encode(&self.data)
        )
    }
}

impl Tag {
    /// an application-class tag
    pub fn application(number: u8, data: Vec<u8>) -> Self {
        Tag {
            class: TagClass::Application,
            number,
            data,
        }
    }

    /// a context-class tag
    pub fn context(number: u8, data: Vec<u8>) -> Self {
        Tag {
            class: TagClass::Context,
            number,
            data,
        }
    }

    /// an opening constructor tag
    pub fn opening(number: u8) -> Self {
        Tag {
            class: TagClass::Opening,
            number,
            data: vec![],
        }
    }

    /// a closing constructor tag
    pub fn closing(number: u8) -> Self {
        Tag {
            class: TagClass::Closing,
            number,
            data: vec![],
        }
    }

    /// true for an application tag of the given number
    pub fn is_application(&self, number: u8) -> bool {
        self.class == TagClass::Application && self.number == number
    }

    /// true for a context tag of the given number
    pub fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context && self.number == number
    }

    /// true for the opening tag of the given context
    pub fn is_opening(&self, number: u8) -> bool {
        self.class == TagClass::Opening && self.number == number
    }

    /// true for the closing tag of the given context
    pub fn is_closing(&self, number: u8) -> bool {
        self.class == TagClass::Closing && self.number == number
    }

    /// error helper naming this tag
    pub(crate) fn mismatch(&self, expected: &'static str) -> DecodeError {
        DecodeError::InvalidTag {
            expected,
            found: format!("{self:?}"),
        }
    }
}

impl Encodable for Tag {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        let (class_bit, lvt): (u8, u8) = match self.class {
            TagClass::Application => {
                // boolean value rides in the LVT field
                if self.number == number::BOOLEAN {
                    let value = self.data.first().copied().unwrap_or(0);
                    if value > 1 {
                        return Err(EncodeError::OutOfRange("boolean"));
                    }
                    (0, value)
                } else {
                    (0, length_lvt(self.data.len()))
                }
            }
            TagClass::Context => (1, length_lvt(self.data.len())),
            TagClass::Opening => (1, 6),
            TagClass::Closing => (1, 7),
        };

        if self.number < 15 {
            e.write_u8((self.number << 4) | (class_bit << 3) | lvt)?;
        } else {
            e.write_u8(0xF0 | (class_bit << 3) | lvt)?;
            e.write_u8(self.number)?;
        }

        // extended length escapes
        if lvt == 5 {
            let len = self.data.len();
            if len < 254 {
                e.write_u8(len as u8)?;
            } else if len <= u16::MAX as usize {
                e.write_u8(254)?;
                e.write_u16(len as u16)?;
            } else if len <= u32::MAX as usize {
                e.write_u8(255)?;
                e.write_u32(len as u32)?;
            } else {
                return Err(EncodeError::TooLong {
                    len,
                    max: u32::MAX as usize,
                });
            }
        }

        if matches!(self.class, TagClass::Opening | TagClass::Closing)
            || self.is_application(number::BOOLEAN)
        {
            return Ok(());
        }
        e.write_slice(&self.data)
    }
}

// length field for the header octet; 5 escapes to trailing octets
fn length_lvt(len: usize) -> u8 {
    if len <= 4 { len as u8 } else { 5 }
}

impl Decodable for Tag {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let header = decoder.read_u8()?;
        let number = if header & 0xF0 == 0xF0 {
            decoder.read_u8()?
        } else {
            header >> 4
        };
        let context = header & 0x08 != 0;
        let lvt = header & 0x07;

        let (class, len) = match (context, lvt) {
            (true, 6) => return Ok(Tag::opening(number)),
            (true, 7) => return Ok(Tag::closing(number)),
            (false, lvt) if number == number::BOOLEAN && header & 0xF0 != 0xF0 => {
                // application boolean: value in LVT, no content
                if lvt > 1 {
                    return Err(DecodeError::OutOfRange("boolean"));
                }
                return Ok(Tag::application(number::BOOLEAN, vec![lvt]));
            }
            (ctx, lvt @ 0..=4) => (class_of(ctx), lvt as usize),
            (ctx, 5) => {
                let len = match decoder.read_u8()? {
                    254 => decoder.read_u16()? as usize,
                    255 => decoder.read_u32()? as usize,
                    n => n as usize,
                };
                (class_of(ctx), len)
            }
            _ => {
                return Err(DecodeError::InvalidTag {
                    expected: "tag header",
                    found: format!("header {header:#04x}"),
                });
            }
        };

        let data = decoder.read_slice(len)?.to_vec();
        Ok(Tag { class, number, data })
    }
}

fn class_of(context: bool) -> TagClass {
    if context {
        TagClass::Context
    } else {
        TagClass::Application
    }
}

/// Ordered sequence of tags with a read cursor.
///
/// Decoding a production works by popping tags off the front; `peek` supports
/// the one-tag lookahead that optional elements and choices need.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList {
    tags: Vec<Tag>,
    #[cfg_attr(feature = "serde", serde(skip))]
    cursor: usize,
}

impl TagList {
    /// empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// append a tag
    pub fn push(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    /// look at the next unread tag
    pub fn peek(&self) -> Option<&Tag> {
        self.tags.get(self.cursor)
    }

    /// consume and return the next tag
    pub fn pop(&mut self) -> Option<Tag> {
        let tag = self.tags.get(self.cursor).cloned();
        if tag.is_some() {
            self.cursor += 1;
        }
        tag
    }

    /// put the cursor back one tag; used after a failed choice probe
    pub fn unpop(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// number of unread tags
    pub fn remaining(&self) -> usize {
        self.tags.len() - self.cursor
    }

    /// true when every tag has been read
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.tags.len()
    }

    /// all tags regardless of cursor
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// reset the read cursor to the front
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Consume tags up to (not including) the closing tag of `context`,
    /// balancing any nested opening/closing pairs, and return them as a
    /// fresh list. The caller has already consumed the opening tag; the
    /// matching closing tag is consumed here.
    pub fn pop_until_closing(&mut self, context: u8) -> DecodeResult<TagList> {
        let mut inner = TagList::new();
        let mut depth: u32 = 0;
        loop {
            let tag = self
                .pop()
                .ok_or(DecodeError::UnbalancedTags(context))?;
            match tag.class {
                TagClass::Closing if depth == 0 => {
                    if tag.number != context {
                        return Err(DecodeError::UnbalancedTags(context));
                    }
                    return Ok(inner);
                }
                TagClass::Opening => {
                    depth += 1;
                    inner.push(tag);
                }
                TagClass::Closing => {
                    depth -= 1;
                    inner.push(tag);
                }
                _ => inner.push(tag),
            }
        }
    }
}

impl FromIterator<Tag> for TagList {
    fn from_iter<T: IntoIterator<Item = Tag>>(iter: T) -> Self {
        TagList {
            tags: iter.into_iter().collect(),
            cursor: 0,
        }
    }
}

impl Encodable for TagList {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        self.tags.iter().try_for_each(|tag| tag.encode(e))
    }
}

impl Decodable for TagList {
    /// Decode tags until the buffer is exhausted, checking that constructor
    /// tags balance.
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let mut tags = Vec::new();
        let mut stack: Vec<u8> = Vec::new();
        while !decoder.is_empty() {
            let tag = Tag::decode(decoder)?;
            match tag.class {
                TagClass::Opening => stack.push(tag.number),
                TagClass::Closing => match stack.pop() {
                    Some(open) if open == tag.number => {}
                    _ => return Err(DecodeError::UnbalancedTags(tag.number)),
                },
                _ => {}
            }
            tags.push(tag);
        }
        if let Some(open) = stack.pop() {
            return Err(DecodeError::UnbalancedTags(open));
        }
        Ok(TagList { tags, cursor: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tag: Tag) -> Tag {
        let bytes = tag.to_vec().unwrap();
        let decoded = Tag::from_bytes(&bytes).unwrap();
        assert!(
            Decoder::new(&bytes).read_slice(bytes.len()).is_ok(),
            "sanity"
        );
        decoded
    }

    #[test]
    fn small_app_tag() {
        let tag = Tag::application(number::UNSIGNED, vec![0x2A]);
        assert_eq!(tag.to_vec().unwrap(), vec![0x21, 0x2A]);
        assert_eq!(roundtrip(tag.clone()), tag);
    }

    #[test]
    fn context_tag_header() {
        let tag = Tag::context(3, vec![0x01, 0x02]);
        assert_eq!(tag.to_vec().unwrap(), vec![0x3A, 0x01, 0x02]);
        assert_eq!(roundtrip(tag.clone()), tag);
    }

    #[test]
    fn opening_closing() {
        assert_eq!(Tag::opening(4).to_vec().unwrap(), vec![0x4E]);
        assert_eq!(Tag::closing(4).to_vec().unwrap(), vec![0x4F]);
    }

    #[test]
    fn extended_tag_number() {
        let tag = Tag::context(200, vec![0x01]);
        assert_eq!(tag.to_vec().unwrap(), vec![0xF9, 200, 0x01]);
        assert_eq!(roundtrip(tag.clone()), tag);
        // the escape boundary and the top of the range
        for number in [14u8, 15, 255] {
            let tag = Tag::context(number, vec![0x02]);
            assert_eq!(roundtrip(tag.clone()), tag);
        }
        assert_eq!(Tag::context(14, vec![0x02]).to_vec().unwrap().len(), 2);
        assert_eq!(Tag::context(15, vec![0x02]).to_vec().unwrap().len(), 3);
    }

    #[test]
    fn boolean_value_in_lvt() {
        let t = Tag::application(number::BOOLEAN, vec![1]);
        assert_eq!(t.to_vec().unwrap(), vec![0x11]);
        assert_eq!(roundtrip(t.clone()), t);
        let f = Tag::application(number::BOOLEAN, vec![0]);
        assert_eq!(f.to_vec().unwrap(), vec![0x10]);
    }

    #[test]
    fn length_escapes() {
        // boundary widths from 20.2.1.3.1: inline, one-octet, two-octet, four-octet
        for len in [0usize, 1, 4, 5, 253, 254, 255, u16::MAX as usize + 1] {
            let tag = Tag::application(number::OCTET_STRING, vec![0xAB; len]);
            let bytes = tag.to_vec().unwrap();
            let decoded = Tag::from_bytes(&bytes).unwrap();
            assert_eq!(decoded.data.len(), len, "length {len}");
        }
        // spot-check the escape octets
        let bytes = Tag::application(number::OCTET_STRING, vec![0; 5])
            .to_vec()
            .unwrap();
        assert_eq!(&bytes[..2], &[0x65, 5]);
        let bytes = Tag::application(number::OCTET_STRING, vec![0; 300])
            .to_vec()
            .unwrap();
        assert_eq!(&bytes[..4], &[0x65, 254, 0x01, 0x2C]);
    }

    #[test]
    fn taglist_balance_enforced() {
        // opening 2 ... closing 3 must not decode
        let bytes = [0x2E, 0x3F];
        assert!(TagList::from_bytes(&bytes).is_err());
        // matched pair decodes
        let bytes = [0x2E, 0x2F];
        let list = TagList::from_bytes(&bytes).unwrap();
        assert_eq!(list.remaining(), 2);
        // dangling opening is rejected
        assert!(TagList::from_bytes(&[0x2E]).is_err());
    }

    #[test]
    fn pop_until_closing_balances_nested() {
        let mut list: TagList = [
            Tag::opening(1),
            Tag::application(number::UNSIGNED, vec![1]),
            Tag::closing(1),
            Tag::application(number::UNSIGNED, vec![2]),
        ]
        .into_iter()
        .collect();
        // consume the opening ourselves, as a decoder would
        assert!(list.pop().unwrap().is_opening(1));
        let inner = list.pop_until_closing(1).unwrap();
        assert_eq!(inner.remaining(), 1);
        assert_eq!(list.remaining(), 1);
    }
}
