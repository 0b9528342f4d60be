//! Constructed data: sequences, choices, arrays, and the `Any` holder
//!
//! Service parameter productions are ordered sequences of elements, each
//! either application-tagged or wrapped in a declared context tag.
//! [`SequenceWriter`] and [`SequenceReader`] capture that shape; every
//! service type in the crate encodes through them.
//!
//! [`Any`] carries an uninterpreted tag list for late-bound decoding: the
//! wire position says "some value", the declared property type says which,
//! and `cast_out`/`decode_as` meet in the middle.

use crate::{
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeResult},
    primitives::{BitString, Date, Enumerated, Null, ObjectIdentifier, OctetString, Primitive, Time},
    tag::{Tag, TagClass, TagList},
};

/// An uninterpreted value: the tags between one decode boundary and the next.
///
/// Extracting from a context-wrapped position balances nested constructors;
/// interpreting the payload is deferred until a declared type is known.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Any(TagList);

impl Any {
    /// empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// wrap an existing tag list
    pub fn from_tags(tags: TagList) -> Self {
        Any(tags)
    }

    /// the raw tags
    pub fn tags(&self) -> &TagList {
        &self.0
    }

    /// serialize a primitive into the payload
    pub fn cast_in<T: Primitive>(value: &T) -> EncodeResult<Self> {
        let mut tags = TagList::new();
        tags.push(value.to_tag()?);
        Ok(Any(tags))
    }

    /// serialize a typed property value into the payload
    pub fn from_value(value: &PropertyValue) -> EncodeResult<Self> {
        let mut tags = TagList::new();
        value.write_tags(&mut tags)?;
        Ok(Any(tags))
    }

    /// decode the payload as a single primitive
    pub fn cast_out<T: Primitive>(&self) -> DecodeResult<T> {
        let mut tags = self.0.clone();
        tags.rewind();
        let tag = tags.pop().ok_or(DecodeError::NotEnoughBytes)?;
        let value = T::from_tag(&tag)?;
        if !tags.is_exhausted() {
            return Err(DecodeError::OutOfRange("trailing tags in Any"));
        }
        Ok(value)
    }

    /// decode the payload against a declared type
    pub fn decode_as(&self, spec: &TypeSpec) -> DecodeResult<PropertyValue> {
        let mut tags = self.0.clone();
        tags.rewind();
        let value = PropertyValue::read_tags(&mut tags, spec)?;
        if !tags.is_exhausted() {
            return Err(DecodeError::OutOfRange("trailing tags in Any"));
        }
        Ok(value)
    }
}

impl Encodable for Any {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        self.0.encode(e)
    }
}

impl Decodable for Any {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        Ok(Any(TagList::decode(decoder)?))
    }
}

/// A declared element type, as found in an object class property table.
///
/// Array carries an optional fixed length; index 0 addresses the length,
/// index i >= 1 the i-th element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpec {
    Null,
    Boolean,
    Unsigned,
    Integer,
    Real,
    Double,
    OctetString,
    CharacterString,
    BitString,
    Enumerated,
    Date,
    Time,
    ObjectIdentifier,
    /// homogeneous array, optionally of fixed length
    Array(Box<TypeSpec>, Option<u32>),
    /// homogeneous list
    List(Box<TypeSpec>),
    /// a constructed production the registry does not model element-wise
    Opaque,
}

impl TypeSpec {
    /// an array of this element type
    pub fn array_of(self) -> TypeSpec {
        TypeSpec::Array(Box::new(self), None)
    }

    /// a fixed-length array of this element type
    pub fn array_of_len(self, len: u32) -> TypeSpec {
        TypeSpec::Array(Box::new(self), Some(len))
    }

    /// a list of this element type
    pub fn list_of(self) -> TypeSpec {
        TypeSpec::List(Box::new(self))
    }

    /// the type seen when reading the array at `index`; `None` for scalars
    pub fn at_index(&self, index: u32) -> Option<TypeSpec> {
        match self {
            TypeSpec::Array(elem, _) => {
                if index == 0 {
                    Some(TypeSpec::Unsigned)
                } else {
                    Some((**elem).clone())
                }
            }
            _ => None,
        }
    }
}

/// A decoded property value, mirroring [`TypeSpec`]
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Integer(i64),
    Real(f32),
    Double(f64),
    OctetString(OctetString),
    CharacterString(String),
    BitString(BitString),
    Enumerated(Enumerated),
    Date(Date),
    Time(Time),
    ObjectIdentifier(ObjectIdentifier),
    Array(Vec<PropertyValue>),
    List(Vec<PropertyValue>),
    /// constructed value kept as raw tags
    Constructed(TagList),
}

impl PropertyValue {
    /// append this value's tags to `tags`
    pub fn write_tags(&self, tags: &mut TagList) -> EncodeResult<()> {
        match self {
            PropertyValue::Null => tags.push(Null.to_tag()?),
            PropertyValue::Boolean(v) => tags.push(v.to_tag()?),
            PropertyValue::Unsigned(v) => tags.push(v.to_tag()?),
            PropertyValue::Integer(v) => tags.push(v.to_tag()?),
            PropertyValue::Real(v) => tags.push(v.to_tag()?),
            PropertyValue::Double(v) => tags.push(v.to_tag()?),
            PropertyValue::OctetString(v) => tags.push(v.to_tag()?),
            PropertyValue::CharacterString(v) => tags.push(v.to_tag()?),
            PropertyValue::BitString(v) => tags.push(v.to_tag()?),
            PropertyValue::Enumerated(v) => tags.push(v.to_tag()?),
            PropertyValue::Date(v) => tags.push(v.to_tag()?),
            PropertyValue::Time(v) => tags.push(v.to_tag()?),
            PropertyValue::ObjectIdentifier(v) => tags.push(v.to_tag()?),
            PropertyValue::Array(elems) | PropertyValue::List(elems) => {
                for elem in elems {
                    elem.write_tags(tags)?;
                }
            }
            PropertyValue::Constructed(inner) => {
                for tag in inner.tags() {
                    tags.push(tag.clone());
                }
            }
        }
        Ok(())
    }

    /// read one value of declared type `spec` from the tag cursor
    pub fn read_tags(tags: &mut TagList, spec: &TypeSpec) -> DecodeResult<PropertyValue> {
        fn prim<T: Primitive>(tags: &mut TagList) -> DecodeResult<T> {
            let tag = tags.pop().ok_or(DecodeError::NotEnoughBytes)?;
            T::from_tag(&tag)
        }

        Ok(match spec {
            TypeSpec::Null => {
                prim::<Null>(tags)?;
                PropertyValue::Null
            }
            TypeSpec::Boolean => PropertyValue::Boolean(prim(tags)?),
            TypeSpec::Unsigned => PropertyValue::Unsigned(prim(tags)?),
            TypeSpec::Integer => PropertyValue::Integer(prim(tags)?),
            TypeSpec::Real => PropertyValue::Real(prim(tags)?),
            TypeSpec::Double => PropertyValue::Double(prim(tags)?),
            TypeSpec::OctetString => PropertyValue::OctetString(prim(tags)?),
            TypeSpec::CharacterString => PropertyValue::CharacterString(prim(tags)?),
            TypeSpec::BitString => PropertyValue::BitString(prim(tags)?),
            TypeSpec::Enumerated => PropertyValue::Enumerated(prim(tags)?),
            TypeSpec::Date => PropertyValue::Date(prim(tags)?),
            TypeSpec::Time => PropertyValue::Time(prim(tags)?),
            TypeSpec::ObjectIdentifier => PropertyValue::ObjectIdentifier(prim(tags)?),
            TypeSpec::Array(elem, declared_len) => {
                let mut elems = Vec::new();
                while !tags.is_exhausted() {
                    elems.push(PropertyValue::read_tags(tags, elem)?);
                }
                if let Some(len) = declared_len
                    && elems.len() != *len as usize
                {
                    return Err(DecodeError::OutOfRange("fixed array length"));
                }
                PropertyValue::Array(elems)
            }
            TypeSpec::List(elem) => {
                let mut elems = Vec::new();
                while !tags.is_exhausted() {
                    elems.push(PropertyValue::read_tags(tags, elem)?);
                }
                PropertyValue::List(elems)
            }
            TypeSpec::Opaque => {
                let mut inner = TagList::new();
                while let Some(tag) = tags.pop() {
                    inner.push(tag);
                }
                PropertyValue::Constructed(inner)
            }
        })
    }
}

/// Writer for ordered sequences of tagged elements
pub struct SequenceWriter<'a> {
    tags: &'a mut TagList,
}

impl<'a> SequenceWriter<'a> {
    pub fn new(tags: &'a mut TagList) -> Self {
        SequenceWriter { tags }
    }

    /// application-tagged element
    pub fn app<T: Primitive>(&mut self, value: &T) -> EncodeResult<&mut Self> {
        self.tags.push(value.to_tag()?);
        Ok(self)
    }

    /// context-tagged element
    pub fn ctx<T: Primitive>(&mut self, context: u8, value: &T) -> EncodeResult<&mut Self> {
        self.tags.push(value.to_context_tag(context)?);
        Ok(self)
    }

    /// optional context-tagged element; absent writes nothing
    pub fn opt_ctx<T: Primitive>(
        &mut self,
        context: u8,
        value: Option<&T>,
    ) -> EncodeResult<&mut Self> {
        if let Some(v) = value {
            self.ctx(context, v)?;
        }
        Ok(self)
    }

    /// context-wrapped constructed payload (opening tags closing)
    pub fn constructed(&mut self, context: u8, payload: &Any) -> EncodeResult<&mut Self> {
        self.tags.push(Tag::opening(context));
        for tag in payload.tags().tags() {
            self.tags.push(tag.clone());
        }
        self.tags.push(Tag::closing(context));
        Ok(self)
    }

    /// optional context-wrapped constructed payload
    pub fn opt_constructed(
        &mut self,
        context: u8,
        payload: Option<&Any>,
    ) -> EncodeResult<&mut Self> {
        if let Some(p) = payload {
            self.constructed(context, p)?;
        }
        Ok(self)
    }
}

/// Reader for ordered sequences of tagged elements
pub struct SequenceReader<'a> {
    tags: &'a mut TagList,
}

impl<'a> SequenceReader<'a> {
    pub fn new(tags: &'a mut TagList) -> Self {
        SequenceReader { tags }
    }

    /// required application-tagged element
    pub fn app<T: Primitive>(&mut self) -> DecodeResult<T> {
        let tag = self.tags.pop().ok_or(DecodeError::NotEnoughBytes)?;
        T::from_tag(&tag)
    }

    /// required context-tagged element
    pub fn ctx<T: Primitive>(&mut self, context: u8) -> DecodeResult<T> {
        let tag = self.tags.pop().ok_or(DecodeError::NotEnoughBytes)?;
        if !tag.is_context(context) {
            return Err(tag.mismatch(T::NAME));
        }
        T::decode_content(&tag.data)
    }

    /// optional context-tagged element, matched by tag number
    pub fn opt_ctx<T: Primitive>(&mut self, context: u8) -> DecodeResult<Option<T>> {
        match self.tags.peek() {
            Some(tag) if tag.is_context(context) => {
                let tag = self.tags.pop().expect("peeked");
                Ok(Some(T::decode_content(&tag.data)?))
            }
            _ => Ok(None),
        }
    }

    /// required context-wrapped constructed payload
    pub fn constructed(&mut self, context: u8) -> DecodeResult<Any> {
        let tag = self.tags.pop().ok_or(DecodeError::NotEnoughBytes)?;
        if !tag.is_opening(context) {
            return Err(tag.mismatch("opening tag"));
        }
        Ok(Any::from_tags(self.tags.pop_until_closing(context)?))
    }

    /// optional context-wrapped constructed payload
    pub fn opt_constructed(&mut self, context: u8) -> DecodeResult<Option<Any>> {
        match self.tags.peek() {
            Some(tag) if tag.is_opening(context) => Ok(Some(self.constructed(context)?)),
            _ => Ok(None),
        }
    }

    /// true when the sequence has no unread elements
    pub fn at_end(&self) -> bool {
        self.tags.is_exhausted()
    }

    /// true when the next tag opens the given context
    pub fn peek_opening(&self, context: u8) -> bool {
        matches!(self.tags.peek(), Some(t) if t.is_opening(context))
    }

    /// true when the next tag is the given context tag
    pub fn peek_ctx(&self, context: u8) -> bool {
        matches!(self.tags.peek(), Some(t) if t.is_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    #[test]
    fn any_cast_roundtrip() {
        let any = Any::cast_in(&String::from("pump room")).unwrap();
        assert_eq!(any.cast_out::<String>().unwrap(), "pump room");
        // wrong type is refused
        assert!(any.cast_out::<f32>().is_err());
    }

    #[test]
    fn any_rejects_trailing_tags() {
        let mut tags = TagList::new();
        tags.push(42u64.to_tag().unwrap());
        tags.push(43u64.to_tag().unwrap());
        assert!(Any::from_tags(tags).cast_out::<u64>().is_err());
    }

    #[test]
    fn decode_as_array() {
        let spec = TypeSpec::ObjectIdentifier.array_of();
        let mut tags = TagList::new();
        tags.push(ObjectIdentifier::device(1).to_tag().unwrap());
        tags.push(
            ObjectIdentifier::new(ObjectType::AnalogInput, 3)
                .to_tag()
                .unwrap(),
        );
        let value = Any::from_tags(tags).decode_as(&spec).unwrap();
        match value {
            PropertyValue::Array(elems) => assert_eq!(elems.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn fixed_array_length_enforced() {
        let spec = TypeSpec::Real.array_of_len(2);
        let mut tags = TagList::new();
        tags.push(1.0f32.to_tag().unwrap());
        assert!(Any::from_tags(tags).decode_as(&spec).is_err());
    }

    #[test]
    fn sequence_optional_elements() {
        // write: ctx0 objid, optional ctx2 missing, ctx3 present
        let mut tags = TagList::new();
        let mut w = SequenceWriter::new(&mut tags);
        w.ctx(0, &ObjectIdentifier::device(9)).unwrap();
        w.opt_ctx::<u64>(2, None).unwrap();
        w.ctx(3, &7u64).unwrap();

        let mut r = SequenceReader::new(&mut tags);
        assert_eq!(
            r.ctx::<ObjectIdentifier>(0).unwrap(),
            ObjectIdentifier::device(9)
        );
        assert_eq!(r.opt_ctx::<u64>(2).unwrap(), None);
        assert_eq!(r.ctx::<u64>(3).unwrap(), 7);
        assert!(r.at_end());
    }

    #[test]
    fn constructed_payload_balances() {
        let payload = Any::cast_in(&1.5f32).unwrap();
        let mut tags = TagList::new();
        let mut w = SequenceWriter::new(&mut tags);
        w.constructed(3, &payload).unwrap();

        let mut r = SequenceReader::new(&mut tags);
        let out = r.constructed(3).unwrap();
        assert_eq!(out.cast_out::<f32>().unwrap(), 1.5);
        assert!(r.at_end());
    }

    #[test]
    fn property_value_roundtrip_through_any() {
        let value = PropertyValue::List(vec![
            PropertyValue::Enumerated(Enumerated(3)),
            PropertyValue::Enumerated(Enumerated(5)),
        ]);
        let any = Any::from_value(&value).unwrap();
        let spec = TypeSpec::Enumerated.list_of();
        assert_eq!(any.decode_as(&spec).unwrap(), value);
    }
}
