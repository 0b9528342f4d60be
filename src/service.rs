//! Application service parameter types (Clause 21 productions)
//!
//! Each service request/ack is an ordered sequence of tagged elements,
//! encoded through [`SequenceWriter`]/[`SequenceReader`]. The types here
//! are pure data; the application layer decides what to do with them.

use crate::{
    apdu::{ErrorClass, ErrorCode, Segmentation},
    constructed::{Any, SequenceReader, SequenceWriter},
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeResult},
    object::PropertyIdentifier,
    primitives::{BitString, Date, Enumerated, ObjectIdentifier, Primitive, Time},
    tag::TagList,
};

/// A service production: an ordered sequence of tagged parameters
pub trait ServiceParameters: Sized {
    /// append the parameters to a tag list
    fn write(&self, tags: &mut TagList) -> EncodeResult<()>;

    /// read the parameters off a tag list
    fn read(tags: &mut TagList) -> DecodeResult<Self>;

    /// encode to APDU parameter octets
    fn to_bytes(&self) -> EncodeResult<Vec<u8>> {
        let mut tags = TagList::new();
        self.write(&mut tags)?;
        let mut buf = Vec::new();
        tags.encode(&mut Encoder::new(&mut buf))?;
        Ok(buf)
    }

    /// decode from APDU parameter octets
    fn from_bytes(bytes: &[u8]) -> DecodeResult<Self> {
        let mut tags = TagList::decode(&mut Decoder::new(bytes))?;
        Self::read(&mut tags)
    }
}

fn pid_enum(pid: PropertyIdentifier) -> Enumerated {
    Enumerated(u32::from(pid))
}

fn read_pid(r: &mut SequenceReader<'_>, context: u8) -> DecodeResult<PropertyIdentifier> {
    Ok(PropertyIdentifier::from(r.ctx::<Enumerated>(context)?.0))
}

/// Who-Is, unconfirmed service 8
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoIs {
    /// low end of the instance range filter
    pub low_limit: Option<u32>,
    /// high end of the instance range filter
    pub high_limit: Option<u32>,
}

impl WhoIs {
    /// ask for a range of device instances
    pub fn range(low: u32, high: u32) -> Self {
        WhoIs {
            low_limit: Some(low),
            high_limit: Some(high),
        }
    }

    /// true when `instance` falls inside the filter
    pub fn matches(&self, instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => (low..=high).contains(&instance),
            _ => true,
        }
    }
}

impl ServiceParameters for WhoIs {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.opt_ctx(0, self.low_limit.map(u64::from).as_ref())?;
        w.opt_ctx(1, self.high_limit.map(u64::from).as_ref())?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        let low_limit: Option<u64> = r.opt_ctx(0)?;
        let high_limit: Option<u64> = r.opt_ctx(1)?;
        // the limits come as a pair
        if low_limit.is_some() != high_limit.is_some() {
            return Err(DecodeError::MissingElement("device instance range limit"));
        }
        Ok(WhoIs {
            low_limit: low_limit.map(|v| v as u32),
            high_limit: high_limit.map(|v| v as u32),
        })
    }
}

/// I-Am, unconfirmed service 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAm {
    /// the responding device
    pub device_identifier: ObjectIdentifier,
    /// largest APDU the device accepts
    pub max_apdu_length_accepted: u16,
    /// segmentation support
    pub segmentation_supported: Segmentation,
    /// the device's vendor
    pub vendor_identifier: u16,
}

impl ServiceParameters for IAm {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.app(&self.device_identifier)?;
        w.app(&u64::from(self.max_apdu_length_accepted))?;
        w.app(&self.segmentation_supported.to_enumerated())?;
        w.app(&u64::from(self.vendor_identifier))?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        let device_identifier: ObjectIdentifier = r.app()?;
        let max_apdu: u64 = r.app()?;
        let segmentation: Enumerated = r.app()?;
        let vendor: u64 = r.app()?;
        Ok(IAm {
            device_identifier,
            max_apdu_length_accepted: max_apdu
                .try_into()
                .map_err(|_| DecodeError::OutOfRange("max-apdu-length-accepted"))?,
            segmentation_supported: Segmentation::try_from(segmentation.0)?,
            vendor_identifier: vendor
                .try_into()
                .map_err(|_| DecodeError::OutOfRange("vendor-identifier"))?,
        })
    }
}

/// what a Who-Has asks about: an identifier or a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoHasObject {
    /// match by object identifier
    Identifier(ObjectIdentifier),
    /// match by object name
    Name(String),
}

/// Who-Has, unconfirmed service 7
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHas {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    /// the object being looked for
    pub object: WhoHasObject,
}

impl ServiceParameters for WhoHas {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.opt_ctx(0, self.low_limit.map(u64::from).as_ref())?;
        w.opt_ctx(1, self.high_limit.map(u64::from).as_ref())?;
        match &self.object {
            WhoHasObject::Identifier(oid) => w.ctx(2, oid)?,
            WhoHasObject::Name(name) => w.ctx(3, name)?,
        };
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        let low_limit: Option<u64> = r.opt_ctx(0)?;
        let high_limit: Option<u64> = r.opt_ctx(1)?;
        let object = if r.peek_ctx(2) {
            WhoHasObject::Identifier(r.ctx(2)?)
        } else if r.peek_ctx(3) {
            WhoHasObject::Name(r.ctx(3)?)
        } else {
            return Err(DecodeError::NoMatchingChoice("who-has object"));
        };
        Ok(WhoHas {
            low_limit: low_limit.map(|v| v as u32),
            high_limit: high_limit.map(|v| v as u32),
            object,
        })
    }
}

/// I-Have, unconfirmed service 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHave {
    pub device_identifier: ObjectIdentifier,
    pub object_identifier: ObjectIdentifier,
    pub object_name: String,
}

impl ServiceParameters for IHave {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.app(&self.device_identifier)?;
        w.app(&self.object_identifier)?;
        w.app(&self.object_name)?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(IHave {
            device_identifier: r.app()?,
            object_identifier: r.app()?,
            object_name: r.app()?,
        })
    }
}

/// ReadProperty request, confirmed service 12
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadProperty {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
}

impl ReadProperty {
    /// read a whole property
    pub fn new(object_identifier: ObjectIdentifier, property_identifier: PropertyIdentifier) -> Self {
        ReadProperty {
            object_identifier,
            property_identifier,
            property_array_index: None,
        }
    }

    /// read one array element (0 reads the length)
    pub fn at_index(mut self, index: u32) -> Self {
        self.property_array_index = Some(index);
        self
    }
}

impl ServiceParameters for ReadProperty {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &self.object_identifier)?;
        w.ctx(1, &pid_enum(self.property_identifier))?;
        w.opt_ctx(2, self.property_array_index.map(u64::from).as_ref())?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(ReadProperty {
            object_identifier: r.ctx(0)?,
            property_identifier: read_pid(&mut r, 1)?,
            property_array_index: r.opt_ctx::<u64>(2)?.map(|v| v as u32),
        })
    }
}

/// ReadProperty acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    /// the value, decoded on demand against the declared type
    pub property_value: Any,
}

impl ServiceParameters for ReadPropertyAck {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &self.object_identifier)?;
        w.ctx(1, &pid_enum(self.property_identifier))?;
        w.opt_ctx(2, self.property_array_index.map(u64::from).as_ref())?;
        w.constructed(3, &self.property_value)?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(ReadPropertyAck {
            object_identifier: r.ctx(0)?,
            property_identifier: read_pid(&mut r, 1)?,
            property_array_index: r.opt_ctx::<u64>(2)?.map(|v| v as u32),
            property_value: r.constructed(3)?,
        })
    }
}

/// WriteProperty request, confirmed service 15
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProperty {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub property_value: Any,
    /// command priority 1..=16; Null values are admissible only with this set
    pub priority: Option<u8>,
}

impl ServiceParameters for WriteProperty {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &self.object_identifier)?;
        w.ctx(1, &pid_enum(self.property_identifier))?;
        w.opt_ctx(2, self.property_array_index.map(u64::from).as_ref())?;
        w.constructed(3, &self.property_value)?;
        w.opt_ctx(4, self.priority.map(u64::from).as_ref())?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(WriteProperty {
            object_identifier: r.ctx(0)?,
            property_identifier: read_pid(&mut r, 1)?,
            property_array_index: r.opt_ctx::<u64>(2)?.map(|v| v as u32),
            property_value: r.constructed(3)?,
            priority: r.opt_ctx::<u64>(4)?.map(|v| v as u8),
        })
    }
}

/// A property reference inside a read-access specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(property_identifier: PropertyIdentifier) -> Self {
        PropertyReference {
            property_identifier,
            property_array_index: None,
        }
    }
}

/// One object's worth of a ReadPropertyMultiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object_identifier: ObjectIdentifier,
    pub property_references: Vec<PropertyReference>,
}

/// ReadPropertyMultiple request, confirmed service 14
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultiple {
    pub specifications: Vec<ReadAccessSpecification>,
}

impl ServiceParameters for ReadPropertyMultiple {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        for spec in &self.specifications {
            let mut w = SequenceWriter::new(tags);
            w.ctx(0, &spec.object_identifier)?;
            let mut inner = TagList::new();
            {
                let mut iw = SequenceWriter::new(&mut inner);
                for prop in &spec.property_references {
                    iw.ctx(0, &pid_enum(prop.property_identifier))?;
                    iw.opt_ctx(1, prop.property_array_index.map(u64::from).as_ref())?;
                }
            }
            w.constructed(1, &Any::from_tags(inner))?;
        }
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut specifications = Vec::new();
        let mut r = SequenceReader::new(tags);
        while !r.at_end() {
            let object_identifier = r.ctx(0)?;
            let inner = r.constructed(1)?;
            let mut inner_tags = inner.tags().clone();
            inner_tags.rewind();
            let mut property_references = Vec::new();
            let mut ir = SequenceReader::new(&mut inner_tags);
            while !ir.at_end() {
                property_references.push(PropertyReference {
                    property_identifier: read_pid(&mut ir, 0)?,
                    property_array_index: ir.opt_ctx::<u64>(1)?.map(|v| v as u32),
                });
            }
            specifications.push(ReadAccessSpecification {
                object_identifier,
                property_references,
            });
        }
        Ok(ReadPropertyMultiple { specifications })
    }
}

/// An error as carried inside service results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResult {
    pub error_class: ErrorClass,
    pub error_code: ErrorCode,
}

/// value-or-error for one property of a ReadPropertyMultiple ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Value(Any),
    Error(ErrorResult),
}

/// One property's outcome in a read-access result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyResult {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub result: ReadResult,
}

/// One object's worth of a ReadPropertyMultiple ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessResult {
    pub object_identifier: ObjectIdentifier,
    pub results: Vec<PropertyResult>,
}

/// ReadPropertyMultiple acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultipleAck {
    pub results: Vec<ReadAccessResult>,
}

impl ServiceParameters for ReadPropertyMultipleAck {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        for access in &self.results {
            let mut w = SequenceWriter::new(tags);
            w.ctx(0, &access.object_identifier)?;
            let mut inner = TagList::new();
            {
                let mut iw = SequenceWriter::new(&mut inner);
                for prop in &access.results {
                    iw.ctx(2, &pid_enum(prop.property_identifier))?;
                    iw.opt_ctx(3, prop.property_array_index.map(u64::from).as_ref())?;
                    match &prop.result {
                        ReadResult::Value(value) => {
                            iw.constructed(4, value)?;
                        }
                        ReadResult::Error(error) => {
                            let mut err_tags = TagList::new();
                            err_tags.push(Enumerated(error.error_class.into()).to_tag()?);
                            err_tags.push(Enumerated(error.error_code.into()).to_tag()?);
                            iw.constructed(5, &Any::from_tags(err_tags))?;
                        }
                    }
                }
            }
            w.constructed(1, &Any::from_tags(inner))?;
        }
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut results = Vec::new();
        let mut r = SequenceReader::new(tags);
        while !r.at_end() {
            let object_identifier = r.ctx(0)?;
            let inner = r.constructed(1)?;
            let mut inner_tags = inner.tags().clone();
            inner_tags.rewind();
            let mut props = Vec::new();
            let mut ir = SequenceReader::new(&mut inner_tags);
            while !ir.at_end() {
                let property_identifier = read_pid(&mut ir, 2)?;
                let property_array_index = ir.opt_ctx::<u64>(3)?.map(|v| v as u32);
                let result = if ir.peek_opening(4) {
                    ReadResult::Value(ir.constructed(4)?)
                } else if ir.peek_opening(5) {
                    let err = ir.constructed(5)?;
                    let mut err_tags = err.tags().clone();
                    err_tags.rewind();
                    let mut er = SequenceReader::new(&mut err_tags);
                    let class: Enumerated = er.app()?;
                    let code: Enumerated = er.app()?;
                    ReadResult::Error(ErrorResult {
                        error_class: class.0.into(),
                        error_code: code.0.into(),
                    })
                } else {
                    return Err(DecodeError::NoMatchingChoice("read access result"));
                };
                props.push(PropertyResult {
                    property_identifier,
                    property_array_index,
                    result,
                });
            }
            results.push(ReadAccessResult {
                object_identifier,
                results: props,
            });
        }
        Ok(ReadPropertyMultipleAck { results })
    }
}

/// One property write inside a write-access specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyWrite {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub value: Any,
    pub priority: Option<u8>,
}

/// One object's worth of a WritePropertyMultiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAccessSpecification {
    pub object_identifier: ObjectIdentifier,
    pub properties: Vec<PropertyWrite>,
}

/// WritePropertyMultiple request, confirmed service 16
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyMultiple {
    pub specifications: Vec<WriteAccessSpecification>,
}

impl ServiceParameters for WritePropertyMultiple {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        for spec in &self.specifications {
            let mut w = SequenceWriter::new(tags);
            w.ctx(0, &spec.object_identifier)?;
            let mut inner = TagList::new();
            {
                let mut iw = SequenceWriter::new(&mut inner);
                for prop in &spec.properties {
                    iw.ctx(0, &pid_enum(prop.property_identifier))?;
                    iw.opt_ctx(1, prop.property_array_index.map(u64::from).as_ref())?;
                    iw.constructed(2, &prop.value)?;
                    iw.opt_ctx(3, prop.priority.map(u64::from).as_ref())?;
                }
            }
            w.constructed(1, &Any::from_tags(inner))?;
        }
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut specifications = Vec::new();
        let mut r = SequenceReader::new(tags);
        while !r.at_end() {
            let object_identifier = r.ctx(0)?;
            let inner = r.constructed(1)?;
            let mut inner_tags = inner.tags().clone();
            inner_tags.rewind();
            let mut properties = Vec::new();
            let mut ir = SequenceReader::new(&mut inner_tags);
            while !ir.at_end() {
                properties.push(PropertyWrite {
                    property_identifier: read_pid(&mut ir, 0)?,
                    property_array_index: ir.opt_ctx::<u64>(1)?.map(|v| v as u32),
                    value: ir.constructed(2)?,
                    priority: ir.opt_ctx::<u64>(3)?.map(|v| v as u8),
                });
            }
            specifications.push(WriteAccessSpecification {
                object_identifier,
                properties,
            });
        }
        Ok(WritePropertyMultiple { specifications })
    }
}

/// SubscribeCOV request, confirmed service 5.
///
/// Omitting both `issue_confirmed_notifications` and `lifetime` cancels the
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCov {
    pub subscriber_process_identifier: u32,
    pub monitored_object_identifier: ObjectIdentifier,
    pub issue_confirmed_notifications: Option<bool>,
    /// seconds; 0 means indefinite
    pub lifetime: Option<u32>,
}

impl SubscribeCov {
    /// true for the unsubscribe form
    pub fn is_cancellation(&self) -> bool {
        self.issue_confirmed_notifications.is_none() && self.lifetime.is_none()
    }
}

impl ServiceParameters for SubscribeCov {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &u64::from(self.subscriber_process_identifier))?;
        w.ctx(1, &self.monitored_object_identifier)?;
        w.opt_ctx(2, self.issue_confirmed_notifications.as_ref())?;
        w.opt_ctx(3, self.lifetime.map(u64::from).as_ref())?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(SubscribeCov {
            subscriber_process_identifier: r.ctx::<u64>(0)? as u32,
            monitored_object_identifier: r.ctx(1)?,
            issue_confirmed_notifications: r.opt_ctx(2)?,
            lifetime: r.opt_ctx::<u64>(3)?.map(|v| v as u32),
        })
    }
}

/// One reported value inside a COV notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovValue {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub value: Any,
}

/// COV notification, confirmed service 1 / unconfirmed service 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovNotification {
    pub subscriber_process_identifier: u32,
    pub initiating_device_identifier: ObjectIdentifier,
    pub monitored_object_identifier: ObjectIdentifier,
    /// seconds left on the subscription; 0 for indefinite
    pub time_remaining: u32,
    pub list_of_values: Vec<CovValue>,
}

impl ServiceParameters for CovNotification {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &u64::from(self.subscriber_process_identifier))?;
        w.ctx(1, &self.initiating_device_identifier)?;
        w.ctx(2, &self.monitored_object_identifier)?;
        w.ctx(3, &u64::from(self.time_remaining))?;
        let mut inner = TagList::new();
        {
            let mut iw = SequenceWriter::new(&mut inner);
            for value in &self.list_of_values {
                iw.ctx(0, &pid_enum(value.property_identifier))?;
                iw.opt_ctx(1, value.property_array_index.map(u64::from).as_ref())?;
                iw.constructed(2, &value.value)?;
            }
        }
        w.constructed(4, &Any::from_tags(inner))?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        let subscriber_process_identifier = r.ctx::<u64>(0)? as u32;
        let initiating_device_identifier = r.ctx(1)?;
        let monitored_object_identifier = r.ctx(2)?;
        let time_remaining = r.ctx::<u64>(3)? as u32;
        let inner = r.constructed(4)?;
        let mut inner_tags = inner.tags().clone();
        inner_tags.rewind();
        let mut list_of_values = Vec::new();
        let mut ir = SequenceReader::new(&mut inner_tags);
        while !ir.at_end() {
            list_of_values.push(CovValue {
                property_identifier: read_pid(&mut ir, 0)?,
                property_array_index: ir.opt_ctx::<u64>(1)?.map(|v| v as u32),
                value: ir.constructed(2)?,
            });
        }
        Ok(CovNotification {
            subscriber_process_identifier,
            initiating_device_identifier,
            monitored_object_identifier,
            time_remaining,
            list_of_values,
        })
    }
}

/// The range selector of a ReadRange request
#[derive(Debug, Clone, PartialEq)]
pub enum ReadRangeSpec {
    /// everything the property holds
    All,
    /// `count` items starting at 1-based position `reference_index`
    ByPosition { reference_index: u32, count: i32 },
    /// `count` items starting at sequence number `reference_sequence`
    BySequenceNumber { reference_sequence: u32, count: i32 },
    /// `count` items from a point in time
    ByTime { date: Date, time: Time, count: i32 },
}

/// ReadRange request, confirmed service 26
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRange {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub range: ReadRangeSpec,
}

impl ServiceParameters for ReadRange {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &self.object_identifier)?;
        w.ctx(1, &pid_enum(self.property_identifier))?;
        w.opt_ctx(2, self.property_array_index.map(u64::from).as_ref())?;
        match &self.range {
            ReadRangeSpec::All => {}
            ReadRangeSpec::ByPosition {
                reference_index,
                count,
            } => {
                let mut inner = TagList::new();
                inner.push(u64::from(*reference_index).to_tag()?);
                inner.push(i64::from(*count).to_tag()?);
                w.constructed(3, &Any::from_tags(inner))?;
            }
            ReadRangeSpec::BySequenceNumber {
                reference_sequence,
                count,
            } => {
                let mut inner = TagList::new();
                inner.push(u64::from(*reference_sequence).to_tag()?);
                inner.push(i64::from(*count).to_tag()?);
                w.constructed(6, &Any::from_tags(inner))?;
            }
            ReadRangeSpec::ByTime { date, time, count } => {
                let mut inner = TagList::new();
                inner.push(date.to_tag()?);
                inner.push(time.to_tag()?);
                inner.push(i64::from(*count).to_tag()?);
                w.constructed(7, &Any::from_tags(inner))?;
            }
        }
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        let object_identifier = r.ctx(0)?;
        let property_identifier = read_pid(&mut r, 1)?;
        let property_array_index = r.opt_ctx::<u64>(2)?.map(|v| v as u32);
        let range = if r.peek_opening(3) {
            let inner = r.constructed(3)?;
            let mut it = inner.tags().clone();
            it.rewind();
            let mut ir = SequenceReader::new(&mut it);
            ReadRangeSpec::ByPosition {
                reference_index: ir.app::<u64>()? as u32,
                count: ir.app::<i64>()? as i32,
            }
        } else if r.peek_opening(6) {
            let inner = r.constructed(6)?;
            let mut it = inner.tags().clone();
            it.rewind();
            let mut ir = SequenceReader::new(&mut it);
            ReadRangeSpec::BySequenceNumber {
                reference_sequence: ir.app::<u64>()? as u32,
                count: ir.app::<i64>()? as i32,
            }
        } else if r.peek_opening(7) {
            let inner = r.constructed(7)?;
            let mut it = inner.tags().clone();
            it.rewind();
            let mut ir = SequenceReader::new(&mut it);
            ReadRangeSpec::ByTime {
                date: ir.app()?,
                time: ir.app()?,
                count: ir.app::<i64>()? as i32,
            }
        } else {
            ReadRangeSpec::All
        };
        Ok(ReadRange {
            object_identifier,
            property_identifier,
            property_array_index,
            range,
        })
    }
}

/// ReadRange acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRangeAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    /// {first-item, last-item, more-items}
    pub result_flags: BitString,
    pub item_count: u32,
    pub item_data: Any,
    pub first_sequence_number: Option<u32>,
}

impl ReadRangeAck {
    /// build the result-flags bit string
    pub fn flags(first: bool, last: bool, more: bool) -> BitString {
        BitString::from_bits(&[first, last, more])
    }
}

impl ServiceParameters for ReadRangeAck {
    fn write(&self, tags: &mut TagList) -> EncodeResult<()> {
        let mut w = SequenceWriter::new(tags);
        w.ctx(0, &self.object_identifier)?;
        w.ctx(1, &pid_enum(self.property_identifier))?;
        w.opt_ctx(2, self.property_array_index.map(u64::from).as_ref())?;
        w.ctx(3, &self.result_flags)?;
        w.ctx(4, &u64::from(self.item_count))?;
        w.constructed(5, &self.item_data)?;
        w.opt_ctx(6, self.first_sequence_number.map(u64::from).as_ref())?;
        Ok(())
    }

    fn read(tags: &mut TagList) -> DecodeResult<Self> {
        let mut r = SequenceReader::new(tags);
        Ok(ReadRangeAck {
            object_identifier: r.ctx(0)?,
            property_identifier: read_pid(&mut r, 1)?,
            property_array_index: r.opt_ctx::<u64>(2)?.map(|v| v as u32),
            result_flags: r.ctx(3)?,
            item_count: r.ctx::<u64>(4)? as u32,
            item_data: r.constructed(5)?,
            first_sequence_number: r.opt_ctx::<u64>(6)?.map(|v| v as u32),
        })
    }
}

/// the status-flags bit string {in-alarm, fault, overridden, out-of-service}
pub fn status_flags(in_alarm: bool, fault: bool, overridden: bool, out_of_service: bool) -> BitString {
    BitString::from_bits(&[in_alarm, fault, overridden, out_of_service])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    fn roundtrip<T: ServiceParameters + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = value.to_bytes().unwrap();
        assert_eq!(T::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn who_is_forms() {
        roundtrip(WhoIs::default());
        roundtrip(WhoIs::range(100, 200));
        assert!(WhoIs::range(100, 200).matches(150));
        assert!(!WhoIs::range(100, 200).matches(201));
        assert!(WhoIs::default().matches(5));
        // half a range is malformed
        let half = {
            let mut tags = TagList::new();
            SequenceWriter::new(&mut tags).ctx(0, &100u64).unwrap();
            let mut buf = Vec::new();
            tags.encode(&mut Encoder::new(&mut buf)).unwrap();
            buf
        };
        assert!(WhoIs::from_bytes(&half).is_err());
    }

    #[test]
    fn i_am_wire_form() {
        let iam = IAm {
            device_identifier: ObjectIdentifier::device(150),
            max_apdu_length_accepted: 1476,
            segmentation_supported: Segmentation::SegmentedBoth,
            vendor_identifier: 260,
        };
        let bytes = iam.to_bytes().unwrap();
        // four application tags: objectid, unsigned, enumerated, unsigned
        assert_eq!(bytes[0], 0xC4);
        roundtrip(iam);
    }

    #[test]
    fn who_has_choice() {
        roundtrip(WhoHas {
            low_limit: None,
            high_limit: None,
            object: WhoHasObject::Identifier(ObjectIdentifier::new(ObjectType::AnalogInput, 1)),
        });
        roundtrip(WhoHas {
            low_limit: Some(1),
            high_limit: Some(99),
            object: WhoHasObject::Name("zone-temp".into()),
        });
        roundtrip(IHave {
            device_identifier: ObjectIdentifier::device(9),
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
            object_name: "zone-temp".into(),
        });
    }

    #[test]
    fn read_property_roundtrip() {
        roundtrip(ReadProperty::new(
            ObjectIdentifier::device(150),
            PropertyIdentifier::ObjectName,
        ));
        roundtrip(
            ReadProperty::new(
                ObjectIdentifier::device(150),
                PropertyIdentifier::ObjectList,
            )
            .at_index(0),
        );
        roundtrip(ReadPropertyAck {
            object_identifier: ObjectIdentifier::device(150),
            property_identifier: PropertyIdentifier::ObjectName,
            property_array_index: None,
            property_value: Any::cast_in(&String::from("device-150")).unwrap(),
        });
    }

    #[test]
    fn write_property_with_priority() {
        roundtrip(WriteProperty {
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 2),
            property_identifier: PropertyIdentifier::PresentValue,
            property_array_index: None,
            property_value: Any::cast_in(&72.5f32).unwrap(),
            priority: Some(8),
        });
    }

    #[test]
    fn rpm_roundtrip() {
        roundtrip(ReadPropertyMultiple {
            specifications: vec![
                ReadAccessSpecification {
                    object_identifier: ObjectIdentifier::device(150),
                    property_references: vec![
                        PropertyReference::new(PropertyIdentifier::ObjectName),
                        PropertyReference {
                            property_identifier: PropertyIdentifier::ObjectList,
                            property_array_index: Some(0),
                        },
                    ],
                },
                ReadAccessSpecification {
                    object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
                    property_references: vec![PropertyReference::new(PropertyIdentifier::All)],
                },
            ],
        });
    }

    #[test]
    fn rpm_ack_value_and_error() {
        roundtrip(ReadPropertyMultipleAck {
            results: vec![ReadAccessResult {
                object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
                results: vec![
                    PropertyResult {
                        property_identifier: PropertyIdentifier::PresentValue,
                        property_array_index: None,
                        result: ReadResult::Value(Any::cast_in(&21.0f32).unwrap()),
                    },
                    PropertyResult {
                        property_identifier: PropertyIdentifier::Reliability,
                        property_array_index: None,
                        result: ReadResult::Error(ErrorResult {
                            error_class: ErrorClass::Property,
                            error_code: ErrorCode::UnknownProperty,
                        }),
                    },
                ],
            }],
        });
    }

    #[test]
    fn wpm_roundtrip() {
        roundtrip(WritePropertyMultiple {
            specifications: vec![WriteAccessSpecification {
                object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 2),
                properties: vec![PropertyWrite {
                    property_identifier: PropertyIdentifier::PresentValue,
                    property_array_index: None,
                    value: Any::cast_in(&1.0f32).unwrap(),
                    priority: Some(10),
                }],
            }],
        });
    }

    #[test]
    fn subscribe_cov_forms() {
        roundtrip(SubscribeCov {
            subscriber_process_identifier: 1,
            monitored_object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
            issue_confirmed_notifications: Some(true),
            lifetime: Some(60),
        });
        let cancel = SubscribeCov {
            subscriber_process_identifier: 1,
            monitored_object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
            issue_confirmed_notifications: None,
            lifetime: None,
        };
        assert!(cancel.is_cancellation());
        roundtrip(cancel);
    }

    #[test]
    fn cov_notification_roundtrip() {
        roundtrip(CovNotification {
            subscriber_process_identifier: 1,
            initiating_device_identifier: ObjectIdentifier::device(150),
            monitored_object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
            time_remaining: 58,
            list_of_values: vec![
                CovValue {
                    property_identifier: PropertyIdentifier::PresentValue,
                    property_array_index: None,
                    value: Any::cast_in(&21.5f32).unwrap(),
                },
                CovValue {
                    property_identifier: PropertyIdentifier::StatusFlags,
                    property_array_index: None,
                    value: Any::cast_in(&status_flags(false, false, false, false)).unwrap(),
                },
            ],
        });
    }

    #[test]
    fn read_range_variants() {
        let oid = ObjectIdentifier::new(ObjectType::TrendLog, 1);
        roundtrip(ReadRange {
            object_identifier: oid,
            property_identifier: PropertyIdentifier::Unknown(131),
            property_array_index: None,
            range: ReadRangeSpec::All,
        });
        roundtrip(ReadRange {
            object_identifier: oid,
            property_identifier: PropertyIdentifier::Unknown(131),
            property_array_index: None,
            range: ReadRangeSpec::ByPosition {
                reference_index: 1,
                count: 10,
            },
        });
        roundtrip(ReadRange {
            object_identifier: oid,
            property_identifier: PropertyIdentifier::Unknown(131),
            property_array_index: None,
            range: ReadRangeSpec::BySequenceNumber {
                reference_sequence: 40,
                count: -5,
            },
        });
        roundtrip(ReadRange {
            object_identifier: oid,
            property_identifier: PropertyIdentifier::Unknown(131),
            property_array_index: None,
            range: ReadRangeSpec::ByTime {
                date: Date::new(2024, 6, 15),
                time: Time::new(12, 0, 0, 0),
                count: 3,
            },
        });
        roundtrip(ReadRangeAck {
            object_identifier: oid,
            property_identifier: PropertyIdentifier::Unknown(131),
            property_array_index: None,
            result_flags: ReadRangeAck::flags(true, true, false),
            item_count: 2,
            item_data: Any::cast_in(&1.0f32).unwrap(),
            first_sequence_number: Some(40),
        });
    }
}
