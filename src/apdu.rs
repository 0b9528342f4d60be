//! APDU types and the APCI header codec (Clause 20.1)
//!
//! ```text
//! ConfirmedRequest   type=0 |seg|mor|sa | max-segs/max-resp, invoke-id,
//!                    [seq, window,] service, parameters
//! UnconfirmedRequest type=1, service, parameters
//! SimpleAck          type=2, invoke-id, service
//! ComplexAck         type=3 |seg|mor|, invoke-id, [seq, window,] service, parameters
//! SegmentAck         type=4 |nak|srv|, invoke-id, seq, actual-window
//! Error              type=5, invoke-id, service, error-class, error-code
//! Reject             type=6, invoke-id, reason
//! Abort              type=7 |srv|, invoke-id, reason
//! ```

use crate::{
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeResult},
    primitives::{Enumerated, Primitive},
    tag::TagList,
};

/// Segmentation support advertised in I-Am (Clause 20.1.2.4)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Segmentation {
    /// can segment transmitted and receive segmented
    #[default]
    SegmentedBoth,
    /// can segment transmitted APDUs only
    SegmentedTransmit,
    /// can receive segmented APDUs only
    SegmentedReceive,
    /// no segmentation at all
    NoSegmentation,
}

impl Segmentation {
    /// peer can accept a segmented request from us
    pub fn can_receive(self) -> bool {
        matches!(self, Segmentation::SegmentedBoth | Segmentation::SegmentedReceive)
    }

    /// peer can send a segmented response
    pub fn can_transmit(self) -> bool {
        matches!(self, Segmentation::SegmentedBoth | Segmentation::SegmentedTransmit)
    }
}

impl From<Segmentation> for u32 {
    fn from(s: Segmentation) -> u32 {
        match s {
            Segmentation::SegmentedBoth => 0,
            Segmentation::SegmentedTransmit => 1,
            Segmentation::SegmentedReceive => 2,
            Segmentation::NoSegmentation => 3,
        }
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = DecodeError;

    fn try_from(n: u32) -> DecodeResult<Self> {
        Ok(match n {
            0 => Segmentation::SegmentedBoth,
            1 => Segmentation::SegmentedTransmit,
            2 => Segmentation::SegmentedReceive,
            3 => Segmentation::NoSegmentation,
            _ => return Err(DecodeError::OutOfRange("segmentation-supported")),
        })
    }
}

impl Segmentation {
    /// as the Enumerated carried in I-Am
    pub fn to_enumerated(self) -> Enumerated {
        Enumerated(self.into())
    }
}

/// decode the max-APDU-length-accepted nibble (Clause 20.1.2.5)
pub fn max_apdu_from_code(code: u8) -> u16 {
    match code & 0x0F {
        0 => 50,
        1 => 128,
        2 => 206,
        3 => 480,
        4 => 1024,
        _ => 1476,
    }
}

/// encode a byte count as the largest representable nibble that fits
pub fn max_apdu_code(len: u16) -> u8 {
    match len {
        0..=127 => 0,
        128..=205 => 1,
        206..=479 => 2,
        480..=1023 => 3,
        1024..=1475 => 4,
        _ => 5,
    }
}

/// decode the max-segments-accepted 3-bit field; 0 means unspecified
pub fn max_segments_from_code(code: u8) -> u8 {
    match code & 0x07 {
        0 => 0,
        1 => 2,
        2 => 4,
        3 => 8,
        4 => 16,
        5 => 32,
        6 => 64,
        _ => u8::MAX,
    }
}

/// encode a segment count into the 3-bit field
pub fn max_segments_code(count: u8) -> u8 {
    match count {
        0 | 1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        64..=127 => 6,
        _ => 7,
    }
}

/// Error classes (Clause 18)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Device,
    Object,
    Property,
    Resources,
    Security,
    Services,
    Vt,
    Communication,
    Unknown(u32),
}

impl From<u32> for ErrorClass {
    fn from(n: u32) -> Self {
        use ErrorClass::*;
        match n {
            0 => Device,
            1 => Object,
            2 => Property,
            3 => Resources,
            4 => Security,
            5 => Services,
            6 => Vt,
            7 => Communication,
            n => Unknown(n),
        }
    }
}

impl From<ErrorClass> for u32 {
    fn from(c: ErrorClass) -> u32 {
        use ErrorClass::*;
        match c {
            Device => 0,
            Object => 1,
            Property => 2,
            Resources => 3,
            Security => 4,
            Services => 5,
            Vt => 6,
            Communication => 7,
            Unknown(n) => n,
        }
    }
}

/// Error codes (Clause 18); the subset the stack raises plus a fallback
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 0
    Other,
    /// 2
    ConfigurationInProgress,
    /// 3
    DeviceBusy,
    /// 7
    InconsistentParameters,
    /// 9
    InvalidDataType,
    /// 16
    MissingRequiredParameter,
    /// 20
    NoSpaceToWriteProperty,
    /// 23
    ObjectDeletionNotPermitted,
    /// 25
    OperationalProblem,
    /// 27
    ReadAccessDenied,
    /// 29
    ServiceRequestDenied,
    /// 30
    Timeout,
    /// 31
    UnknownObject,
    /// 32
    UnknownProperty,
    /// 36
    UnsupportedObjectType,
    /// 37
    ValueOutOfRange,
    /// 40
    WriteAccessDenied,
    /// 42
    InvalidArrayIndex,
    /// 43
    CovSubscriptionFailed,
    /// 50
    PropertyIsNotAnArray,
    /// anything else
    Unknown(u32),
}

impl From<u32> for ErrorCode {
    fn from(n: u32) -> Self {
        use ErrorCode::*;
        match n {
            0 => Other,
            2 => ConfigurationInProgress,
            3 => DeviceBusy,
            7 => InconsistentParameters,
            9 => InvalidDataType,
            16 => MissingRequiredParameter,
            20 => NoSpaceToWriteProperty,
            23 => ObjectDeletionNotPermitted,
            25 => OperationalProblem,
            27 => ReadAccessDenied,
            29 => ServiceRequestDenied,
            30 => Timeout,
            31 => UnknownObject,
            32 => UnknownProperty,
            36 => UnsupportedObjectType,
            37 => ValueOutOfRange,
            40 => WriteAccessDenied,
            42 => InvalidArrayIndex,
            43 => CovSubscriptionFailed,
            50 => PropertyIsNotAnArray,
            n => Unknown(n),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(c: ErrorCode) -> u32 {
        use ErrorCode::*;
        match c {
            Other => 0,
            ConfigurationInProgress => 2,
            DeviceBusy => 3,
            InconsistentParameters => 7,
            InvalidDataType => 9,
            MissingRequiredParameter => 16,
            NoSpaceToWriteProperty => 20,
            ObjectDeletionNotPermitted => 23,
            OperationalProblem => 25,
            ReadAccessDenied => 27,
            ServiceRequestDenied => 29,
            Timeout => 30,
            UnknownObject => 31,
            UnknownProperty => 32,
            UnsupportedObjectType => 36,
            ValueOutOfRange => 37,
            WriteAccessDenied => 40,
            InvalidArrayIndex => 42,
            CovSubscriptionFailed => 43,
            PropertyIsNotAnArray => 50,
            Unknown(n) => n,
        }
    }
}

/// Reject reasons (Clause 18.8)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Other,
    BufferOverflow,
    InconsistentParameters,
    InvalidParameterDataType,
    InvalidTag,
    MissingRequiredParameter,
    ParameterOutOfRange,
    TooManyArguments,
    UndefinedEnumeration,
    UnrecognizedService,
    Unknown(u8),
}

impl From<u8> for RejectReason {
    fn from(n: u8) -> Self {
        use RejectReason::*;
        match n {
            0 => Other,
            1 => BufferOverflow,
            2 => InconsistentParameters,
            3 => InvalidParameterDataType,
            4 => InvalidTag,
            5 => MissingRequiredParameter,
            6 => ParameterOutOfRange,
            7 => TooManyArguments,
            8 => UndefinedEnumeration,
            9 => UnrecognizedService,
            n => Unknown(n),
        }
    }
}

impl From<RejectReason> for u8 {
    fn from(r: RejectReason) -> u8 {
        use RejectReason::*;
        match r {
            Other => 0,
            BufferOverflow => 1,
            InconsistentParameters => 2,
            InvalidParameterDataType => 3,
            InvalidTag => 4,
            MissingRequiredParameter => 5,
            ParameterOutOfRange => 6,
            TooManyArguments => 7,
            UndefinedEnumeration => 8,
            UnrecognizedService => 9,
            Unknown(n) => n,
        }
    }
}

/// Abort reasons (Clause 18.9)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Other,
    BufferOverflow,
    InvalidApduInThisState,
    PreemptedByHigherPriorityTask,
    SegmentationNotSupported,
    SecurityError,
    InsufficientSecurity,
    WindowSizeOutOfRange,
    ApplicationExceededReplyTime,
    OutOfResources,
    TsmTimeout,
    ApduTooLong,
    Unknown(u8),
}

impl From<u8> for AbortReason {
    fn from(n: u8) -> Self {
        use AbortReason::*;
        match n {
            0 => Other,
            1 => BufferOverflow,
            2 => InvalidApduInThisState,
            3 => PreemptedByHigherPriorityTask,
            4 => SegmentationNotSupported,
            5 => SecurityError,
            6 => InsufficientSecurity,
            7 => WindowSizeOutOfRange,
            8 => ApplicationExceededReplyTime,
            9 => OutOfResources,
            10 => TsmTimeout,
            11 => ApduTooLong,
            n => Unknown(n),
        }
    }
}

impl From<AbortReason> for u8 {
    fn from(r: AbortReason) -> u8 {
        use AbortReason::*;
        match r {
            Other => 0,
            BufferOverflow => 1,
            InvalidApduInThisState => 2,
            PreemptedByHigherPriorityTask => 3,
            SegmentationNotSupported => 4,
            SecurityError => 5,
            InsufficientSecurity => 6,
            WindowSizeOutOfRange => 7,
            ApplicationExceededReplyTime => 8,
            OutOfResources => 9,
            TsmTimeout => 10,
            ApduTooLong => 11,
            Unknown(n) => n,
        }
    }
}

/// Confirmed service choices (Clause 21)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConfirmedService {
    /// 1
    ConfirmedCovNotification,
    /// 5
    SubscribeCov,
    /// 12
    ReadProperty,
    /// 14
    ReadPropertyMultiple,
    /// 15
    WriteProperty,
    /// 16
    WritePropertyMultiple,
    /// 17
    DeviceCommunicationControl,
    /// 20
    ReinitializeDevice,
    /// 26
    ReadRange,
    /// anything else
    Unknown(u8),
}

impl From<u8> for ConfirmedService {
    fn from(n: u8) -> Self {
        use ConfirmedService::*;
        match n {
            1 => ConfirmedCovNotification,
            5 => SubscribeCov,
            12 => ReadProperty,
            14 => ReadPropertyMultiple,
            15 => WriteProperty,
            16 => WritePropertyMultiple,
            17 => DeviceCommunicationControl,
            20 => ReinitializeDevice,
            26 => ReadRange,
            n => Unknown(n),
        }
    }
}

impl From<ConfirmedService> for u8 {
    fn from(s: ConfirmedService) -> u8 {
        use ConfirmedService::*;
        match s {
            ConfirmedCovNotification => 1,
            SubscribeCov => 5,
            ReadProperty => 12,
            ReadPropertyMultiple => 14,
            WriteProperty => 15,
            WritePropertyMultiple => 16,
            DeviceCommunicationControl => 17,
            ReinitializeDevice => 20,
            ReadRange => 26,
            Unknown(n) => n,
        }
    }
}

/// Unconfirmed service choices (Clause 21)
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnconfirmedService {
    /// 0
    IAm,
    /// 1
    IHave,
    /// 2
    UnconfirmedCovNotification,
    /// 6
    TimeSynchronization,
    /// 7
    WhoHas,
    /// 8
    WhoIs,
    /// 9
    UtcTimeSynchronization,
    /// anything else
    Unknown(u8),
}

impl From<u8> for UnconfirmedService {
    fn from(n: u8) -> Self {
        use UnconfirmedService::*;
        match n {
            0 => IAm,
            1 => IHave,
            2 => UnconfirmedCovNotification,
            6 => TimeSynchronization,
            7 => WhoHas,
            8 => WhoIs,
            9 => UtcTimeSynchronization,
            n => Unknown(n),
        }
    }
}

impl From<UnconfirmedService> for u8 {
    fn from(s: UnconfirmedService) -> u8 {
        use UnconfirmedService::*;
        match s {
            IAm => 0,
            IHave => 1,
            UnconfirmedCovNotification => 2,
            TimeSynchronization => 6,
            WhoHas => 7,
            WhoIs => 8,
            UtcTimeSynchronization => 9,
            Unknown(n) => n,
        }
    }
}

/// Confirmed request APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    /// this APDU is one segment of a larger request
    pub segmented: bool,
    /// more segments follow
    pub more_follows: bool,
    /// sender accepts a segmented response
    pub segmented_response_accepted: bool,
    /// max segments the sender accepts, pre-decoded from the 3-bit field
    pub max_segments: u8,
    /// max APDU length the sender accepts, pre-decoded from the nibble
    pub max_apdu: u16,
    /// correlates the response
    pub invoke_id: u8,
    /// segment sequence number, present when segmented
    pub sequence_number: Option<u8>,
    /// proposed window size, present when segmented
    pub window_size: Option<u8>,
    /// the service being requested
    pub service: ConfirmedService,
    /// TLV-encoded service parameters (or one segment of them)
    pub parameters: Vec<u8>,
}

impl ConfirmedRequest {
    /// an unsegmented request
    pub fn new(invoke_id: u8, service: ConfirmedService, parameters: Vec<u8>) -> Self {
        ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: 0,
            max_apdu: 1476,
            invoke_id,
            sequence_number: None,
            window_size: None,
            service,
            parameters,
        }
    }
}

/// Unconfirmed request APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedRequest {
    /// the service being requested
    pub service: UnconfirmedService,
    /// TLV-encoded service parameters
    pub parameters: Vec<u8>,
}

/// Simple acknowledgement APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleAck {
    pub invoke_id: u8,
    pub service: ConfirmedService,
}

/// Complex acknowledgement APDU (a result payload, possibly segmented)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub segmented: bool,
    pub more_follows: bool,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service: ConfirmedService,
    /// TLV-encoded result (or one segment of it)
    pub parameters: Vec<u8>,
}

impl ComplexAck {
    /// an unsegmented ack
    pub fn new(invoke_id: u8, service: ConfirmedService, parameters: Vec<u8>) -> Self {
        ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            window_size: None,
            service,
            parameters,
        }
    }
}

/// Segment acknowledgement APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// out-of-order segment received
    pub negative: bool,
    /// sent by the server side of the transaction
    pub from_server: bool,
    pub invoke_id: u8,
    /// last in-order sequence number received
    pub sequence_number: u8,
    /// window size the receiver will accept
    pub actual_window_size: u8,
}

/// Error APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service: ConfirmedService,
    pub error_class: ErrorClass,
    pub error_code: ErrorCode,
}

/// Reject APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPdu {
    pub invoke_id: u8,
    pub reason: RejectReason,
}

/// Abort APDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
    /// sent by the server side of the transaction
    pub from_server: bool,
    pub invoke_id: u8,
    pub reason: AbortReason,
}

/// Any APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest(UnconfirmedRequest),
    SimpleAck(SimpleAck),
    ComplexAck(ComplexAck),
    SegmentAck(SegmentAck),
    Error(ErrorPdu),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

impl Apdu {
    /// the invoke id, for the types that carry one
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(r) => Some(r.invoke_id),
            Apdu::UnconfirmedRequest(_) => None,
            Apdu::SimpleAck(a) => Some(a.invoke_id),
            Apdu::ComplexAck(a) => Some(a.invoke_id),
            Apdu::SegmentAck(a) => Some(a.invoke_id),
            Apdu::Error(e) => Some(e.invoke_id),
            Apdu::Reject(r) => Some(r.invoke_id),
            Apdu::Abort(a) => Some(a.invoke_id),
        }
    }
}

const TYPE_CONFIRMED: u8 = 0;
const TYPE_UNCONFIRMED: u8 = 1;
const TYPE_SIMPLE_ACK: u8 = 2;
const TYPE_COMPLEX_ACK: u8 = 3;
const TYPE_SEGMENT_ACK: u8 = 4;
const TYPE_ERROR: u8 = 5;
const TYPE_REJECT: u8 = 6;
const TYPE_ABORT: u8 = 7;

impl Encodable for Apdu {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        match self {
            Apdu::ConfirmedRequest(r) => {
                let mut octet = TYPE_CONFIRMED << 4;
                if r.segmented {
                    octet |= 0x08;
                }
                if r.more_follows {
                    octet |= 0x04;
                }
                if r.segmented_response_accepted {
                    octet |= 0x02;
                }
                e.write_u8(octet)?;
                e.write_u8((max_segments_code(r.max_segments) << 4) | max_apdu_code(r.max_apdu))?;
                e.write_u8(r.invoke_id)?;
                if r.segmented {
                    e.write_u8(r.sequence_number.unwrap_or(0))?;
                    e.write_u8(r.window_size.unwrap_or(1))?;
                }
                e.write_u8(r.service.into())?;
                e.write_slice(&r.parameters)
            }
            Apdu::UnconfirmedRequest(r) => {
                e.write_u8(TYPE_UNCONFIRMED << 4)?;
                e.write_u8(r.service.into())?;
                e.write_slice(&r.parameters)
            }
            Apdu::SimpleAck(a) => {
                e.write_u8(TYPE_SIMPLE_ACK << 4)?;
                e.write_u8(a.invoke_id)?;
                e.write_u8(a.service.into())
            }
            Apdu::ComplexAck(a) => {
                let mut octet = TYPE_COMPLEX_ACK << 4;
                if a.segmented {
                    octet |= 0x08;
                }
                if a.more_follows {
                    octet |= 0x04;
                }
                e.write_u8(octet)?;
                e.write_u8(a.invoke_id)?;
                if a.segmented {
                    e.write_u8(a.sequence_number.unwrap_or(0))?;
                    e.write_u8(a.window_size.unwrap_or(1))?;
                }
                e.write_u8(a.service.into())?;
                e.write_slice(&a.parameters)
            }
            Apdu::SegmentAck(a) => {
                let mut octet = TYPE_SEGMENT_ACK << 4;
                if a.negative {
                    octet |= 0x02;
                }
                if a.from_server {
                    octet |= 0x01;
                }
                e.write_u8(octet)?;
                e.write_u8(a.invoke_id)?;
                e.write_u8(a.sequence_number)?;
                e.write_u8(a.actual_window_size)
            }
            Apdu::Error(err) => {
                e.write_u8(TYPE_ERROR << 4)?;
                e.write_u8(err.invoke_id)?;
                e.write_u8(err.service.into())?;
                // error payload: two application-tagged enumerations
                let mut tags = TagList::new();
                tags.push(Enumerated(err.error_class.into()).to_tag()?);
                tags.push(Enumerated(err.error_code.into()).to_tag()?);
                tags.encode(e)
            }
            Apdu::Reject(r) => {
                e.write_u8(TYPE_REJECT << 4)?;
                e.write_u8(r.invoke_id)?;
                e.write_u8(r.reason.into())
            }
            Apdu::Abort(a) => {
                let mut octet = TYPE_ABORT << 4;
                if a.from_server {
                    octet |= 0x01;
                }
                e.write_u8(octet)?;
                e.write_u8(a.invoke_id)?;
                e.write_u8(a.reason.into())
            }
        }
    }
}

impl Decodable for Apdu {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let octet = decoder.read_u8()?;
        let apdu_type = octet >> 4;
        Ok(match apdu_type {
            TYPE_CONFIRMED => {
                let segmented = octet & 0x08 != 0;
                let more_follows = octet & 0x04 != 0;
                let segmented_response_accepted = octet & 0x02 != 0;
                let sizes = decoder.read_u8()?;
                let max_segments = max_segments_from_code(sizes >> 4);
                let max_apdu = max_apdu_from_code(sizes);
                let invoke_id = decoder.read_u8()?;
                let (sequence_number, window_size) = if segmented {
                    (Some(decoder.read_u8()?), Some(decoder.read_u8()?))
                } else {
                    (None, None)
                };
                let service = decoder.read_u8()?.into();
                let parameters = decoder.read_slice(decoder.remaining())?.to_vec();
                Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_apdu,
                    invoke_id,
                    sequence_number,
                    window_size,
                    service,
                    parameters,
                })
            }
            TYPE_UNCONFIRMED => {
                let service = decoder.read_u8()?.into();
                let parameters = decoder.read_slice(decoder.remaining())?.to_vec();
                Apdu::UnconfirmedRequest(UnconfirmedRequest { service, parameters })
            }
            TYPE_SIMPLE_ACK => Apdu::SimpleAck(SimpleAck {
                invoke_id: decoder.read_u8()?,
                service: decoder.read_u8()?.into(),
            }),
            TYPE_COMPLEX_ACK => {
                let segmented = octet & 0x08 != 0;
                let more_follows = octet & 0x04 != 0;
                let invoke_id = decoder.read_u8()?;
                let (sequence_number, window_size) = if segmented {
                    (Some(decoder.read_u8()?), Some(decoder.read_u8()?))
                } else {
                    (None, None)
                };
                let service = decoder.read_u8()?.into();
                let parameters = decoder.read_slice(decoder.remaining())?.to_vec();
                Apdu::ComplexAck(ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    window_size,
                    service,
                    parameters,
                })
            }
            TYPE_SEGMENT_ACK => Apdu::SegmentAck(SegmentAck {
                negative: octet & 0x02 != 0,
                from_server: octet & 0x01 != 0,
                invoke_id: decoder.read_u8()?,
                sequence_number: decoder.read_u8()?,
                actual_window_size: decoder.read_u8()?,
            }),
            TYPE_ERROR => {
                let invoke_id = decoder.read_u8()?;
                let service = decoder.read_u8()?.into();
                let mut tags = TagList::decode(decoder)?;
                let class = tags
                    .pop()
                    .ok_or(DecodeError::NotEnoughBytes)
                    .and_then(|t| Enumerated::from_tag(&t))?;
                let code = tags
                    .pop()
                    .ok_or(DecodeError::NotEnoughBytes)
                    .and_then(|t| Enumerated::from_tag(&t))?;
                Apdu::Error(ErrorPdu {
                    invoke_id,
                    service,
                    error_class: class.0.into(),
                    error_code: code.0.into(),
                })
            }
            TYPE_REJECT => Apdu::Reject(RejectPdu {
                invoke_id: decoder.read_u8()?,
                reason: decoder.read_u8()?.into(),
            }),
            TYPE_ABORT => Apdu::Abort(AbortPdu {
                from_server: octet & 0x01 != 0,
                invoke_id: decoder.read_u8()?,
                reason: decoder.read_u8()?.into(),
            }),
            other => {
                return Err(DecodeError::InvalidData(
                    other as u32,
                    "unrecognized APDU type",
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(apdu: Apdu) {
        let bytes = apdu.to_vec().unwrap();
        assert_eq!(Apdu::from_bytes(&bytes).unwrap(), apdu);
    }

    #[test]
    fn confirmed_request_header() {
        let req = ConfirmedRequest::new(7, ConfirmedService::ReadProperty, vec![0x0C, 0x02]);
        let bytes = Apdu::ConfirmedRequest(req.clone()).to_vec().unwrap();
        // type 0, sa bit set
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[2], 7);
        assert_eq!(bytes[3], 12);
        roundtrip(Apdu::ConfirmedRequest(req));
    }

    #[test]
    fn segmented_request_carries_seq_and_window() {
        let mut req = ConfirmedRequest::new(1, ConfirmedService::ReadPropertyMultiple, vec![0xAA]);
        req.segmented = true;
        req.more_follows = true;
        req.sequence_number = Some(2);
        req.window_size = Some(4);
        let bytes = Apdu::ConfirmedRequest(req.clone()).to_vec().unwrap();
        assert_eq!(bytes[0] & 0x0C, 0x0C);
        assert_eq!(bytes[3], 2);
        assert_eq!(bytes[4], 4);
        roundtrip(Apdu::ConfirmedRequest(req));
    }

    #[test]
    fn segment_ack_flags() {
        let ack = SegmentAck {
            negative: true,
            from_server: true,
            invoke_id: 3,
            sequence_number: 9,
            actual_window_size: 4,
        };
        let bytes = Apdu::SegmentAck(ack).to_vec().unwrap();
        assert_eq!(bytes, vec![0x43, 3, 9, 4]);
        roundtrip(Apdu::SegmentAck(ack));
    }

    #[test]
    fn error_pdu_payload() {
        let err = ErrorPdu {
            invoke_id: 5,
            service: ConfirmedService::WriteProperty,
            error_class: ErrorClass::Property,
            error_code: ErrorCode::WriteAccessDenied,
        };
        roundtrip(Apdu::Error(err));
    }

    #[test]
    fn abort_and_reject() {
        roundtrip(Apdu::Abort(AbortPdu {
            from_server: true,
            invoke_id: 11,
            reason: AbortReason::TsmTimeout,
        }));
        roundtrip(Apdu::Reject(RejectPdu {
            invoke_id: 12,
            reason: RejectReason::UnrecognizedService,
        }));
    }

    #[test]
    fn size_codings() {
        assert_eq!(max_apdu_from_code(max_apdu_code(1476)), 1476);
        assert_eq!(max_apdu_from_code(max_apdu_code(480)), 480);
        assert_eq!(max_apdu_code(50), 0);
        assert_eq!(max_apdu_code(300), 2);
        assert_eq!(max_segments_from_code(max_segments_code(16)), 16);
        assert_eq!(max_segments_code(0), 0);
        assert_eq!(max_segments_code(200), 7);
    }

    #[test]
    fn segmentation_flags() {
        assert!(Segmentation::SegmentedBoth.can_receive());
        assert!(!Segmentation::SegmentedTransmit.can_receive());
        assert!(Segmentation::SegmentedReceive.can_receive());
        assert!(!Segmentation::NoSegmentation.can_transmit());
        assert_eq!(Segmentation::try_from(2).unwrap(), Segmentation::SegmentedReceive);
        assert!(Segmentation::try_from(9).is_err());
    }
}
