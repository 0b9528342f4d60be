//! Object types, property identifiers, class tables, and the vendor registry
//!
//! The registry is the bridge between the wire's opaque `Any` payloads and
//! typed values: `(vendor, object-type, property)` looks up a declared
//! [`TypeSpec`], and the property's value decodes against it.

use std::{collections::HashMap, str::FromStr, sync::Arc, sync::Mutex};

use async_trait::async_trait;

use crate::{
    apdu::{ErrorClass, ErrorCode},
    constructed::{PropertyValue, TypeSpec},
    error::{Error, Result},
    primitives::ObjectIdentifier,
};

/// Object types (Clause 12); 10-bit space, proprietary range above 127
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    /// 0
    AnalogInput,
    /// 1
    AnalogOutput,
    /// 2
    AnalogValue,
    /// 3
    BinaryInput,
    /// 4
    BinaryOutput,
    /// 5
    BinaryValue,
    /// 6
    Calendar,
    /// 7
    Command,
    /// 8
    Device,
    /// 9
    EventEnrollment,
    /// 10
    File,
    /// 11
    Group,
    /// 12
    Loop,
    /// 13
    MultiStateInput,
    /// 14
    MultiStateOutput,
    /// 15
    NotificationClass,
    /// 16
    Program,
    /// 17
    Schedule,
    /// 18
    Averaging,
    /// 19
    MultiStateValue,
    /// 20
    TrendLog,
    /// 23
    Accumulator,
    /// 24
    PulseConverter,
    /// 29
    StructuredView,
    /// 30
    AccessDoor,
    /// 39
    BitstringValue,
    /// 40
    CharacterstringValue,
    /// 45
    IntegerValue,
    /// 48
    PositiveIntegerValue,
    /// 56
    NetworkPort,
    /// anything else, vendor-proprietary types included
    Unknown(u16),
}

impl From<u16> for ObjectType {
    fn from(n: u16) -> Self {
        use ObjectType::*;
        match n {
            0 => AnalogInput,
            1 => AnalogOutput,
            2 => AnalogValue,
            3 => BinaryInput,
            4 => BinaryOutput,
            5 => BinaryValue,
            6 => Calendar,
            7 => Command,
            8 => Device,
            9 => EventEnrollment,
            10 => File,
            11 => Group,
            12 => Loop,
            13 => MultiStateInput,
            14 => MultiStateOutput,
            15 => NotificationClass,
            16 => Program,
            17 => Schedule,
            18 => Averaging,
            19 => MultiStateValue,
            20 => TrendLog,
            23 => Accumulator,
            24 => PulseConverter,
            29 => StructuredView,
            30 => AccessDoor,
            39 => BitstringValue,
            40 => CharacterstringValue,
            45 => IntegerValue,
            48 => PositiveIntegerValue,
            56 => NetworkPort,
            n => Unknown(n),
        }
    }
}

impl From<ObjectType> for u16 {
    fn from(ot: ObjectType) -> u16 {
        use ObjectType::*;
        match ot {
            AnalogInput => 0,
            AnalogOutput => 1,
            AnalogValue => 2,
            BinaryInput => 3,
            BinaryOutput => 4,
            BinaryValue => 5,
            Calendar => 6,
            Command => 7,
            Device => 8,
            EventEnrollment => 9,
            File => 10,
            Group => 11,
            Loop => 12,
            MultiStateInput => 13,
            MultiStateOutput => 14,
            NotificationClass => 15,
            Program => 16,
            Schedule => 17,
            Averaging => 18,
            MultiStateValue => 19,
            TrendLog => 20,
            Accumulator => 23,
            PulseConverter => 24,
            StructuredView => 29,
            AccessDoor => 30,
            BitstringValue => 39,
            CharacterstringValue => 40,
            IntegerValue => 45,
            PositiveIntegerValue => 48,
            NetworkPort => 56,
            Unknown(n) => n,
        }
    }
}

impl FromStr for ObjectType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use ObjectType::*;
        Ok(match s {
            "analog-input" => AnalogInput,
            "analog-output" => AnalogOutput,
            "analog-value" => AnalogValue,
            "binary-input" => BinaryInput,
            "binary-output" => BinaryOutput,
            "binary-value" => BinaryValue,
            "calendar" => Calendar,
            "command" => Command,
            "device" => Device,
            "event-enrollment" => EventEnrollment,
            "file" => File,
            "group" => Group,
            "loop" => Loop,
            "multi-state-input" => MultiStateInput,
            "multi-state-output" => MultiStateOutput,
            "notification-class" => NotificationClass,
            "program" => Program,
            "schedule" => Schedule,
            "averaging" => Averaging,
            "multi-state-value" => MultiStateValue,
            "trend-log" => TrendLog,
            "accumulator" => Accumulator,
            "pulse-converter" => PulseConverter,
            "structured-view" => StructuredView,
            "access-door" => AccessDoor,
            "bitstring-value" => BitstringValue,
            "characterstring-value" => CharacterstringValue,
            "integer-value" => IntegerValue,
            "positive-integer-value" => PositiveIntegerValue,
            "network-port" => NetworkPort,
            other => Unknown(other.parse::<u16>().map_err(|_| ())?),
        })
    }
}

/// Property identifiers (Clause 21); the common subset plus a numeric fallback
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyIdentifier {
    /// 4
    ActiveText,
    /// 8 special: expands to every property
    All,
    /// 10
    ApduSegmentTimeout,
    /// 11
    ApduTimeout,
    /// 12
    ApplicationSoftwareVersion,
    /// 22
    CovIncrement,
    /// 24
    DaylightSavingsStatus,
    /// 28
    Description,
    /// 30
    DeviceAddressBinding,
    /// 31
    DeviceType,
    /// 36
    EventState,
    /// 44
    FirmwareRevision,
    /// 46
    InactiveText,
    /// 56
    LocalDate,
    /// 57
    LocalTime,
    /// 58
    Location,
    /// 62
    MaxApduLengthAccepted,
    /// 65
    MaxPresValue,
    /// 69
    MinPresValue,
    /// 70
    ModelName,
    /// 73
    NumberOfApduRetries,
    /// 74
    NumberOfStates,
    /// 75
    ObjectIdentifier,
    /// 76
    ObjectList,
    /// 77
    ObjectName,
    /// 79
    ObjectType,
    /// 80 special: expands to the optional property set
    Optional,
    /// 81
    OutOfService,
    /// 84
    Polarity,
    /// 85
    PresentValue,
    /// 87
    PriorityArray,
    /// 96
    ProtocolObjectTypesSupported,
    /// 97
    ProtocolServicesSupported,
    /// 98
    ProtocolVersion,
    /// 103
    Reliability,
    /// 104
    RelinquishDefault,
    /// 105 special: expands to the required property set
    Required,
    /// 106
    Resolution,
    /// 107
    SegmentationSupported,
    /// 110
    StateText,
    /// 111
    StatusFlags,
    /// 112
    SystemStatus,
    /// 117
    Units,
    /// 119
    UtcOffset,
    /// 120
    VendorIdentifier,
    /// 121
    VendorName,
    /// 139
    ProtocolRevision,
    /// 155
    DatabaseRevision,
    /// 167
    MaxSegmentsAccepted,
    /// 371
    PropertyList,
    /// anything else, vendor-proprietary properties included
    Unknown(u32),
}

impl From<u32> for PropertyIdentifier {
    fn from(n: u32) -> Self {
        use PropertyIdentifier::*;
        match n {
            4 => ActiveText,
            8 => All,
            10 => ApduSegmentTimeout,
            11 => ApduTimeout,
            12 => ApplicationSoftwareVersion,
            22 => CovIncrement,
            24 => DaylightSavingsStatus,
            28 => Description,
            30 => DeviceAddressBinding,
            31 => DeviceType,
            36 => EventState,
            44 => FirmwareRevision,
            46 => InactiveText,
            56 => LocalDate,
            57 => LocalTime,
            58 => Location,
            62 => MaxApduLengthAccepted,
            65 => MaxPresValue,
            69 => MinPresValue,
            70 => ModelName,
            73 => NumberOfApduRetries,
            74 => NumberOfStates,
            75 => ObjectIdentifier,
            76 => ObjectList,
            77 => ObjectName,
            79 => ObjectType,
            80 => Optional,
            81 => OutOfService,
            84 => Polarity,
            85 => PresentValue,
            87 => PriorityArray,
            96 => ProtocolObjectTypesSupported,
            97 => ProtocolServicesSupported,
            98 => ProtocolVersion,
            103 => Reliability,
            104 => RelinquishDefault,
            105 => Required,
            106 => Resolution,
            107 => SegmentationSupported,
            110 => StateText,
            111 => StatusFlags,
            112 => SystemStatus,
            117 => Units,
            119 => UtcOffset,
            120 => VendorIdentifier,
            121 => VendorName,
            139 => ProtocolRevision,
            155 => DatabaseRevision,
            167 => MaxSegmentsAccepted,
            371 => PropertyList,
            n => Unknown(n),
        }
    }
}

impl From<PropertyIdentifier> for u32 {
    fn from(pid: PropertyIdentifier) -> u32 {
        use PropertyIdentifier::*;
        match pid {
            ActiveText => 4,
            All => 8,
            ApduSegmentTimeout => 10,
            ApduTimeout => 11,
            ApplicationSoftwareVersion => 12,
            CovIncrement => 22,
            DaylightSavingsStatus => 24,
            Description => 28,
            DeviceAddressBinding => 30,
            DeviceType => 31,
            EventState => 36,
            FirmwareRevision => 44,
            InactiveText => 46,
            LocalDate => 56,
            LocalTime => 57,
            Location => 58,
            MaxApduLengthAccepted => 62,
            MaxPresValue => 65,
            MinPresValue => 69,
            ModelName => 70,
            NumberOfApduRetries => 73,
            NumberOfStates => 74,
            ObjectIdentifier => 75,
            ObjectList => 76,
            ObjectName => 77,
            ObjectType => 79,
            Optional => 80,
            OutOfService => 81,
            Polarity => 84,
            PresentValue => 85,
            PriorityArray => 87,
            ProtocolObjectTypesSupported => 96,
            ProtocolServicesSupported => 97,
            ProtocolVersion => 98,
            Reliability => 103,
            RelinquishDefault => 104,
            Required => 105,
            Resolution => 106,
            SegmentationSupported => 107,
            StateText => 110,
            StatusFlags => 111,
            SystemStatus => 112,
            Units => 117,
            UtcOffset => 119,
            VendorIdentifier => 120,
            VendorName => 121,
            ProtocolRevision => 139,
            DatabaseRevision => 155,
            MaxSegmentsAccepted => 167,
            PropertyList => 371,
            Unknown(n) => n,
        }
    }
}

impl FromStr for PropertyIdentifier {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use PropertyIdentifier::*;
        Ok(match s {
            "active-text" => ActiveText,
            "all" => All,
            "apdu-segment-timeout" => ApduSegmentTimeout,
            "apdu-timeout" => ApduTimeout,
            "application-software-version" => ApplicationSoftwareVersion,
            "cov-increment" => CovIncrement,
            "description" => Description,
            "device-type" => DeviceType,
            "event-state" => EventState,
            "firmware-revision" => FirmwareRevision,
            "inactive-text" => InactiveText,
            "local-date" => LocalDate,
            "local-time" => LocalTime,
            "location" => Location,
            "max-apdu-length-accepted" => MaxApduLengthAccepted,
            "max-pres-value" => MaxPresValue,
            "min-pres-value" => MinPresValue,
            "model-name" => ModelName,
            "number-of-apdu-retries" => NumberOfApduRetries,
            "number-of-states" => NumberOfStates,
            "object-identifier" => ObjectIdentifier,
            "object-list" => ObjectList,
            "object-name" => ObjectName,
            "object-type" => ObjectType,
            "optional" => Optional,
            "out-of-service" => OutOfService,
            "polarity" => Polarity,
            "present-value" => PresentValue,
            "priority-array" => PriorityArray,
            "protocol-version" => ProtocolVersion,
            "protocol-revision" => ProtocolRevision,
            "reliability" => Reliability,
            "relinquish-default" => RelinquishDefault,
            "required" => Required,
            "resolution" => Resolution,
            "segmentation-supported" => SegmentationSupported,
            "state-text" => StateText,
            "status-flags" => StatusFlags,
            "system-status" => SystemStatus,
            "units" => Units,
            "vendor-identifier" => VendorIdentifier,
            "vendor-name" => VendorName,
            "database-revision" => DatabaseRevision,
            "max-segments-accepted" => MaxSegmentsAccepted,
            "property-list" => PropertyList,
            other => Unknown(other.parse::<u32>().map_err(|_| ())?),
        })
    }
}

impl PropertyIdentifier {
    /// the special identifiers expanded server-side by ReadPropertyMultiple
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            PropertyIdentifier::All | PropertyIdentifier::Required | PropertyIdentifier::Optional
        )
    }
}

/// One property's declaration inside an object class
#[derive(Debug, Clone)]
pub struct PropertySpec {
    /// the declared value type
    pub declared: TypeSpec,
    /// required for conformance vs optional
    pub required: bool,
    /// writable without a hook
    pub writable: bool,
    /// accepts prioritized writes (commandable)
    pub commandable: bool,
}

impl PropertySpec {
    fn required(declared: TypeSpec) -> Self {
        PropertySpec {
            declared,
            required: true,
            writable: false,
            commandable: false,
        }
    }

    fn optional(declared: TypeSpec) -> Self {
        PropertySpec {
            declared,
            required: false,
            writable: false,
            commandable: false,
        }
    }

    fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    fn commandable(mut self) -> Self {
        self.commandable = true;
        self.writable = true;
        self
    }
}

/// A class of objects: the property table for one object type
#[derive(Debug, Clone)]
pub struct ObjectClass {
    /// the object type this class describes
    pub object_type: ObjectType,
    /// class name, kebab-case
    pub name: &'static str,
    properties: HashMap<PropertyIdentifier, PropertySpec>,
}

impl ObjectClass {
    /// new class with the universally-required identity properties
    pub fn new(object_type: ObjectType, name: &'static str) -> Self {
        let mut class = ObjectClass {
            object_type,
            name,
            properties: HashMap::new(),
        };
        class.declare(
            PropertyIdentifier::ObjectIdentifier,
            PropertySpec::required(TypeSpec::ObjectIdentifier),
        );
        class.declare(
            PropertyIdentifier::ObjectName,
            PropertySpec::required(TypeSpec::CharacterString),
        );
        class.declare(
            PropertyIdentifier::ObjectType,
            PropertySpec::required(TypeSpec::Enumerated),
        );
        class.declare(
            PropertyIdentifier::PropertyList,
            PropertySpec::required(TypeSpec::Enumerated.array_of()),
        );
        class
    }

    /// add or replace a property declaration
    pub fn declare(&mut self, pid: PropertyIdentifier, spec: PropertySpec) -> &mut Self {
        self.properties.insert(pid, spec);
        self
    }

    /// the declared type for a property, if the class knows it
    pub fn get_property_type(&self, pid: PropertyIdentifier) -> Option<&TypeSpec> {
        self.properties.get(&pid).map(|spec| &spec.declared)
    }

    /// full declaration for a property
    pub fn property_spec(&self, pid: PropertyIdentifier) -> Option<&PropertySpec> {
        self.properties.get(&pid)
    }

    /// all declared property identifiers
    pub fn property_ids(&self) -> impl Iterator<Item = PropertyIdentifier> + '_ {
        self.properties.keys().copied()
    }

    /// the property set behind one of the special identifiers;
    /// `property-list` itself is excluded per Clause 15.7.3.1.2
    pub fn expand_special(&self, special: PropertyIdentifier) -> Vec<PropertyIdentifier> {
        let keep = |spec: &PropertySpec| match special {
            PropertyIdentifier::All => true,
            PropertyIdentifier::Required => spec.required,
            PropertyIdentifier::Optional => !spec.required,
            _ => false,
        };
        let mut ids: Vec<_> = self
            .properties
            .iter()
            .filter(|(pid, spec)| **pid != PropertyIdentifier::PropertyList && keep(spec))
            .map(|(pid, _)| *pid)
            .collect();
        ids.sort();
        ids
    }
}

/// Everything known about one vendor's numbering space
#[derive(Debug)]
pub struct VendorInfo {
    /// the vendor identifier; 0 is ASHRAE
    pub vendor_id: u16,
    classes: HashMap<ObjectType, Arc<ObjectClass>>,
}

impl VendorInfo {
    /// empty vendor table
    pub fn new(vendor_id: u16) -> Self {
        VendorInfo {
            vendor_id,
            classes: HashMap::new(),
        }
    }

    /// register an object class
    pub fn register_class(&mut self, class: ObjectClass) {
        self.classes.insert(class.object_type, Arc::new(class));
    }

    /// the class table for an object type
    pub fn object_class(&self, object_type: ObjectType) -> Option<Arc<ObjectClass>> {
        self.classes.get(&object_type).cloned()
    }

    /// parse an object identifier in this vendor's numbering space
    pub fn parse_object_identifier(&self, s: &str) -> Result<ObjectIdentifier> {
        s.parse()
            .map_err(|_| Error::AddrParse(format!("object identifier {s:?}")))
    }

    /// parse a property name or number
    pub fn parse_property_identifier(&self, s: &str) -> Result<PropertyIdentifier> {
        s.parse()
            .map_err(|_| Error::AddrParse(format!("property identifier {s:?}")))
    }
}

/// Process-wide map of vendor id to vendor info, built at startup and shared
/// immutably afterwards
#[derive(Debug)]
pub struct VendorRegistry {
    vendors: HashMap<u16, Arc<VendorInfo>>,
}

impl VendorRegistry {
    /// registry holding only the ASHRAE standard classes
    pub fn standard() -> Self {
        let mut ashrae = VendorInfo::new(0);
        for class in standard_classes() {
            ashrae.register_class(class);
        }
        let mut vendors = HashMap::new();
        vendors.insert(0, Arc::new(ashrae));
        VendorRegistry { vendors }
    }

    /// add a vendor table
    pub fn register(&mut self, info: VendorInfo) {
        self.vendors.insert(info.vendor_id, Arc::new(info));
    }

    /// the vendor's table, falling back to the standard classes for
    /// vendors without registered extensions
    pub fn vendor_info(&self, vendor_id: u16) -> Arc<VendorInfo> {
        self.vendors
            .get(&vendor_id)
            .or_else(|| self.vendors.get(&0))
            .cloned()
            .expect("standard vendor always registered")
    }
}

impl Default for VendorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn analog_class(object_type: ObjectType, name: &'static str, commandable: bool) -> ObjectClass {
    let mut class = ObjectClass::new(object_type, name);
    let pv = if commandable {
        PropertySpec::required(TypeSpec::Real).commandable()
    } else {
        PropertySpec::required(TypeSpec::Real)
    };
    class
        .declare(PropertyIdentifier::PresentValue, pv)
        .declare(
            PropertyIdentifier::StatusFlags,
            PropertySpec::required(TypeSpec::BitString),
        )
        .declare(
            PropertyIdentifier::EventState,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::OutOfService,
            PropertySpec::required(TypeSpec::Boolean).writable(),
        )
        .declare(
            PropertyIdentifier::Units,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::Description,
            PropertySpec::optional(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::Reliability,
            PropertySpec::optional(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::CovIncrement,
            PropertySpec::optional(TypeSpec::Real).writable(),
        )
        .declare(
            PropertyIdentifier::MinPresValue,
            PropertySpec::optional(TypeSpec::Real),
        )
        .declare(
            PropertyIdentifier::MaxPresValue,
            PropertySpec::optional(TypeSpec::Real),
        );
    if commandable {
        class
            .declare(
                PropertyIdentifier::PriorityArray,
                PropertySpec::required(TypeSpec::Real.array_of_len(16)),
            )
            .declare(
                PropertyIdentifier::RelinquishDefault,
                PropertySpec::required(TypeSpec::Real).writable(),
            );
    }
    class
}

fn binary_class(object_type: ObjectType, name: &'static str, commandable: bool) -> ObjectClass {
    let mut class = ObjectClass::new(object_type, name);
    let pv = if commandable {
        PropertySpec::required(TypeSpec::Enumerated).commandable()
    } else {
        PropertySpec::required(TypeSpec::Enumerated)
    };
    class
        .declare(PropertyIdentifier::PresentValue, pv)
        .declare(
            PropertyIdentifier::StatusFlags,
            PropertySpec::required(TypeSpec::BitString),
        )
        .declare(
            PropertyIdentifier::EventState,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::OutOfService,
            PropertySpec::required(TypeSpec::Boolean).writable(),
        )
        .declare(
            PropertyIdentifier::Polarity,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::Description,
            PropertySpec::optional(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::ActiveText,
            PropertySpec::optional(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::InactiveText,
            PropertySpec::optional(TypeSpec::CharacterString),
        );
    if commandable {
        class
            .declare(
                PropertyIdentifier::PriorityArray,
                PropertySpec::required(TypeSpec::Enumerated.array_of_len(16)),
            )
            .declare(
                PropertyIdentifier::RelinquishDefault,
                PropertySpec::required(TypeSpec::Enumerated).writable(),
            );
    }
    class
}

fn multistate_class(object_type: ObjectType, name: &'static str, commandable: bool) -> ObjectClass {
    let mut class = ObjectClass::new(object_type, name);
    let pv = if commandable {
        PropertySpec::required(TypeSpec::Unsigned).commandable()
    } else {
        PropertySpec::required(TypeSpec::Unsigned)
    };
    class
        .declare(PropertyIdentifier::PresentValue, pv)
        .declare(
            PropertyIdentifier::StatusFlags,
            PropertySpec::required(TypeSpec::BitString),
        )
        .declare(
            PropertyIdentifier::EventState,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::OutOfService,
            PropertySpec::required(TypeSpec::Boolean).writable(),
        )
        .declare(
            PropertyIdentifier::NumberOfStates,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::StateText,
            PropertySpec::optional(TypeSpec::CharacterString.array_of()),
        );
    class
}

fn device_class() -> ObjectClass {
    let mut class = ObjectClass::new(ObjectType::Device, "device");
    class
        .declare(
            PropertyIdentifier::SystemStatus,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::VendorName,
            PropertySpec::required(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::VendorIdentifier,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::ModelName,
            PropertySpec::required(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::FirmwareRevision,
            PropertySpec::required(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::ApplicationSoftwareVersion,
            PropertySpec::required(TypeSpec::CharacterString),
        )
        .declare(
            PropertyIdentifier::Location,
            PropertySpec::optional(TypeSpec::CharacterString).writable(),
        )
        .declare(
            PropertyIdentifier::Description,
            PropertySpec::optional(TypeSpec::CharacterString).writable(),
        )
        .declare(
            PropertyIdentifier::ProtocolVersion,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::ProtocolRevision,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::ProtocolServicesSupported,
            PropertySpec::required(TypeSpec::BitString),
        )
        .declare(
            PropertyIdentifier::ProtocolObjectTypesSupported,
            PropertySpec::required(TypeSpec::BitString),
        )
        .declare(
            PropertyIdentifier::ObjectList,
            PropertySpec::required(TypeSpec::ObjectIdentifier.array_of()),
        )
        .declare(
            PropertyIdentifier::MaxApduLengthAccepted,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::SegmentationSupported,
            PropertySpec::required(TypeSpec::Enumerated),
        )
        .declare(
            PropertyIdentifier::MaxSegmentsAccepted,
            PropertySpec::optional(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::ApduSegmentTimeout,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::ApduTimeout,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::NumberOfApduRetries,
            PropertySpec::required(TypeSpec::Unsigned),
        )
        .declare(
            PropertyIdentifier::DeviceAddressBinding,
            PropertySpec::required(TypeSpec::Opaque.list_of()),
        )
        .declare(
            PropertyIdentifier::DatabaseRevision,
            PropertySpec::required(TypeSpec::Unsigned),
        );
    class
}

/// the ASHRAE class tables this crate ships
fn standard_classes() -> Vec<ObjectClass> {
    vec![
        analog_class(ObjectType::AnalogInput, "analog-input", false),
        analog_class(ObjectType::AnalogOutput, "analog-output", true),
        analog_class(ObjectType::AnalogValue, "analog-value", true),
        binary_class(ObjectType::BinaryInput, "binary-input", false),
        binary_class(ObjectType::BinaryOutput, "binary-output", true),
        binary_class(ObjectType::BinaryValue, "binary-value", true),
        multistate_class(ObjectType::MultiStateInput, "multi-state-input", false),
        multistate_class(ObjectType::MultiStateOutput, "multi-state-output", true),
        multistate_class(ObjectType::MultiStateValue, "multi-state-value", true),
        device_class(),
    ]
}

/// Asynchronous property read hook
#[async_trait]
pub trait ReadHook: Send + Sync {
    /// produce the property's current value
    async fn read(
        &self,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        index: Option<u32>,
    ) -> Result<PropertyValue>;
}

/// Asynchronous property write hook
#[async_trait]
pub trait WriteHook: Send + Sync {
    /// apply a write; returning Ok commits
    async fn write(
        &self,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        index: Option<u32>,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> Result<()>;
}

fn unknown_property() -> Error {
    Error::execution(ErrorClass::Property, ErrorCode::UnknownProperty)
}

/// A live object: identity, class, stored values, and optional hooks.
///
/// Commandable properties maintain a 16-slot priority array; a Null write at
/// a priority relinquishes that slot and the effective value falls back to
/// the highest active slot or the relinquish default.
pub struct Object {
    id: ObjectIdentifier,
    class: Arc<ObjectClass>,
    values: Mutex<HashMap<PropertyIdentifier, PropertyValue>>,
    priority_array: Mutex<[Option<PropertyValue>; 16]>,
    read_hooks: HashMap<PropertyIdentifier, Arc<dyn ReadHook>>,
    write_hooks: HashMap<PropertyIdentifier, Arc<dyn WriteHook>>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("class", &self.class.name)
            .finish_non_exhaustive()
    }
}

impl Object {
    /// new object of the given class
    pub fn new(id: ObjectIdentifier, class: Arc<ObjectClass>) -> Self {
        let mut values = HashMap::new();
        values.insert(
            PropertyIdentifier::ObjectIdentifier,
            PropertyValue::ObjectIdentifier(id),
        );
        values.insert(
            PropertyIdentifier::ObjectType,
            PropertyValue::Enumerated(crate::primitives::Enumerated(u32::from(u16::from(
                id.object_type,
            )))),
        );
        Object {
            id,
            class,
            values: Mutex::new(values),
            priority_array: Mutex::new(Default::default()),
            read_hooks: HashMap::new(),
            write_hooks: HashMap::new(),
        }
    }

    /// builder: seed a stored property value
    pub fn with_value(self, pid: PropertyIdentifier, value: PropertyValue) -> Self {
        self.values.lock().expect("poisoned").insert(pid, value);
        self
    }

    /// builder: attach a read hook
    pub fn with_read_hook(mut self, pid: PropertyIdentifier, hook: Arc<dyn ReadHook>) -> Self {
        self.read_hooks.insert(pid, hook);
        self
    }

    /// builder: attach a write hook
    pub fn with_write_hook(mut self, pid: PropertyIdentifier, hook: Arc<dyn WriteHook>) -> Self {
        self.write_hooks.insert(pid, hook);
        self
    }

    /// the object identifier
    pub fn id(&self) -> ObjectIdentifier {
        self.id
    }

    /// the class table
    pub fn class(&self) -> &Arc<ObjectClass> {
        &self.class
    }

    /// the object name, if one is stored
    pub fn object_name(&self) -> Option<String> {
        match self
            .values
            .lock()
            .expect("poisoned")
            .get(&PropertyIdentifier::ObjectName)
        {
            Some(PropertyValue::CharacterString(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Store a property value directly, bypassing write-access checks.
    /// This is the path for the device's own process updating its state;
    /// peer writes go through [`Object::write_property`].
    pub fn set_value(&self, pid: PropertyIdentifier, value: PropertyValue) {
        self.values.lock().expect("poisoned").insert(pid, value);
    }

    /// read a property, honoring hooks and array indexing
    pub async fn read_property(
        &self,
        pid: PropertyIdentifier,
        index: Option<u32>,
    ) -> Result<PropertyValue> {
        if pid == PropertyIdentifier::PropertyList {
            let mut ids: Vec<_> = self
                .values
                .lock()
                .expect("poisoned")
                .keys()
                .filter(|p| {
                    !matches!(
                        p,
                        PropertyIdentifier::ObjectName
                            | PropertyIdentifier::ObjectType
                            | PropertyIdentifier::ObjectIdentifier
                            | PropertyIdentifier::PropertyList
                    )
                })
                .copied()
                .collect();
            ids.sort();
            let list = PropertyValue::Array(
                ids.into_iter()
                    .map(|p| {
                        PropertyValue::Enumerated(crate::primitives::Enumerated(u32::from(p)))
                    })
                    .collect(),
            );
            return index_into(list, index);
        }
        if pid == PropertyIdentifier::PriorityArray {
            let slots = self.priority_array.lock().expect("poisoned");
            let arr = PropertyValue::Array(
                slots
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(PropertyValue::Null))
                    .collect(),
            );
            return index_into(arr, index);
        }
        if let Some(hook) = self.read_hooks.get(&pid) {
            return hook.read(self.id, pid, index).await;
        }
        let value = self
            .values
            .lock()
            .expect("poisoned")
            .get(&pid)
            .cloned()
            .ok_or_else(unknown_property)?;
        index_into(value, index)
    }

    /// write a property, honoring commandability, hooks, and array indexing.
    /// Returns the new effective value of the property.
    pub async fn write_property(
        &self,
        pid: PropertyIdentifier,
        index: Option<u32>,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> Result<PropertyValue> {
        let spec = self.class.property_spec(pid);
        let commandable = spec.map(|s| s.commandable).unwrap_or(false);

        if let Some(p) = priority {
            if !(1..=16).contains(&p) {
                return Err(Error::execution(
                    ErrorClass::Property,
                    ErrorCode::ValueOutOfRange,
                ));
            }
            if !commandable {
                return Err(Error::execution(
                    ErrorClass::Property,
                    ErrorCode::WriteAccessDenied,
                ));
            }
        }
        // Null only relinquishes, and only with a priority
        if matches!(value, PropertyValue::Null) && priority.is_none() {
            return Err(Error::execution(
                ErrorClass::Property,
                ErrorCode::InvalidDataType,
            ));
        }
        if let Some(spec) = spec
            && !spec.writable
            && !self.write_hooks.contains_key(&pid)
        {
            return Err(Error::execution(
                ErrorClass::Property,
                ErrorCode::WriteAccessDenied,
            ));
        }

        if let Some(hook) = self.write_hooks.get(&pid) {
            hook.write(self.id, pid, index, value.clone(), priority)
                .await?;
        }

        if commandable {
            let slot = priority.unwrap_or(16) as usize - 1;
            let effective = {
                let mut slots = self.priority_array.lock().expect("poisoned");
                slots[slot] = match value {
                    PropertyValue::Null => None,
                    other => Some(other),
                };
                slots.iter().flatten().next().cloned()
            };
            let effective = match effective {
                Some(v) => v,
                None => self
                    .values
                    .lock()
                    .expect("poisoned")
                    .get(&PropertyIdentifier::RelinquishDefault)
                    .cloned()
                    .unwrap_or(PropertyValue::Null),
            };
            self.values
                .lock()
                .expect("poisoned")
                .insert(pid, effective.clone());
            return Ok(effective);
        }

        let mut values = self.values.lock().expect("poisoned");
        match index {
            None => {
                values.insert(pid, value.clone());
                Ok(value)
            }
            Some(i) => {
                let current = values.get_mut(&pid).ok_or_else(unknown_property)?;
                match current {
                    PropertyValue::Array(elems) => {
                        if i == 0 || i as usize > elems.len() {
                            return Err(Error::execution(
                                ErrorClass::Property,
                                ErrorCode::InvalidArrayIndex,
                            ));
                        }
                        elems[i as usize - 1] = value;
                        Ok(current.clone())
                    }
                    _ => Err(Error::execution(
                        ErrorClass::Property,
                        ErrorCode::PropertyIsNotAnArray,
                    )),
                }
            }
        }
    }
}

/// apply array indexing: 0 is the length, i >= 1 the i-th element
fn index_into(value: PropertyValue, index: Option<u32>) -> Result<PropertyValue> {
    match (value, index) {
        (value, None) => Ok(value),
        (PropertyValue::Array(elems), Some(0)) => Ok(PropertyValue::Unsigned(elems.len() as u64)),
        (PropertyValue::Array(elems), Some(i)) => elems
            .get(i as usize - 1)
            .cloned()
            .ok_or_else(|| Error::execution(ErrorClass::Property, ErrorCode::InvalidArrayIndex)),
        (_, Some(_)) => Err(Error::execution(
            ErrorClass::Property,
            ErrorCode::PropertyIsNotAnArray,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog_value_object() -> Object {
        let registry = VendorRegistry::standard();
        let class = registry
            .vendor_info(0)
            .object_class(ObjectType::AnalogValue)
            .unwrap();
        Object::new(ObjectIdentifier::new(ObjectType::AnalogValue, 1), class)
            .with_value(
                PropertyIdentifier::ObjectName,
                PropertyValue::CharacterString("av-1".into()),
            )
            .with_value(
                PropertyIdentifier::PresentValue,
                PropertyValue::Real(0.0),
            )
            .with_value(
                PropertyIdentifier::RelinquishDefault,
                PropertyValue::Real(20.0),
            )
    }

    #[test]
    fn type_codes_roundtrip() {
        for n in [0u16, 8, 20, 56, 300] {
            assert_eq!(u16::from(ObjectType::from(n)), n);
        }
        for n in [4u32, 85, 371, 9999] {
            assert_eq!(u32::from(PropertyIdentifier::from(n)), n);
        }
    }

    #[test]
    fn special_expansion_excludes_property_list() {
        let registry = VendorRegistry::standard();
        let class = registry
            .vendor_info(0)
            .object_class(ObjectType::AnalogInput)
            .unwrap();
        let all = class.expand_special(PropertyIdentifier::All);
        assert!(all.contains(&PropertyIdentifier::PresentValue));
        assert!(!all.contains(&PropertyIdentifier::PropertyList));
        let required = class.expand_special(PropertyIdentifier::Required);
        assert!(required.contains(&PropertyIdentifier::StatusFlags));
        assert!(!required.contains(&PropertyIdentifier::CovIncrement));
        let optional = class.expand_special(PropertyIdentifier::Optional);
        assert!(optional.contains(&PropertyIdentifier::CovIncrement));
    }

    #[tokio::test]
    async fn priority_write_and_relinquish() {
        let obj = analog_value_object();
        // command at priority 8
        obj.write_property(
            PropertyIdentifier::PresentValue,
            None,
            PropertyValue::Real(72.5),
            Some(8),
        )
        .await
        .unwrap();
        assert_eq!(
            obj.read_property(PropertyIdentifier::PresentValue, None)
                .await
                .unwrap(),
            PropertyValue::Real(72.5)
        );
        // higher-priority command wins
        obj.write_property(
            PropertyIdentifier::PresentValue,
            None,
            PropertyValue::Real(10.0),
            Some(3),
        )
        .await
        .unwrap();
        assert_eq!(
            obj.read_property(PropertyIdentifier::PresentValue, None)
                .await
                .unwrap(),
            PropertyValue::Real(10.0)
        );
        // relinquish 3, falls back to 8
        obj.write_property(
            PropertyIdentifier::PresentValue,
            None,
            PropertyValue::Null,
            Some(3),
        )
        .await
        .unwrap();
        assert_eq!(
            obj.read_property(PropertyIdentifier::PresentValue, None)
                .await
                .unwrap(),
            PropertyValue::Real(72.5)
        );
        // relinquish 8, falls back to relinquish-default
        obj.write_property(
            PropertyIdentifier::PresentValue,
            None,
            PropertyValue::Null,
            Some(8),
        )
        .await
        .unwrap();
        assert_eq!(
            obj.read_property(PropertyIdentifier::PresentValue, None)
                .await
                .unwrap(),
            PropertyValue::Real(20.0)
        );
    }

    #[tokio::test]
    async fn priority_on_non_commandable_rejected() {
        let obj = analog_value_object();
        let err = obj
            .write_property(
                PropertyIdentifier::OutOfService,
                None,
                PropertyValue::Boolean(true),
                Some(8),
            )
            .await
            .unwrap_err();
        match err {
            Error::Execution { class, code } => {
                assert_eq!(class, ErrorClass::Property);
                assert_eq!(code, ErrorCode::WriteAccessDenied);
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn array_index_reads() {
        let obj = analog_value_object().with_value(
            PropertyIdentifier::StateText,
            PropertyValue::Array(vec![
                PropertyValue::CharacterString("off".into()),
                PropertyValue::CharacterString("on".into()),
            ]),
        );
        assert_eq!(
            obj.read_property(PropertyIdentifier::StateText, Some(0))
                .await
                .unwrap(),
            PropertyValue::Unsigned(2)
        );
        assert_eq!(
            obj.read_property(PropertyIdentifier::StateText, Some(2))
                .await
                .unwrap(),
            PropertyValue::CharacterString("on".into())
        );
        assert!(
            obj.read_property(PropertyIdentifier::StateText, Some(3))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unknown_property_errors() {
        let obj = analog_value_object();
        assert!(
            obj.read_property(PropertyIdentifier::Units, None)
                .await
                .is_err()
        );
    }

    #[test]
    fn priority_array_read() {
        let obj = analog_value_object();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            obj.write_property(
                PropertyIdentifier::PresentValue,
                None,
                PropertyValue::Real(1.0),
                Some(5),
            )
            .await
            .unwrap();
            let arr = obj
                .read_property(PropertyIdentifier::PriorityArray, None)
                .await
                .unwrap();
            match arr {
                PropertyValue::Array(slots) => {
                    assert_eq!(slots.len(), 16);
                    assert_eq!(slots[4], PropertyValue::Real(1.0));
                    assert_eq!(slots[0], PropertyValue::Null);
                }
                other => panic!("expected array, got {other:?}"),
            }
        });
    }

    #[test]
    fn vendor_fallback_to_standard() {
        let registry = VendorRegistry::standard();
        let info = registry.vendor_info(260);
        assert!(info.object_class(ObjectType::AnalogInput).is_some());
    }
}
