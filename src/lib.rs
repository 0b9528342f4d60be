//! # bacproto
//!
//! A BACnet protocol stack: the tagged-value codec, APDU transaction state
//! machines with segmentation, network-layer routing, and BACnet/IP (BVLL)
//! data links.
//!
//! ## Example - encoding a service request
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use bacproto::object::PropertyIdentifier;
//! use bacproto::primitives::ObjectIdentifier;
//! use bacproto::service::{ReadProperty, ServiceParameters};
//!
//! let request = ReadProperty::new(
//!     ObjectIdentifier::device(150),
//!     PropertyIdentifier::ObjectName,
//! );
//! // bytes now hold the TLV-encoded service parameters
//! let bytes = request.to_bytes()?;
//! # assert!(!bytes.is_empty());
//! # Ok(()) }
//! ```
//!
//! ## Example - a device over a virtual network
//!
//! ```rust,no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use bacproto::app::{Application, DeviceConfig};
//! use bacproto::link::VirtualNetwork;
//! use bacproto::pdu::Mac;
//!
//! let vlan = VirtualNetwork::new("lab");
//! let app = Application::new(DeviceConfig {
//!     device_instance: 150,
//!     device_name: "controller".into(),
//!     ..DeviceConfig::default()
//! });
//! app.bind_link(Some(1), Arc::new(vlan.attach(Mac::station(1))))?;
//! app.start();
//!
//! let found = app.who_is(Some(100), Some(200), None).await?;
//! # let _ = found;
//! # Ok(()) }
//! ```

#![warn(
    missing_debug_implementations,
    // missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod apdu;
pub mod app;
pub mod bvll;
pub mod constructed;
pub mod cov;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod link;
pub mod network;
pub mod npdu;
pub mod object;
pub mod pdu;
pub mod primitives;
pub mod service;
pub mod tag;
pub mod tsm;

pub use decoder::{Decodable, Decoder};
pub use encoder::{Encodable, Encoder};
pub use error::{DecodeError, DecodeResult, EncodeError, EncodeResult, Error, Result};
