#![cfg_attr(docsrs, feature(doc_cfg))]
//! Advertisement and discovery of SoapyRemote servers over mDNS/DNS-SD.
//!
//! A server calls [`Dnssd::register_service`] once to announce itself; a client calls
//! [`Dnssd::server_urls`] to get every reachable server, grouped by the server's identity tag.
//! The first query blocks until the initial discovery sweep is complete, after which the
//! event loop keeps running in the background and later queries return the live view.

use std::net::{Ipv4Addr, Ipv6Addr};

#[macro_use]
extern crate thiserror;

mod browse;
mod store;

pub mod dnssd;
pub mod errors;
pub mod mock;
pub mod net;
pub mod provider;

#[cfg(feature = "mdns")]
mod socket;
#[cfg(feature = "mdns")]
mod util;

#[cfg(feature = "mdns")]
#[cfg_attr(docsrs, doc(cfg(feature = "mdns")))]
pub mod mdns;

pub use dnssd::Dnssd;
pub use net::IpVersion;
pub use store::ServerUrls;

/// Product name used as the prefix of every advertised instance name.
pub const PRODUCT_NAME: &str = "SoapyRemote";

/// DNS-SD service type shared by publishers and browsers.
pub const SERVICE_TYPE: &str = "_soapy._tcp";

/// TXT key carrying the identity tag of a server.
pub const UUID_TXT_KEY: &str = "uuid";

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_V4_IP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_V6_IP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

#[cfg(feature = "mdns")]
pub use trust_dns_client as dns;
