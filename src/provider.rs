//! The capability interface between the discovery orchestration and a protocol engine.
//!
//! A [`Provider`] publishes, browses and resolves DNS-SD records. Requests are made through
//! plain method calls; everything that happens afterwards is reported asynchronously as a
//! [`ProviderEvent`] returned from [`Provider::next_event`]. A single task drives the
//! provider, so events are never delivered concurrently with each other.

use crate::{errors::ProviderError, net::IpVersion};
use std::{collections::BTreeMap, fmt, net::IpAddr};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Uniquely identifies one advertisement as seen by a browser.
///
/// No two simultaneously-live advertisements share a key.
pub struct RecordKey {
	/// Index of the network interface the record was seen on, `0` when unknown.
	pub interface: u32,

	/// The IP protocol the record was seen on.
	pub protocol: IpVersion,

	/// The service instance name.
	pub name: String,

	/// The service type, e.g. `_soapy._tcp`.
	pub service_type: String,

	/// The domain, e.g. `local`.
	pub domain: String,
}
impl fmt::Display for RecordKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}.{}.{} ({} on interface {})",
			self.name, self.service_type, self.domain, self.protocol, self.interface
		)
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A service record to advertise.
pub struct ServiceRecord {
	pub name: String,
	pub service_type: String,
	pub port: u16,
	pub txt: BTreeMap<String, String>,

	/// The IP protocols to advertise the record on.
	pub scope: IpVersion,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// The outcome of a successful resolution.
pub struct Resolved {
	pub host_name: String,
	pub address: IpAddr,
	pub port: u16,
	pub txt: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Handle of an outstanding resolution.
pub struct ResolverId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
	Connecting,
	Running,
	Collision,
	Failure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishEvent {
	/// The record is announced on the network.
	Established,

	/// Another host already uses the record's name.
	Collision,

	Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrowseEvent {
	/// A record appeared.
	New(RecordKey),

	/// A record disappeared.
	Remove(RecordKey),

	/// Every record in the provider's cache has been reported.
	CacheExhausted,

	/// Every record known so far has been reported.
	AllForNow,

	/// Browsing failed; no further events will follow.
	Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveEvent {
	Found(Resolved),
	Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
	Client(ClientState),
	Publish(PublishEvent),
	Browse(BrowseEvent),
	Resolve { id: ResolverId, event: ResolveEvent },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Diagnostic information about a provider.
pub struct ProviderInfo {
	pub version: String,
	pub host_name: String,
	pub domain: String,
	pub fqdn: String,
}

/// A DNS-SD protocol engine.
///
/// All request methods return immediately; their effects are reported through
/// [`next_event`](Provider::next_event).
#[allow(async_fn_in_trait)]
pub trait Provider: Send + 'static {
	/// The state of the connection to the engine.
	fn state(&self) -> ClientState;

	fn info(&self) -> ProviderInfo;

	/// Advertises a record until the provider is dropped.
	fn publish(&mut self, record: ServiceRecord) -> Result<(), ProviderError>;

	/// Starts browsing for records of `service_type` on the protocols in `scope`.
	///
	/// Reported through [`ProviderEvent::Browse`].
	fn browse(&mut self, service_type: &str, scope: IpVersion) -> Result<(), ProviderError>;

	/// Starts resolving a browsed record on the given protocol.
	///
	/// Exactly one [`ProviderEvent::Resolve`] carrying the returned id is reported, unless the
	/// resolver is released first.
	fn resolve(&mut self, key: &RecordKey, protocol: IpVersion) -> Result<ResolverId, ProviderError>;

	/// Releases a resolver, cancelling it if it has not terminated yet. Unknown ids are ignored.
	fn release_resolver(&mut self, id: ResolverId);

	/// Runs the engine until the next event is available.
	///
	/// Must be cancel-safe: dropping the future before it completes must not lose an event.
	async fn next_event(&mut self) -> ProviderEvent;
}
