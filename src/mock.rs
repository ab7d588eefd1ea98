//! In-memory discovery provider
//!
//! [`MockNetwork`] stands in for a network segment: every [`MockProvider`] attached to it
//! sees the records published by the others, so publication and discovery can be exercised
//! together without sockets. [`MockProvider::scripted`] instead produces a provider whose
//! events are injected one by one through a [`MockScript`].

use crate::{
	errors::ProviderError,
	net::IpVersion,
	provider::{BrowseEvent, ClientState, Provider, ProviderEvent, ProviderInfo, PublishEvent, RecordKey, ResolveEvent, Resolved, ResolverId, ServiceRecord},
};
use std::{
	collections::{BTreeMap, BTreeSet},
	net::{IpAddr, Ipv4Addr, Ipv6Addr},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, MutexGuard, PoisonError,
	},
};
use tokio::sync::{broadcast, mpsc};

const MOCK_DOMAIN: &str = "local";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A host attached to a [`MockNetwork`].
pub struct MockHost {
	pub host_name: String,

	/// Interface index peers see this host on.
	pub interface: u32,

	pub ipv4: Ipv4Addr,
	pub ipv6: Ipv6Addr,
}
impl MockHost {
	pub fn new(host_name: impl Into<String>, interface: u32, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Self {
		Self {
			host_name: host_name.into(),
			interface,
			ipv4,
			ipv6,
		}
	}

	fn address(&self, protocol: IpVersion) -> IpAddr {
		match protocol {
			IpVersion::V6 => IpAddr::V6(self.ipv6),
			IpVersion::V4 | IpVersion::Unspec => IpAddr::V4(self.ipv4),
		}
	}
}

#[derive(Clone, Debug)]
struct Publication {
	id: u64,
	host: MockHost,
	record: ServiceRecord,
}
impl Publication {
	/// The browse keys this publication shows up under for a browser with the given scope.
	fn keys(&self, service_type: &str, scope: IpVersion) -> Vec<RecordKey> {
		if self.record.service_type != service_type {
			return Vec::new();
		}

		[IpVersion::V4, IpVersion::V6]
			.into_iter()
			.filter(|protocol| scope.includes(*protocol) && self.record.scope.includes(*protocol))
			.map(|protocol| RecordKey {
				interface: self.host.interface,
				protocol,
				name: self.record.name.clone(),
				service_type: self.record.service_type.clone(),
				domain: MOCK_DOMAIN.to_owned(),
			})
			.collect()
	}

	fn matches(&self, key: &RecordKey, protocol: IpVersion) -> bool {
		self.host.interface == key.interface
			&& self.record.name == key.name
			&& self.record.service_type == key.service_type
			&& key.domain == MOCK_DOMAIN
			&& self.record.scope.includes(protocol)
	}
}

#[derive(Clone, Debug)]
enum NetworkEvent {
	Published(Publication),
	Withdrawn(Publication),
}

struct MockNetworkInner {
	publications: Mutex<BTreeMap<u64, Publication>>,
	next_id: AtomicU64,
	events: broadcast::Sender<NetworkEvent>,
}

#[derive(Clone)]
/// Shared in-memory registry of published records.
pub struct MockNetwork {
	inner: Arc<MockNetworkInner>,
}
impl MockNetwork {
	pub fn new() -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			inner: Arc::new(MockNetworkInner {
				publications: Mutex::new(BTreeMap::new()),
				next_id: AtomicU64::new(1),
				events,
			}),
		}
	}

	/// Number of records currently published on the network.
	pub fn publication_count(&self) -> usize {
		lock(&self.inner.publications).len()
	}

	fn publish(&self, host: MockHost, record: ServiceRecord) -> u64 {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let publication = Publication { id, host, record };
		lock(&self.inner.publications).insert(id, publication.clone());
		// No subscribers is fine
		self.inner.events.send(NetworkEvent::Published(publication)).ok();
		id
	}

	fn withdraw(&self, id: u64) {
		if let Some(publication) = lock(&self.inner.publications).remove(&id) {
			self.inner.events.send(NetworkEvent::Withdrawn(publication)).ok();
		}
	}

	fn snapshot(&self) -> Vec<Publication> {
		lock(&self.inner.publications).values().cloned().collect()
	}

	fn find(&self, key: &RecordKey, protocol: IpVersion) -> Option<Publication> {
		lock(&self.inner.publications)
			.values()
			.find(|publication| publication.matches(key, protocol))
			.cloned()
	}

	fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
		self.inner.events.subscribe()
	}
}
impl Default for MockNetwork {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Default)]
struct ScriptLog {
	browses: Vec<IpVersion>,
	resolutions: Vec<(ResolverId, RecordKey, IpVersion)>,
	released: Vec<ResolverId>,
	published: Vec<ServiceRecord>,
	reject_browse: bool,
	reject_resolutions: bool,
}

#[derive(Clone)]
/// Drives a scripted [`MockProvider`] and records the requests made on it.
pub struct MockScript {
	events: mpsc::UnboundedSender<ProviderEvent>,
	log: Arc<Mutex<ScriptLog>>,
}
impl MockScript {
	/// Queues an event for delivery by the provider.
	pub fn send(&self, event: ProviderEvent) {
		// The provider owns a sender too, so the channel outlives every script
		self.events.send(event).ok();
	}

	pub fn client(&self, state: ClientState) {
		self.send(ProviderEvent::Client(state));
	}

	pub fn browse(&self, event: BrowseEvent) {
		self.send(ProviderEvent::Browse(event));
	}

	pub fn resolved(&self, id: ResolverId, resolved: Resolved) {
		self.send(ProviderEvent::Resolve {
			id,
			event: ResolveEvent::Found(resolved),
		});
	}

	pub fn resolve_failed(&self, id: ResolverId, reason: impl Into<String>) {
		self.send(ProviderEvent::Resolve {
			id,
			event: ResolveEvent::Failure(reason.into()),
		});
	}

	/// Makes subsequent `browse` calls fail.
	pub fn reject_browse(&self, reject: bool) {
		lock(&self.log).reject_browse = reject;
	}

	/// Makes subsequent `resolve` calls fail.
	pub fn reject_resolutions(&self, reject: bool) {
		lock(&self.log).reject_resolutions = reject;
	}

	/// Scopes of every `browse` call so far.
	pub fn browses(&self) -> Vec<IpVersion> {
		lock(&self.log).browses.clone()
	}

	/// Every accepted `resolve` call so far, in order.
	pub fn resolutions(&self) -> Vec<(ResolverId, RecordKey, IpVersion)> {
		lock(&self.log).resolutions.clone()
	}

	/// Every resolver released so far, in order.
	pub fn released(&self) -> Vec<ResolverId> {
		lock(&self.log).released.clone()
	}

	pub fn published(&self) -> Vec<ServiceRecord> {
		lock(&self.log).published.clone()
	}
}

struct Attached {
	network: MockNetwork,
	host: MockHost,
	publications: Vec<u64>,
	browse: Option<NetworkBrowse>,
}

struct NetworkBrowse {
	service_type: String,
	scope: IpVersion,
	subscription: broadcast::Receiver<NetworkEvent>,
	seen: BTreeSet<u64>,
}

enum Backend {
	Network(Attached),
	Scripted,
}

enum Step {
	Event(Option<ProviderEvent>),
	Notice(NetworkEvent),
}

/// A [`Provider`] backed by a [`MockNetwork`] or by a [`MockScript`].
pub struct MockProvider {
	state: ClientState,
	host_name: String,
	backend: Backend,
	log: Arc<Mutex<ScriptLog>>,
	events_tx: mpsc::UnboundedSender<ProviderEvent>,
	events_rx: mpsc::UnboundedReceiver<ProviderEvent>,
	next_resolver: u64,
}
impl MockProvider {
	fn with_backend(host_name: String, backend: Backend) -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		Self {
			state: ClientState::Running,
			host_name,
			backend,
			log: Arc::default(),
			events_tx,
			events_rx,
			next_resolver: 1,
		}
	}

	/// A provider for `host` on `network`. Its publications are withdrawn when it is dropped.
	pub fn new(network: &MockNetwork, host: MockHost) -> Self {
		Self::with_backend(
			host.host_name.clone(),
			Backend::Network(Attached {
				network: network.clone(),
				host,
				publications: Vec::new(),
				browse: None,
			}),
		)
	}

	/// A provider that only reports the events sent through the returned script.
	pub fn scripted() -> (Self, MockScript) {
		let provider = Self::with_backend("mock-host".to_owned(), Backend::Scripted);
		let script = MockScript {
			events: provider.events_tx.clone(),
			log: provider.log.clone(),
		};
		(provider, script)
	}

	/// A provider whose client has failed.
	pub fn failed() -> Self {
		let (mut provider, _) = Self::scripted();
		provider.state = ClientState::Failure;
		provider
	}

	fn queue(&self, event: ProviderEvent) {
		self.events_tx.send(event).ok();
	}

	fn on_notice(&mut self, notice: NetworkEvent) {
		let browse = match &mut self.backend {
			Backend::Network(Attached { browse: Some(browse), .. }) => browse,
			_ => return,
		};

		let events = match notice {
			NetworkEvent::Published(publication) => {
				if !browse.seen.insert(publication.id) {
					return;
				}
				publication
					.keys(&browse.service_type, browse.scope)
					.into_iter()
					.map(BrowseEvent::New)
					.collect::<Vec<_>>()
			}

			NetworkEvent::Withdrawn(publication) => {
				if !browse.seen.remove(&publication.id) {
					return;
				}
				publication
					.keys(&browse.service_type, browse.scope)
					.into_iter()
					.map(BrowseEvent::Remove)
					.collect()
			}
		};

		for event in events {
			self.queue(ProviderEvent::Browse(event));
		}
	}

	async fn next_notice(browse: Option<&mut NetworkBrowse>) -> NetworkEvent {
		let browse = match browse {
			Some(browse) => browse,
			None => return std::future::pending().await,
		};

		loop {
			match browse.subscription.recv().await {
				Ok(notice) => return notice,
				Err(broadcast::error::RecvError::Lagged(skipped)) => log::warn!("Mock browser missed {skipped} network events"),
				Err(broadcast::error::RecvError::Closed) => return std::future::pending().await,
			}
		}
	}
}
impl Provider for MockProvider {
	fn state(&self) -> ClientState {
		self.state
	}

	fn info(&self) -> ProviderInfo {
		ProviderInfo {
			version: "mock".to_owned(),
			host_name: self.host_name.clone(),
			domain: MOCK_DOMAIN.to_owned(),
			fqdn: format!("{}.{MOCK_DOMAIN}", self.host_name),
		}
	}

	fn publish(&mut self, record: ServiceRecord) -> Result<(), ProviderError> {
		if self.state == ClientState::Failure {
			return Err(ProviderError::NotRunning);
		}

		lock(&self.log).published.push(record.clone());

		if let Backend::Network(attached) = &mut self.backend {
			let id = attached.network.publish(attached.host.clone(), record);
			attached.publications.push(id);
			self.queue(ProviderEvent::Publish(PublishEvent::Established));
		}

		Ok(())
	}

	fn browse(&mut self, service_type: &str, scope: IpVersion) -> Result<(), ProviderError> {
		if self.state == ClientState::Failure {
			return Err(ProviderError::NotRunning);
		}

		{
			let mut log = lock(&self.log);
			log.browses.push(scope);
			if log.reject_browse {
				return Err(ProviderError::Rejected("browsing rejected by script".to_owned()));
			}
		}

		let attached = match &mut self.backend {
			Backend::Network(attached) => attached,
			Backend::Scripted => return Ok(()),
		};

		if attached.browse.is_some() {
			return Err(ProviderError::AlreadyBrowsing);
		}

		// Subscribe before taking the snapshot so nothing published in between is missed
		let mut browse = NetworkBrowse {
			service_type: service_type.to_owned(),
			scope,
			subscription: attached.network.subscribe(),
			seen: BTreeSet::new(),
		};

		let mut events = Vec::new();
		for publication in attached.network.snapshot() {
			browse.seen.insert(publication.id);
			events.extend(publication.keys(service_type, scope).into_iter().map(BrowseEvent::New));
		}
		events.push(BrowseEvent::CacheExhausted);
		events.push(BrowseEvent::AllForNow);

		attached.browse = Some(browse);
		for event in events {
			self.queue(ProviderEvent::Browse(event));
		}

		Ok(())
	}

	fn resolve(&mut self, key: &RecordKey, protocol: IpVersion) -> Result<ResolverId, ProviderError> {
		if self.state == ClientState::Failure {
			return Err(ProviderError::NotRunning);
		}

		let id = ResolverId(self.next_resolver);
		{
			let mut log = lock(&self.log);
			if log.reject_resolutions {
				return Err(ProviderError::Rejected("resolution rejected by script".to_owned()));
			}
			log.resolutions.push((id, key.clone(), protocol));
		}
		self.next_resolver += 1;

		if let Backend::Network(attached) = &self.backend {
			let event = match attached.network.find(key, protocol) {
				Some(publication) => ResolveEvent::Found(Resolved {
					host_name: format!("{}.{MOCK_DOMAIN}", publication.host.host_name),
					address: publication.host.address(protocol),
					port: publication.record.port,
					txt: publication.record.txt,
				}),
				None => ResolveEvent::Failure(format!("{key} is not published")),
			};
			self.queue(ProviderEvent::Resolve { id, event });
		}

		Ok(id)
	}

	fn release_resolver(&mut self, id: ResolverId) {
		lock(&self.log).released.push(id);
	}

	async fn next_event(&mut self) -> ProviderEvent {
		loop {
			let browse = match &mut self.backend {
				Backend::Network(attached) => attached.browse.as_mut(),
				Backend::Scripted => None,
			};

			let step = tokio::select! {
				biased;
				event = self.events_rx.recv() => Step::Event(event),
				notice = Self::next_notice(browse) => Step::Notice(notice),
			};

			match step {
				Step::Event(Some(event)) => {
					if let ProviderEvent::Client(state) = &event {
						self.state = *state;
					}
					return event;
				}

				// The provider holds a sender, so the channel never closes
				Step::Event(None) => return std::future::pending().await,

				Step::Notice(notice) => self.on_notice(notice),
			}
		}
	}
}
impl Drop for MockProvider {
	fn drop(&mut self) {
		if let Backend::Network(attached) = &self.backend {
			for id in attached.publications.iter().copied() {
				attached.network.withdraw(id);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::SERVICE_TYPE;

	fn host(name: &str, last: u8) -> MockHost {
		MockHost::new(name, 2, Ipv4Addr::new(192, 168, 1, last), Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, last.into()))
	}

	fn record(scope: IpVersion) -> ServiceRecord {
		ServiceRecord {
			name: "SoapyRemote @ alpha".to_owned(),
			service_type: SERVICE_TYPE.to_owned(),
			port: 1234,
			txt: [("uuid".to_owned(), "alpha-1".to_owned())].into_iter().collect(),
			scope,
		}
	}

	fn runtime() -> tokio::runtime::Runtime {
		tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
	}

	#[test]
	fn browse_reports_snapshot_then_exhaustion() {
		let network = MockNetwork::new();
		let mut publisher = MockProvider::new(&network, host("alpha", 10));
		publisher.publish(record(IpVersion::V4)).unwrap();

		let mut browser = MockProvider::new(&network, host("beta", 11));
		browser.browse(SERVICE_TYPE, IpVersion::Unspec).unwrap();

		runtime().block_on(async {
			match browser.next_event().await {
				ProviderEvent::Browse(BrowseEvent::New(key)) => {
					assert_eq!(key.protocol, IpVersion::V4);
					assert_eq!(key.name, "SoapyRemote @ alpha");
				}
				other => panic!("unexpected event {other:?}"),
			}
			assert_eq!(browser.next_event().await, ProviderEvent::Browse(BrowseEvent::CacheExhausted));
			assert_eq!(browser.next_event().await, ProviderEvent::Browse(BrowseEvent::AllForNow));
		});
	}

	#[test]
	fn dropping_a_publisher_withdraws_its_records() {
		let network = MockNetwork::new();
		let mut browser = MockProvider::new(&network, host("beta", 11));
		browser.browse(SERVICE_TYPE, IpVersion::V6).unwrap();

		let mut publisher = MockProvider::new(&network, host("alpha", 10));
		publisher.publish(record(IpVersion::Unspec)).unwrap();
		assert_eq!(network.publication_count(), 1);
		drop(publisher);
		assert_eq!(network.publication_count(), 0);

		runtime().block_on(async {
			assert_eq!(browser.next_event().await, ProviderEvent::Browse(BrowseEvent::CacheExhausted));
			assert_eq!(browser.next_event().await, ProviderEvent::Browse(BrowseEvent::AllForNow));
			let added = match browser.next_event().await {
				ProviderEvent::Browse(BrowseEvent::New(key)) => key,
				other => panic!("unexpected event {other:?}"),
			};
			assert_eq!(added.protocol, IpVersion::V6);
			assert_eq!(browser.next_event().await, ProviderEvent::Browse(BrowseEvent::Remove(added)));
		});
	}

	#[test]
	fn resolve_answers_with_the_requested_family() {
		let network = MockNetwork::new();
		let mut publisher = MockProvider::new(&network, host("alpha", 10));
		publisher.publish(record(IpVersion::Unspec)).unwrap();

		let mut browser = MockProvider::new(&network, host("beta", 11));
		let key = RecordKey {
			interface: 2,
			protocol: IpVersion::V6,
			name: "SoapyRemote @ alpha".to_owned(),
			service_type: SERVICE_TYPE.to_owned(),
			domain: "local".to_owned(),
		};
		let id = browser.resolve(&key, IpVersion::V6).unwrap();

		runtime().block_on(async {
			match browser.next_event().await {
				ProviderEvent::Resolve {
					id: resolved_id,
					event: ResolveEvent::Found(resolved),
				} => {
					assert_eq!(resolved_id, id);
					assert_eq!(resolved.address, IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 10)));
					assert_eq!(resolved.port, 1234);
				}
				other => panic!("unexpected event {other:?}"),
			}
		});
	}

	#[test]
	fn scripted_client_events_update_state() {
		let (mut provider, script) = MockProvider::scripted();
		script.client(ClientState::Failure);

		runtime().block_on(async {
			assert_eq!(provider.next_event().await, ProviderEvent::Client(ClientState::Failure));
		});
		assert_eq!(provider.state(), ClientState::Failure);
		assert!(provider.browse(SERVICE_TYPE, IpVersion::Unspec).is_err());
	}
}
