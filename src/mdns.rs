//! Built-in multicast DNS provider
//!
//! [`MdnsProvider`] speaks mDNS directly over multicast UDP sockets, so no system daemon is
//! required. It answers queries for the records it publishes, browses by periodically querying
//! for a service type, and resolves from the records its peers send back.

use crate::{
	errors::ProviderError,
	net::IpVersion,
	provider::{BrowseEvent, ClientState, Provider, ProviderEvent, ProviderInfo, PublishEvent, RecordKey, ResolveEvent, ResolverId, ServiceRecord},
	socket::{AsyncMdnsSocket, MdnsSocket, RecvBuffers},
};
use std::{
	collections::{BTreeMap, BTreeSet, VecDeque},
	net::{IpAddr, SocketAddr},
	time::Duration,
};
use tokio::time::Instant;
use trust_dns_client::{
	op::{Message as DnsMessage, MessageType as DnsMessageType},
	rr::{Name as DnsName, RecordType as DnsRecordType},
	serialize::binary::BinDecodable,
};

mod builder;
pub use builder::MdnsProviderBuilder;

mod cache;
use cache::BrowseCache;

mod service;
use service::{host_target, query_packet, service_type_name, PublishedService, DOMAIN};

/// Delay between the two announcements of a newly published record.
const ANNOUNCE_DELAY: Duration = Duration::from_secs(1);

struct Config {
	query_interval: Duration,
	settle_time: Duration,
	max_ignored_queries: u8,
	resolve_timeout: Duration,
	ttl: u32,
}

enum Destination {
	Multicast(IpVersion),
	Unicast(SocketAddr),
}

struct Browse {
	service_type: DnsName,
	scope: IpVersion,
	cache: BrowseCache,
	query: Vec<u8>,
	next_query: Instant,
	settle_at: Option<Instant>,
}

struct PendingResolve {
	key: RecordKey,
	protocol: IpVersion,
	deadline: Instant,
}

/// A [`Provider`] backed by this crate's own mDNS implementation.
///
/// Created with [`MdnsProviderBuilder`]. The sockets are opened by the builder and attached to
/// the async runtime the first time [`next_event`](Provider::next_event) is polled.
pub struct MdnsProvider {
	unattached: Option<MdnsSocket>,
	socket: Option<AsyncMdnsSocket>,
	ip_version: IpVersion,
	buffers: RecvBuffers,

	config: Config,
	host_name: String,
	loopback: bool,
	state: ClientState,

	events: VecDeque<ProviderEvent>,
	outgoing: VecDeque<(Vec<u8>, Destination)>,

	services: Vec<PublishedService>,
	announcements: Vec<(Instant, usize)>,

	browse: Option<Browse>,
	resolvers: BTreeMap<ResolverId, PendingResolve>,
	next_resolver: u64,
}
impl MdnsProvider {
	fn new(socket: MdnsSocket, host_name: String, loopback: bool, config: Config) -> Self {
		Self {
			ip_version: socket.ip_version(),
			unattached: Some(socket),
			socket: None,
			buffers: RecvBuffers::new(4096),
			config,
			host_name,
			loopback,
			state: ClientState::Connecting,
			events: VecDeque::new(),
			outgoing: VecDeque::new(),
			services: Vec::new(),
			announcements: Vec::new(),
			browse: None,
			resolvers: BTreeMap::new(),
			next_resolver: 0,
		}
	}

	/// The IP versions the sockets were opened for.
	pub fn ip_version(&self) -> IpVersion {
		self.ip_version
	}

	fn ensure_running(&self) -> Result<(), ProviderError> {
		match self.state {
			ClientState::Failure => Err(ProviderError::NotRunning),
			_ => Ok(()),
		}
	}

	/// Addresses to advertise: every non-loopback interface address in the sockets' IP versions,
	/// or the loopback addresses if there are none and loopback is enabled.
	fn advertised_addresses(&self) -> BTreeSet<IpAddr> {
		let addrs = if_addrs::get_if_addrs()
			.map(|ifaces| {
				ifaces
					.into_iter()
					.map(|iface| (iface.is_loopback(), iface.ip()))
					.filter(|(_, addr)| self.ip_version.includes(IpVersion::of(addr)))
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();

		let external = addrs.iter().filter(|(loopback, _)| !loopback).map(|(_, addr)| *addr).collect::<BTreeSet<_>>();
		if !external.is_empty() || !self.loopback {
			return external;
		}

		addrs.into_iter().map(|(_, addr)| addr).collect()
	}

	fn attach(&mut self) -> Result<(), std::io::Error> {
		if self.socket.is_some() {
			return Ok(());
		}

		let socket = self
			.unattached
			.take()
			.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "mDNS socket closed"))?;
		self.socket = Some(socket.into_async()?);

		self.state = ClientState::Running;
		self.events.push_back(ProviderEvent::Client(ClientState::Running));
		Ok(())
	}

	fn fail(&mut self, err: std::io::Error) {
		log::error!("mDNS socket error: {err}");

		self.state = ClientState::Failure;
		self.socket = None;
		self.unattached = None;
		self.outgoing.clear();
		self.events.push_back(ProviderEvent::Client(ClientState::Failure));
	}

	/// Does one round of work: fires due timers, sends queued packets and, if that produced no
	/// event, waits for a packet or the next timer.
	async fn pump(&mut self) -> Result<(), std::io::Error> {
		self.attach()?;
		self.fire_timers(Instant::now());
		self.flush().await;

		if !self.events.is_empty() {
			return Ok(());
		}

		let deadline = self.next_deadline();
		let socket = match self.socket.as_ref() {
			Some(socket) => socket,
			None => return Ok(()),
		};

		let recv = tokio::select! {
			recv = socket.recv_multicast(&mut self.buffers) => Some(recv?),
			_ = sleep_until(deadline) => None,
		};

		if let Some((count, addr)) = recv {
			self.handle_packet(count, addr);
		}

		Ok(())
	}

	fn fire_timers(&mut self, now: Instant) {
		let mut due = Vec::new();
		self.announcements.retain(|(at, index)| {
			if *at > now {
				return true;
			}
			due.push(*index);
			false
		});
		for index in due {
			if let Some(service) = self.services.get_mut(index) {
				self.outgoing.push_back((service.response.clone(), Destination::Multicast(service.scope)));
				if !service.established {
					service.established = true;
					self.events.push_back(ProviderEvent::Publish(PublishEvent::Established));
				}
			}
		}

		if let Some(browse) = self.browse.as_mut() {
			if browse.next_query <= now {
				browse.cache.sweep(self.config.max_ignored_queries, &mut self.events);
				self.outgoing.push_back((browse.query.clone(), Destination::Multicast(browse.scope)));
				browse.next_query = now + self.config.query_interval;
			}

			if browse.settle_at.is_some_and(|at| at <= now) {
				browse.settle_at = None;
				self.events.push_back(ProviderEvent::Browse(BrowseEvent::CacheExhausted));
				self.events.push_back(ProviderEvent::Browse(BrowseEvent::AllForNow));
			}
		}

		let events = &mut self.events;
		self.resolvers.retain(|id, pending| {
			if pending.deadline > now {
				return true;
			}
			log::debug!("Resolving {} timed out", pending.key);
			events.push_back(ProviderEvent::Resolve {
				id: *id,
				event: ResolveEvent::Failure("timed out".to_owned()),
			});
			false
		});
	}

	fn next_deadline(&self) -> Option<Instant> {
		let announcements = self.announcements.iter().map(|(at, _)| *at);
		let browse = self
			.browse
			.iter()
			.flat_map(|browse| std::iter::once(browse.next_query).chain(browse.settle_at));
		let resolvers = self.resolvers.values().map(|pending| pending.deadline);

		announcements.chain(browse).chain(resolvers).min()
	}

	/// Sends every queued packet. A packet that cannot be sent is dropped.
	///
	/// Cancel safe: a packet is only dequeued once sent.
	async fn flush(&mut self) {
		let socket = match self.socket.as_ref() {
			Some(socket) => socket,
			None => return,
		};

		while let Some((packet, destination)) = self.outgoing.front() {
			let sent = match destination {
				Destination::Multicast(scope) => socket.send_multicast(packet, *scope).await,
				Destination::Unicast(addr) => socket.send_to(packet, *addr).await,
			};
			if let Err(err) = sent {
				log::warn!("Failed to send mDNS packet: {err}");
			}
			self.outgoing.pop_front();
		}
	}

	fn handle_packet(&mut self, count: usize, addr: SocketAddr) {
		if count == 0 {
			return;
		}

		let message = match DnsMessage::from_bytes(self.buffers.packet(&addr, count)) {
			Ok(message) if !message.truncated() => message,
			_ => return,
		};

		match message.message_type() {
			DnsMessageType::Query => self.answer(&message, addr),
			DnsMessageType::Response => self.ingest(&message, addr),
		}
	}

	/// Answers a query for any of our published records, on the IP version it arrived on.
	fn answer(&mut self, message: &DnsMessage, addr: SocketAddr) {
		let protocol = IpVersion::of(&addr.ip());

		for service in self.services.iter().filter(|service| service.scope.includes(protocol)) {
			let query = match message.queries().iter().find(|query| service.answers(query)) {
				Some(query) => query,
				None => continue,
			};

			let destination = if query.mdns_unicast_response() {
				Destination::Unicast(addr)
			} else {
				Destination::Multicast(protocol)
			};
			self.outgoing.push_back((service.response.clone(), destination));
		}
	}

	fn ingest(&mut self, message: &DnsMessage, addr: SocketAddr) {
		let records = || message.answers().iter().chain(message.additionals());
		for service in self.services.iter_mut().filter(|service| !service.collided) {
			if records().any(|record| service.conflicts_with(record)) {
				service.collided = true;
				self.events.push_back(ProviderEvent::Publish(PublishEvent::Collision));
			}
		}

		let browse = match self.browse.as_mut() {
			Some(browse) if browse.scope.includes(IpVersion::of(&addr.ip())) => browse,
			_ => return,
		};
		browse.cache.ingest(message, &addr, &mut self.events);

		let events = &mut self.events;
		let cache = &browse.cache;
		self.resolvers.retain(|id, pending| match cache.lookup(&pending.key, pending.protocol) {
			Some(resolved) => {
				events.push_back(ProviderEvent::Resolve {
					id: *id,
					event: ResolveEvent::Found(resolved),
				});
				false
			}
			None => true,
		});
	}
}

impl Provider for MdnsProvider {
	fn state(&self) -> ClientState {
		self.state
	}

	fn info(&self) -> ProviderInfo {
		ProviderInfo {
			version: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_owned(),
			host_name: self.host_name.clone(),
			domain: DOMAIN.to_owned(),
			fqdn: format!("{}.{DOMAIN}", self.host_name),
		}
	}

	fn publish(&mut self, record: ServiceRecord) -> Result<(), ProviderError> {
		self.ensure_running()?;

		let service = PublishedService::new(&record, host_target(&self.host_name)?, &self.advertised_addresses(), self.config.ttl)?;

		log::debug!("Publishing {:?} ({}) on port {}", record.name, record.scope, record.port);

		let index = self.services.len();
		let now = Instant::now();
		self.announcements.push((now, index));
		self.announcements.push((now + ANNOUNCE_DELAY, index));
		self.services.push(service);
		Ok(())
	}

	fn browse(&mut self, service_type: &str, scope: IpVersion) -> Result<(), ProviderError> {
		self.ensure_running()?;
		if self.browse.is_some() {
			return Err(ProviderError::AlreadyBrowsing);
		}

		let name = service_type_name(service_type)?;
		let query = query_packet(&name, DnsRecordType::PTR, false)?;
		let now = Instant::now();

		self.browse = Some(Browse {
			cache: BrowseCache::new(name.clone(), service_type),
			service_type: name,
			scope,
			query,
			next_query: now,
			settle_at: Some(now + self.config.settle_time),
		});
		Ok(())
	}

	fn resolve(&mut self, key: &RecordKey, protocol: IpVersion) -> Result<ResolverId, ProviderError> {
		self.ensure_running()?;
		let browse = self.browse.as_ref().ok_or(ProviderError::NotBrowsing)?;

		let id = ResolverId(self.next_resolver);
		self.next_resolver += 1;

		if let Some(resolved) = browse.cache.lookup(key, protocol) {
			self.events.push_back(ProviderEvent::Resolve {
				id,
				event: ResolveEvent::Found(resolved),
			});
			return Ok(id);
		}

		// Ask the publisher for whatever is missing.
		let instance = browse.cache.instance_name(key).unwrap_or(&browse.service_type);
		let query_type = if instance == &browse.service_type { DnsRecordType::PTR } else { DnsRecordType::SRV };
		let query = query_packet(instance, query_type, false)?;
		self.outgoing.push_back((query, Destination::Multicast(protocol)));

		self.resolvers.insert(
			id,
			PendingResolve {
				key: key.clone(),
				protocol,
				deadline: Instant::now() + self.config.resolve_timeout,
			},
		);
		Ok(id)
	}

	fn release_resolver(&mut self, id: ResolverId) {
		self.resolvers.remove(&id);
		self.events
			.retain(|event| !matches!(event, ProviderEvent::Resolve { id: queued, .. } if *queued == id));
	}

	async fn next_event(&mut self) -> ProviderEvent {
		loop {
			if let Some(event) = self.events.pop_front() {
				return event;
			}

			if self.state == ClientState::Failure {
				return std::future::pending().await;
			}

			if let Err(err) = self.pump().await {
				self.fail(err);
			}
		}
	}
}

impl Drop for MdnsProvider {
	fn drop(&mut self) {
		let socket = match &self.socket {
			Some(socket) => socket,
			None => return,
		};

		for service in self.services.iter().filter(|service| service.established) {
			if let Err(err) = socket.try_send_multicast(&service.goodbye, service.scope) {
				log::debug!("Failed to withdraw {}: {err}", service.instance);
			}
		}
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
