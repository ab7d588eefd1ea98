use super::service::{instance_label, DOMAIN};
use crate::{
	net::IpVersion,
	provider::{BrowseEvent, ProviderEvent, RecordKey, Resolved},
};
use std::{
	collections::{btree_map::Entry, BTreeMap, BTreeSet, VecDeque},
	net::{IpAddr, SocketAddr},
};
use trust_dns_client::{
	op::Message as DnsMessage,
	rr::{rdata::TXT, Name as DnsName, RData, Record as DnsRecord},
};

struct Instance {
	name: DnsName,
	ignored_queries: u8,
}

struct ServiceData {
	port: u16,
	target: DnsName,
	txt: BTreeMap<String, String>,
}

/// Records of one service type seen on the network.
///
/// Names are stored lowercased; DNS names compare case-insensitively.
pub(super) struct BrowseCache {
	service_type: DnsName,
	service_type_label: String,
	instances: BTreeMap<RecordKey, Instance>,
	services: BTreeMap<DnsName, ServiceData>,
	hosts: BTreeMap<DnsName, BTreeSet<IpAddr>>,
}
impl BrowseCache {
	pub(super) fn new(service_type: DnsName, service_type_label: &str) -> Self {
		Self {
			service_type,
			service_type_label: service_type_label.to_owned(),
			instances: BTreeMap::new(),
			services: BTreeMap::new(),
			hosts: BTreeMap::new(),
		}
	}

	/// Takes in the records of a response received from `source`.
	pub(super) fn ingest(&mut self, message: &DnsMessage, source: &SocketAddr, events: &mut VecDeque<ProviderEvent>) {
		let interface = match source {
			SocketAddr::V4(_) => 0,
			SocketAddr::V6(addr) => addr.scope_id(),
		};
		let protocol = IpVersion::of(&source.ip());

		let records = || message.answers().iter().chain(message.additionals());

		// Addresses are only kept for hosts that a service points at, so service records go first.
		for record in records() {
			match record.data() {
				Some(RData::PTR(instance)) if record.name() == &self.service_type => {
					self.ingest_instance(record, instance, interface, protocol, events)
				}

				Some(RData::SRV(srv)) if self.is_instance(record.name()) => {
					let name = record.name().to_lowercase();
					if record.ttl() == 0 {
						self.services.remove(&name);
					} else {
						let txt = self.services.remove(&name).map(|service| service.txt).unwrap_or_default();
						self.services.insert(
							name,
							ServiceData {
								port: srv.port(),
								target: srv.target().to_lowercase(),
								txt,
							},
						);
					}
				}

				_ => {}
			}
		}

		for record in records() {
			match record.data() {
				Some(RData::TXT(txt)) if self.is_instance(record.name()) => {
					if let Some(service) = self.services.get_mut(&record.name().to_lowercase()) {
						service.txt = parse_txt(txt);
					}
				}

				Some(RData::A(addr)) => self.ingest_address(record, IpAddr::V4(*addr)),
				Some(RData::AAAA(addr)) => self.ingest_address(record, IpAddr::V6(*addr)),

				_ => {}
			}
		}
	}

	fn ingest_instance(&mut self, record: &DnsRecord, instance: &DnsName, interface: u32, protocol: IpVersion, events: &mut VecDeque<ProviderEvent>) {
		if !self.is_instance(instance) {
			return;
		}

		let name = match instance_label(instance) {
			Some(name) => name,
			None => return,
		};

		let key = RecordKey {
			interface,
			protocol,
			name,
			service_type: self.service_type_label.clone(),
			domain: DOMAIN.to_owned(),
		};

		if record.ttl() == 0 {
			if self.instances.remove(&key).is_some() {
				events.push_back(ProviderEvent::Browse(BrowseEvent::Remove(key)));
			}
			return;
		}

		match self.instances.entry(key) {
			Entry::Occupied(mut entry) => entry.get_mut().ignored_queries = 0,
			Entry::Vacant(entry) => {
				events.push_back(ProviderEvent::Browse(BrowseEvent::New(entry.key().clone())));
				entry.insert(Instance {
					name: instance.to_lowercase(),
					ignored_queries: 0,
				});
			}
		}
	}

	fn ingest_address(&mut self, record: &DnsRecord, addr: IpAddr) {
		let host = record.name().to_lowercase();
		if record.ttl() == 0 {
			if let Some(addrs) = self.hosts.get_mut(&host) {
				addrs.remove(&addr);
			}
		} else if self.services.values().any(|service| service.target == host) {
			self.hosts.entry(host).or_default().insert(addr);
		}
	}

	fn is_instance(&self, name: &DnsName) -> bool {
		name.num_labels() == self.service_type.num_labels() + 1 && name.base_name() == self.service_type
	}

	/// Ages every instance by one unanswered query, removing those that ignored more than `max_ignored_queries`.
	pub(super) fn sweep(&mut self, max_ignored_queries: u8, events: &mut VecDeque<ProviderEvent>) {
		if max_ignored_queries == 0 {
			return;
		}

		self.instances.retain(|key, instance| {
			if instance.ignored_queries < max_ignored_queries {
				instance.ignored_queries += 1;
				true
			} else {
				events.push_back(ProviderEvent::Browse(BrowseEvent::Remove(key.clone())));
				false
			}
		});
	}

	/// The full name of a browsed instance.
	pub(super) fn instance_name(&self, key: &RecordKey) -> Option<&DnsName> {
		self.instances.get(key).map(|instance| &instance.name)
	}

	/// Resolves a browsed instance to an address of the given IP version, if every record needed is cached.
	pub(super) fn lookup(&self, key: &RecordKey, protocol: IpVersion) -> Option<Resolved> {
		let instance = self.instances.get(key)?;
		let service = self.services.get(&instance.name)?;
		let address = self
			.hosts
			.get(&service.target)?
			.iter()
			.copied()
			.find(|addr| protocol.includes(IpVersion::of(addr)))?;

		Some(Resolved {
			host_name: service.target.to_utf8().trim_end_matches('.').to_owned(),
			address,
			port: service.port,
			txt: service.txt.clone(),
		})
	}
}

/// `key=value` entries; entries without `=` carry no value and are skipped.
fn parse_txt(txt: &TXT) -> BTreeMap<String, String> {
	txt.txt_data()
		.iter()
		.filter_map(|entry| {
			let entry = String::from_utf8_lossy(entry);
			let (key, value) = entry.split_once('=')?;
			Some((key.to_owned(), value.to_owned()))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		mdns::service::{host_target, service_type_name, PublishedService},
		provider::ServiceRecord,
	};
	use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
	use trust_dns_client::serialize::binary::BinDecodable;

	const V4_PEER: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 5353));
	const V6_PEER: SocketAddr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x10), 5353, 0, 2));

	fn cache() -> BrowseCache {
		BrowseCache::new(service_type_name("_soapy._tcp").unwrap(), "_soapy._tcp")
	}

	fn published(host: &str, uuid: &str) -> PublishedService {
		let record = ServiceRecord {
			name: format!("SoapyRemote @ {host}"),
			service_type: "_soapy._tcp".to_owned(),
			port: 5555,
			txt: BTreeMap::from([("uuid".to_owned(), uuid.to_owned())]),
			scope: IpVersion::Unspec,
		};
		let addresses = BTreeSet::from([
			IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
			IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x10)),
		]);
		PublishedService::new(&record, host_target(host).unwrap(), &addresses, 120).unwrap()
	}

	fn ingest(cache: &mut BrowseCache, packet: &[u8], source: SocketAddr) -> Vec<ProviderEvent> {
		let mut events = VecDeque::new();
		cache.ingest(&DnsMessage::from_bytes(packet).unwrap(), &source, &mut events);
		events.into()
	}

	fn new_key(events: &[ProviderEvent]) -> RecordKey {
		match events {
			[ProviderEvent::Browse(BrowseEvent::New(key))] => key.clone(),
			other => panic!("expected a single new record, got {other:?}"),
		}
	}

	#[test]
	fn response_produces_resolvable_instance() {
		let mut cache = cache();
		let key = new_key(&ingest(&mut cache, &published("bench", "abc-123").response, V4_PEER));

		assert_eq!(key.name, "SoapyRemote @ bench");
		assert_eq!(key.service_type, "_soapy._tcp");
		assert_eq!(key.domain, "local");
		assert_eq!(key.protocol, IpVersion::V4);
		assert_eq!(key.interface, 0);

		let resolved = cache.lookup(&key, IpVersion::V4).unwrap();
		assert_eq!(resolved.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
		assert_eq!(resolved.port, 5555);
		assert_eq!(resolved.host_name, "bench.local");
		assert_eq!(resolved.txt.get("uuid").map(String::as_str), Some("abc-123"));

		assert_eq!(
			cache.lookup(&key, IpVersion::V6).unwrap().address,
			IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x10))
		);
	}

	#[test]
	fn ipv6_records_carry_the_interface() {
		let mut cache = cache();
		let key = new_key(&ingest(&mut cache, &published("bench", "abc-123").response, V6_PEER));

		assert_eq!(key.protocol, IpVersion::V6);
		assert_eq!(key.interface, 2);
	}

	#[test]
	fn repeated_responses_are_not_new() {
		let mut cache = cache();
		let service = published("bench", "abc-123");

		assert_eq!(ingest(&mut cache, &service.response, V4_PEER).len(), 1);
		assert!(ingest(&mut cache, &service.response, V4_PEER).is_empty());

		// Same instance over another protocol is a distinct record.
		assert_eq!(ingest(&mut cache, &service.response, V6_PEER).len(), 1);
	}

	#[test]
	fn goodbye_removes_instance() {
		let mut cache = cache();
		let service = published("bench", "abc-123");
		let key = new_key(&ingest(&mut cache, &service.response, V4_PEER));

		let events = ingest(&mut cache, &service.goodbye, V4_PEER);
		assert_eq!(events, vec![ProviderEvent::Browse(BrowseEvent::Remove(key.clone()))]);
		assert!(cache.lookup(&key, IpVersion::V4).is_none());

		assert!(ingest(&mut cache, &service.goodbye, V4_PEER).is_empty());
	}

	#[test]
	fn silent_instances_age_out() {
		let mut cache = cache();
		let service = published("bench", "abc-123");
		let key = new_key(&ingest(&mut cache, &service.response, V4_PEER));

		let mut events = VecDeque::new();
		cache.sweep(2, &mut events);
		cache.sweep(2, &mut events);
		assert!(events.is_empty());

		// Answering resets the count.
		ingest(&mut cache, &service.response, V4_PEER);
		cache.sweep(2, &mut events);
		cache.sweep(2, &mut events);
		assert!(events.is_empty());

		cache.sweep(2, &mut events);
		assert_eq!(Vec::from(events), vec![ProviderEvent::Browse(BrowseEvent::Remove(key))]);
	}

	#[test]
	fn aging_disabled() {
		let mut cache = cache();
		ingest(&mut cache, &published("bench", "abc-123").response, V4_PEER);

		let mut events = VecDeque::new();
		for _ in 0..10 {
			cache.sweep(0, &mut events);
		}
		assert!(events.is_empty());
	}

	#[test]
	fn other_service_types_are_ignored() {
		let mut cache = BrowseCache::new(service_type_name("_http._tcp").unwrap(), "_http._tcp");
		assert!(ingest(&mut cache, &published("bench", "abc-123").response, V4_PEER).is_empty());
	}

	#[test]
	fn txt_entries_without_value_are_skipped() {
		let txt = TXT::new(vec!["uuid=abc=123".to_owned(), "flag".to_owned(), "empty=".to_owned()]);
		let parsed = parse_txt(&txt);

		assert_eq!(parsed.len(), 2);
		assert_eq!(parsed["uuid"], "abc=123");
		assert_eq!(parsed["empty"], "");
	}
}
