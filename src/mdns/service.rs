use crate::{errors::ProviderError, net::IpVersion, provider::ServiceRecord};
use std::{collections::BTreeSet, iter, net::IpAddr};
use trust_dns_client::{
	op::{Header as DnsHeader, Message as DnsMessage, MessageType as DnsMessageType, OpCode as DnsOpCode, Query as DnsQuery},
	rr::{
		rdata::{SRV, TXT},
		DNSClass as DnsClass, Name as DnsName, RData, Record as DnsRecord, RecordType as DnsRecordType,
	},
	serialize::binary::BinEncodable,
};

pub(super) const DOMAIN: &str = "local";

const TXT_MAX_LEN: usize = 255;

fn bad_name(name: &str, err: impl std::fmt::Display) -> ProviderError {
	ProviderError::BadDnsName(format!("{name:?}: {err}"))
}

/// `<service type>.local.`
pub(super) fn service_type_name(service_type: &str) -> Result<DnsName, ProviderError> {
	DnsName::from_labels(
		service_type
			.split('.')
			.filter(|label| !label.is_empty())
			.chain(iter::once(DOMAIN))
			.map(str::as_bytes),
	)
	.map_err(|err| bad_name(service_type, err))
}

/// `<instance>.<service type>.local.`
///
/// Instance names are free-form text, so the first label is taken as raw bytes.
pub(super) fn instance_name(instance: &str, service_type: &DnsName) -> Result<DnsName, ProviderError> {
	DnsName::from_labels(iter::once(instance.as_bytes()).chain(service_type.iter()))
		.map_err(|err| bad_name(instance, err))
}

/// `<host>.local.`
pub(super) fn host_target(host_name: &str) -> Result<DnsName, ProviderError> {
	DnsName::from_labels([host_name.as_bytes(), DOMAIN.as_bytes()]).map_err(|err| bad_name(host_name, err))
}

/// The instance label of a service instance name.
pub(super) fn instance_label(instance: &DnsName) -> Option<String> {
	instance.iter().next().map(|label| String::from_utf8_lossy(label).into_owned())
}

pub(super) fn query_packet(name: &DnsName, query_type: DnsRecordType, unicast: bool) -> Result<Vec<u8>, std::io::Error> {
	DnsMessage::new()
		.add_query({
			let mut query = DnsQuery::new();

			query
				.set_name(name.clone())
				.set_query_type(query_type)
				.set_query_class(DnsClass::IN)
				.set_mdns_unicast_response(unicast);

			query
		})
		.to_bytes()
		.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, format!("Query packet failed to serialize: {err}")))
}

/// A record published by this host, with its encoded announcement and goodbye packets.
pub(super) struct PublishedService {
	pub(super) scope: IpVersion,
	pub(super) instance: DnsName,
	service_type: DnsName,
	target: DnsName,
	pub(super) response: Vec<u8>,
	pub(super) goodbye: Vec<u8>,
	pub(super) established: bool,
	pub(super) collided: bool,
}
impl PublishedService {
	pub(super) fn new(record: &ServiceRecord, target: DnsName, addresses: &BTreeSet<IpAddr>, ttl: u32) -> Result<Self, ProviderError> {
		let addresses = addresses
			.iter()
			.copied()
			.filter(|addr| record.scope.includes(IpVersion::of(addr)))
			.collect::<BTreeSet<_>>();

		if addresses.is_empty() {
			return Err(ProviderError::MissingAdvertisementAddr);
		}

		let txt = record.txt.iter().map(|(key, value)| format!("{key}={value}")).collect::<Vec<_>>();
		if !txt.iter().all(|txt| txt.len() <= TXT_MAX_LEN) {
			return Err(ProviderError::RecordTooLong);
		}

		let service_type = service_type_name(&record.service_type)?;
		let instance = instance_name(&record.name, &service_type)?;

		let encode = |ttl: u32| -> Result<Vec<u8>, ProviderError> {
			dns_response(&service_type, &instance, &target, &addresses, record.port, &txt, ttl)?
				.to_bytes()
				.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, format!("Response packet failed to serialize: {err}")).into())
		};

		Ok(Self {
			scope: record.scope,
			response: encode(ttl)?,
			goodbye: encode(0)?,
			established: false,
			collided: false,
			instance,
			service_type,
			target,
		})
	}

	/// Whether this service is the subject of the query.
	pub(super) fn answers(&self, query: &DnsQuery) -> bool {
		let name = query.name();
		match query.query_type() {
			DnsRecordType::PTR => name == &self.service_type,
			DnsRecordType::SRV | DnsRecordType::TXT => name == &self.instance,
			DnsRecordType::A | DnsRecordType::AAAA => name == &self.target,
			DnsRecordType::ANY => name == &self.service_type || name == &self.instance || name == &self.target,
			_ => false,
		}
	}

	/// Whether another host claims this service's instance name.
	pub(super) fn conflicts_with(&self, record: &DnsRecord) -> bool {
		record.ttl() != 0
			&& record.name() == &self.instance
			&& matches!(record.data(), Some(RData::SRV(srv)) if srv.target() != &self.target)
	}
}

/// The PTR answer for the service type, with everything needed to resolve it as additionals.
fn dns_response(
	service_type: &DnsName,
	instance: &DnsName,
	target: &DnsName,
	addresses: &BTreeSet<IpAddr>,
	port: u16,
	txt: &[String],
	ttl: u32,
) -> Result<DnsMessage, ProviderError> {
	let mut response = DnsMessage::new();

	response.set_header({
		let mut header = DnsHeader::new();
		header.set_authoritative(true);
		header.set_message_type(DnsMessageType::Response);
		header.set_op_code(DnsOpCode::Query);
		header.set_answer_count(1);
		header.set_additional_count((addresses.len() + 1 + 1).try_into().map_err(|_| ProviderError::TooManyIpAddresses)?);
		header
	});

	response.add_answer({
		let mut record = DnsRecord::new();

		record
			.set_dns_class(DnsClass::IN)
			.set_rr_type(DnsRecordType::PTR)
			.set_data(Some(RData::PTR(instance.clone())))
			.set_name(service_type.clone())
			.set_ttl(ttl);

		record
	});

	response.add_additional({
		let mut record = DnsRecord::new();

		record
			.set_dns_class(DnsClass::IN)
			.set_rr_type(DnsRecordType::SRV)
			.set_data(Some(RData::SRV(SRV::new(0, 0, port, target.clone()))))
			.set_name(instance.clone())
			.set_ttl(ttl)
			.set_mdns_cache_flush(true);

		record
	});

	response.add_additional({
		let mut record = DnsRecord::new();

		record
			.set_dns_class(DnsClass::IN)
			.set_rr_type(DnsRecordType::TXT)
			.set_data(Some(RData::TXT(TXT::new(txt.to_vec()))))
			.set_name(instance.clone())
			.set_ttl(ttl)
			.set_mdns_cache_flush(true);

		record
	});

	for addr in addresses.iter() {
		response.add_additional({
			let mut record = DnsRecord::new();

			record
				.set_dns_class(DnsClass::IN)
				.set_rr_type(match addr {
					IpAddr::V4(_) => DnsRecordType::A,
					IpAddr::V6(_) => DnsRecordType::AAAA,
				})
				.set_data(Some(match addr {
					IpAddr::V4(addr) => RData::A(*addr),
					IpAddr::V6(addr) => RData::AAAA(*addr),
				}))
				.set_name(target.clone())
				.set_ttl(ttl)
				.set_mdns_cache_flush(true);

			record
		});
	}

	Ok(response)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{
		collections::BTreeMap,
		net::{Ipv4Addr, Ipv6Addr},
	};
	use trust_dns_client::serialize::binary::BinDecodable;

	fn record(scope: IpVersion) -> ServiceRecord {
		ServiceRecord {
			name: "SoapyRemote @ bench".to_owned(),
			service_type: "_soapy._tcp".to_owned(),
			port: 5555,
			txt: BTreeMap::from([("uuid".to_owned(), "abc-123".to_owned())]),
			scope,
		}
	}

	fn addresses() -> BTreeSet<IpAddr> {
		BTreeSet::from([
			IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
			IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x10)),
		])
	}

	fn published(scope: IpVersion) -> PublishedService {
		PublishedService::new(&record(scope), host_target("bench").unwrap(), &addresses(), 120).unwrap()
	}

	#[test]
	fn dns_parser_reads_response() {
		let service = published(IpVersion::Unspec);

		let packet = dns_parser::Packet::parse(&service.response).unwrap();
		println!("{packet:#?}");

		assert_eq!(packet.answers.len(), 1);
		assert!(matches!(packet.answers[0].data, dns_parser::RData::PTR(_)));

		assert_eq!(packet.additional.len(), 4);
		assert!(packet
			.additional
			.iter()
			.any(|record| matches!(record.data, dns_parser::RData::SRV(ref srv) if srv.port == 5555)));
		assert!(packet.additional.iter().any(|record| match record.data {
			dns_parser::RData::TXT(ref txt) => txt.iter().any(|entry| entry == b"uuid=abc-123"),
			_ => false,
		}));
	}

	#[test]
	fn instance_names_keep_spaces() {
		let service_type = service_type_name("_soapy._tcp").unwrap();
		let instance = instance_name("SoapyRemote @ bench", &service_type).unwrap();

		assert_eq!(instance_label(&instance).as_deref(), Some("SoapyRemote @ bench"));
		assert_eq!(instance.base_name(), service_type);
		assert!(instance.is_fqdn());
	}

	#[test]
	fn response_only_advertises_addresses_in_scope() {
		let service = published(IpVersion::V4);
		let response = DnsMessage::from_bytes(&service.response).unwrap();

		assert_eq!(response.answers().len(), 1);
		assert!(response.additionals().iter().any(|record| record.rr_type() == DnsRecordType::A));
		assert!(!response.additionals().iter().any(|record| record.rr_type() == DnsRecordType::AAAA));
	}

	#[test]
	fn goodbye_has_zero_ttl() {
		let service = published(IpVersion::Unspec);
		let goodbye = DnsMessage::from_bytes(&service.goodbye).unwrap();

		assert!(goodbye.answers().iter().chain(goodbye.additionals()).all(|record| record.ttl() == 0));
	}

	#[test]
	fn answers_queries_for_type_and_instance() {
		let service = published(IpVersion::Unspec);

		let mut query = DnsQuery::new();
		query.set_name(service_type_name("_soapy._tcp").unwrap()).set_query_type(DnsRecordType::PTR);
		assert!(service.answers(&query));

		query.set_query_type(DnsRecordType::SRV);
		assert!(!service.answers(&query));

		query.set_name(service.instance.clone());
		assert!(service.answers(&query));

		query.set_name(service_type_name("_http._tcp").unwrap()).set_query_type(DnsRecordType::PTR);
		assert!(!service.answers(&query));
	}

	#[test]
	fn rejects_unpublishable_records() {
		let target = host_target("bench").unwrap();
		let v4_only = BTreeSet::from([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))]);
		assert!(matches!(
			PublishedService::new(&record(IpVersion::V6), target.clone(), &v4_only, 120),
			Err(ProviderError::MissingAdvertisementAddr)
		));

		let mut long = record(IpVersion::Unspec);
		long.txt.insert("uuid".to_owned(), "x".repeat(TXT_MAX_LEN));
		assert!(matches!(
			PublishedService::new(&long, target, &addresses(), 120),
			Err(ProviderError::RecordTooLong)
		));
	}

	#[test]
	fn own_records_do_not_conflict() {
		let service = published(IpVersion::Unspec);
		let response = DnsMessage::from_bytes(&service.response).unwrap();
		assert!(!response.additionals().iter().any(|record| service.conflicts_with(record)));

		let other = PublishedService::new(&record(IpVersion::Unspec), host_target("other").unwrap(), &addresses(), 120).unwrap();
		let response = DnsMessage::from_bytes(&other.response).unwrap();
		assert!(response.additionals().iter().any(|record| service.conflicts_with(record)));
	}
}
