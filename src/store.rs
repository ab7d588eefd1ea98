use crate::{net::IpVersion, provider::RecordKey};
use std::collections::BTreeMap;

/// Reachable servers: identity tag → IP version → connection URL.
pub type ServerUrls = BTreeMap<String, BTreeMap<IpVersion, String>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordValue {
	pub(crate) uuid: String,
	pub(crate) ip_version: IpVersion,
	pub(crate) url: String,
}

/// Resolved records keyed by the browse key they were discovered under.
///
/// Entries only leave the store through [`remove`](ResultStore::remove).
#[derive(Debug, Default)]
pub(crate) struct ResultStore {
	results: BTreeMap<RecordKey, RecordValue>,
}
impl ResultStore {
	/// Stores a value, replacing whatever was stored under the same key.
	pub(crate) fn insert(&mut self, key: RecordKey, value: RecordValue) -> Option<RecordValue> {
		self.results.insert(key, value)
	}

	pub(crate) fn remove(&mut self, key: &RecordKey) -> Option<RecordValue> {
		self.results.remove(key)
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.results.len()
	}

	#[cfg(test)]
	pub(crate) fn get(&self, key: &RecordKey) -> Option<&RecordValue> {
		self.results.get(key)
	}

	/// Groups the stored URLs by identity tag.
	pub(crate) fn server_urls(&self) -> ServerUrls {
		let mut urls = ServerUrls::new();
		for value in self.results.values() {
			urls.entry(value.uuid.clone()).or_default().insert(value.ip_version, value.url.clone());
		}
		urls
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(name: &str, protocol: IpVersion) -> RecordKey {
		RecordKey {
			interface: 2,
			protocol,
			name: name.to_owned(),
			service_type: "_soapy._tcp".to_owned(),
			domain: "local".to_owned(),
		}
	}

	fn value(uuid: &str, ip_version: IpVersion, url: &str) -> RecordValue {
		RecordValue {
			uuid: uuid.to_owned(),
			ip_version,
			url: url.to_owned(),
		}
	}

	#[test]
	fn reinsert_replaces_wholesale() {
		let mut store = ResultStore::default();
		store.insert(key("a", IpVersion::V4), value("one", IpVersion::V4, "tcp://10.0.0.1:1"));
		let old = store.insert(key("a", IpVersion::V4), value("two", IpVersion::V4, "tcp://10.0.0.2:2"));

		assert_eq!(old, Some(value("one", IpVersion::V4, "tcp://10.0.0.1:1")));
		assert_eq!(store.len(), 1);
		assert_eq!(store.get(&key("a", IpVersion::V4)), Some(&value("two", IpVersion::V4, "tcp://10.0.0.2:2")));
		assert!(!store.server_urls().contains_key("one"));
	}

	#[test]
	fn removing_missing_key_is_a_noop() {
		let mut store = ResultStore::default();
		store.insert(key("a", IpVersion::V4), value("one", IpVersion::V4, "tcp://10.0.0.1:1"));
		let before = store.server_urls();

		assert_eq!(store.remove(&key("b", IpVersion::V4)), None);
		assert_eq!(store.remove(&key("a", IpVersion::V6)), None);
		assert_eq!(store.len(), 1);
		assert_eq!(store.server_urls(), before);
	}

	#[test]
	fn server_urls_group_by_identity_tag() {
		let mut store = ResultStore::default();
		store.insert(key("a", IpVersion::V4), value("one", IpVersion::V4, "tcp://10.0.0.1:1"));
		store.insert(key("a", IpVersion::V6), value("one", IpVersion::V6, "tcp://[fe80::1%2]:1"));
		store.insert(key("b", IpVersion::V4), value("two", IpVersion::V4, "tcp://10.0.0.2:1"));

		let urls = store.server_urls();
		assert_eq!(urls.len(), 2);
		assert_eq!(urls["one"].len(), 2);
		assert_eq!(urls["one"][&IpVersion::V6], "tcp://[fe80::1%2]:1");
		assert_eq!(urls["two"][&IpVersion::V4], "tcp://10.0.0.2:1");
	}
}
