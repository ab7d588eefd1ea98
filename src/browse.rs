use crate::{
	errors::ProviderError,
	net::IpVersion,
	provider::{BrowseEvent, Provider, RecordKey, ResolveEvent, Resolved, ResolverId},
	store::{RecordValue, ResultStore, ServerUrls},
	SERVICE_TYPE, UUID_TXT_KEY,
};
use std::{
	collections::BTreeMap,
	net::{IpAddr, SocketAddr, SocketAddrV6},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BrowseState {
	Idle,
	Browsing,
	Complete,
}

/// Turns browse and resolve events into resolved records.
///
/// A sweep is complete once the provider has reported everything it knows about and
/// every resolution started along the way has terminated.
#[derive(Debug)]
pub(crate) struct Browser {
	started: bool,
	exhausted: bool,
	in_flight: BTreeMap<ResolverId, RecordKey>,
	store: ResultStore,
}
impl Browser {
	pub(crate) fn new() -> Self {
		Self {
			started: false,
			exhausted: false,
			in_flight: BTreeMap::new(),
			store: ResultStore::default(),
		}
	}

	pub(crate) fn state(&self) -> BrowseState {
		if !self.started {
			BrowseState::Idle
		} else if self.exhausted && self.in_flight.is_empty() {
			BrowseState::Complete
		} else {
			BrowseState::Browsing
		}
	}

	#[cfg(test)]
	pub(crate) fn in_flight(&self) -> usize {
		self.in_flight.len()
	}

	pub(crate) fn server_urls(&self) -> ServerUrls {
		self.store.server_urls()
	}

	/// Creates the browser. On failure the state stays [`BrowseState::Idle`].
	pub(crate) fn start<P: Provider>(&mut self, provider: &mut P, scope: IpVersion) -> Result<(), ProviderError> {
		debug_assert!(!self.started);
		provider.browse(SERVICE_TYPE, scope)?;
		self.started = true;
		log::debug!("Browsing for {SERVICE_TYPE} on {scope}");
		Ok(())
	}

	pub(crate) fn handle_browse<P: Provider>(&mut self, provider: &mut P, event: BrowseEvent) {
		if !self.started {
			log::debug!("Ignoring browse event before browsing started: {event:?}");
			return;
		}

		match event {
			BrowseEvent::New(key) => {
				// Resolve on the protocol the record was seen on, or the address family can mismatch
				match provider.resolve(&key, key.protocol) {
					Ok(id) => {
						self.in_flight.insert(id, key);
					}
					Err(err) => log::error!("Failed to resolve {key}: {err}"),
				}
			}

			BrowseEvent::Remove(key) => {
				if let Some(value) = self.store.remove(&key) {
					log::debug!("Removed {} [{}] {}", value.url, value.uuid, value.ip_version);
				}
			}

			BrowseEvent::CacheExhausted | BrowseEvent::AllForNow => self.exhausted = true,

			BrowseEvent::Failure(reason) => {
				log::error!("Browser failure: {reason}");
				self.abandon(provider);
			}
		}
	}

	pub(crate) fn handle_resolve<P: Provider>(&mut self, provider: &mut P, id: ResolverId, event: ResolveEvent) {
		let key = match self.in_flight.remove(&id) {
			Some(key) => key,
			None => {
				log::debug!("Ignoring event for abandoned resolver {id:?}");
				return;
			}
		};
		provider.release_resolver(id);

		match event {
			ResolveEvent::Found(resolved) => self.add_result(key, resolved),
			ResolveEvent::Failure(reason) => log::debug!("Failed to resolve {key}: {reason}"),
		}
	}

	/// Ends the sweep now, cancelling every outstanding resolution.
	pub(crate) fn abandon<P: Provider>(&mut self, provider: &mut P) {
		if !self.started {
			return;
		}
		for (id, key) in std::mem::take(&mut self.in_flight) {
			log::debug!("Abandoning resolution of {key}");
			provider.release_resolver(id);
		}
		self.exhausted = true;
	}

	fn add_result(&mut self, key: RecordKey, resolved: Resolved) {
		let uuid = match resolved.txt.get(UUID_TXT_KEY) {
			Some(uuid) if !uuid.is_empty() => uuid.clone(),
			_ => {
				log::debug!("Discarding {key}: no {UUID_TXT_KEY} in TXT record");
				return;
			}
		};

		let url = server_url(resolved.address, resolved.port, key.protocol, key.interface);
		log::debug!("Discovered {url} [{uuid}] {}", key.protocol);

		self.store.insert(
			key.clone(),
			RecordValue {
				uuid,
				ip_version: key.protocol,
				url,
			},
		);
	}
}

/// Formats a connection URL.
///
/// IPv6 addresses carry the interface they were seen on, since link-local addresses are
/// ambiguous without it.
pub(crate) fn server_url(address: IpAddr, port: u16, protocol: IpVersion, interface: u32) -> String {
	let addr = match (protocol, address) {
		(IpVersion::V6, IpAddr::V6(ip)) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, interface)),
		_ => SocketAddr::new(address, port),
	};
	format!("tcp://{addr}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mock::{MockProvider, MockScript};
	use std::net::{Ipv4Addr, Ipv6Addr};

	fn key(name: &str, protocol: IpVersion) -> RecordKey {
		RecordKey {
			interface: 3,
			protocol,
			name: name.to_owned(),
			service_type: SERVICE_TYPE.to_owned(),
			domain: "local".to_owned(),
		}
	}

	fn resolved(uuid: &str, address: IpAddr) -> Resolved {
		Resolved {
			host_name: "host.local".to_owned(),
			address,
			port: 5555,
			txt: [(UUID_TXT_KEY.to_owned(), uuid.to_owned())].into_iter().collect(),
		}
	}

	fn started() -> (Browser, MockProvider, MockScript) {
		let (mut provider, script) = MockProvider::scripted();
		let mut browser = Browser::new();
		browser.start(&mut provider, IpVersion::Unspec).unwrap();
		(browser, provider, script)
	}

	fn last_resolution(script: &MockScript) -> ResolverId {
		script.resolutions().last().unwrap().0
	}

	#[test]
	fn remove_undoes_add_and_readd_replaces() {
		let (mut browser, mut provider, script) = started();
		let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

		for (name, uuid) in [("a", "one"), ("b", "two"), ("a", "three")] {
			browser.handle_browse(&mut provider, BrowseEvent::New(key(name, IpVersion::V4)));
			let id = last_resolution(&script);
			browser.handle_resolve(&mut provider, id, ResolveEvent::Found(resolved(uuid, v4)));
		}
		browser.handle_browse(&mut provider, BrowseEvent::Remove(key("b", IpVersion::V4)));

		let urls = browser.server_urls();
		assert_eq!(urls.len(), 1);
		assert_eq!(urls["three"][&IpVersion::V4], "tcp://10.0.0.1:5555");
	}

	#[test]
	fn completes_only_when_exhausted_and_idle() {
		let (mut browser, mut provider, script) = started();
		assert_eq!(browser.state(), BrowseState::Browsing);

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V4)));
		browser.handle_browse(&mut provider, BrowseEvent::AllForNow);
		assert_eq!(browser.in_flight(), 1);
		assert_eq!(browser.state(), BrowseState::Browsing);

		let id = last_resolution(&script);
		browser.handle_resolve(&mut provider, id, ResolveEvent::Failure("timeout".to_owned()));
		assert_eq!(browser.state(), BrowseState::Complete);
		assert!(browser.server_urls().is_empty());
	}

	#[test]
	fn resolves_on_the_browsed_protocol() {
		let (mut browser, mut provider, script) = started();
		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V6)));

		let (_, resolved_key, protocol) = script.resolutions().pop().unwrap();
		assert_eq!(resolved_key, key("a", IpVersion::V6));
		assert_eq!(protocol, IpVersion::V6);
	}

	#[test]
	fn missing_identity_tag_is_discarded() {
		let (mut browser, mut provider, script) = started();
		let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V4)));
		browser.handle_resolve(&mut provider, last_resolution(&script), ResolveEvent::Found(resolved("", v4)));

		browser.handle_browse(&mut provider, BrowseEvent::New(key("b", IpVersion::V4)));
		let mut untagged = resolved("x", v4);
		untagged.txt.clear();
		browser.handle_resolve(&mut provider, last_resolution(&script), ResolveEvent::Found(untagged));

		assert_eq!(browser.in_flight(), 0);
		assert!(browser.server_urls().is_empty());
	}

	#[test]
	fn ipv6_urls_carry_the_interface() {
		let (mut browser, mut provider, script) = started();
		let v6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V6)));
		browser.handle_resolve(&mut provider, last_resolution(&script), ResolveEvent::Found(resolved("one", v6)));

		assert_eq!(browser.server_urls()["one"][&IpVersion::V6], "tcp://[fe80::1%3]:5555");
	}

	#[test]
	fn failed_spawn_is_not_counted() {
		let (mut browser, mut provider, script) = started();
		script.reject_resolutions(true);

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V4)));
		browser.handle_browse(&mut provider, BrowseEvent::CacheExhausted);

		assert_eq!(browser.in_flight(), 0);
		assert_eq!(browser.state(), BrowseState::Complete);
	}

	#[test]
	fn browse_failure_cancels_and_ignores_late_results() {
		let (mut browser, mut provider, script) = started();
		let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V4)));
		browser.handle_browse(&mut provider, BrowseEvent::New(key("b", IpVersion::V4)));
		browser.handle_browse(&mut provider, BrowseEvent::Failure("daemon gone".to_owned()));

		assert_eq!(browser.state(), BrowseState::Complete);
		assert_eq!(script.released().len(), 2);

		let id = script.resolutions()[0].0;
		browser.handle_resolve(&mut provider, id, ResolveEvent::Found(resolved("one", v4)));
		assert!(browser.server_urls().is_empty());
	}

	#[test]
	fn events_before_start_are_ignored() {
		let (mut provider, script) = MockProvider::scripted();
		let mut browser = Browser::new();

		browser.handle_browse(&mut provider, BrowseEvent::New(key("a", IpVersion::V4)));
		browser.handle_browse(&mut provider, BrowseEvent::AllForNow);

		assert_eq!(browser.state(), BrowseState::Idle);
		assert!(script.resolutions().is_empty());
	}
}
