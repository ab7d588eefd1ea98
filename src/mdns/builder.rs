use super::{Config, MdnsProvider};
use crate::{
	net::{IpVersion, TargetInterfaceV4, TargetInterfaceV6},
	socket::MdnsSocket,
	util::local_host_name,
};
use std::time::Duration;

pub struct MdnsProviderBuilder {
	loopback: bool,
	interface_v4: TargetInterfaceV4,
	interface_v6: TargetInterfaceV6,
	host_name: Option<String>,
	config: Config,
}
impl MdnsProviderBuilder {
	pub fn new() -> Self {
		Self {
			loopback: true,
			interface_v4: TargetInterfaceV4::All,
			interface_v6: TargetInterfaceV6::All,
			host_name: None,
			config: Config {
				query_interval: Duration::from_secs(10),
				settle_time: Duration::from_secs(2),
				max_ignored_queries: 2,
				resolve_timeout: Duration::from_secs(5),
				ttl: 120,
			},
		}
	}

	/// Whether multicast packets are looped back to this host.
	///
	/// Enabled by default, so that servers running on the same host are discovered.
	pub fn loopback(mut self, loopback: bool) -> Self {
		self.loopback = loopback;
		self
	}

	pub fn interface_v4(mut self, interface: TargetInterfaceV4) -> Self {
		self.interface_v4 = interface;
		self
	}

	pub fn interface_v6(mut self, interface: TargetInterfaceV6) -> Self {
		self.interface_v6 = interface;
		self
	}

	/// The host name advertised in published records. Defaults to the name of this machine.
	pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
		self.host_name = Some(host_name.into());
		self
	}

	/// How often browse queries are sent.
	pub fn query_interval(mut self, interval: Duration) -> Self {
		self.config.query_interval = interval;
		self
	}

	/// How long to collect responses after browsing starts before the cache is reported as exhausted.
	pub fn settle_time(mut self, settle_time: Duration) -> Self {
		self.config.settle_time = settle_time;
		self
	}

	/// The number of browse queries a browsed record must go unanswered for before it is considered removed.
	///
	/// If set to zero, records are only removed when their publisher withdraws them.
	pub fn max_ignored_queries(mut self, max: u8) -> Self {
		self.config.max_ignored_queries = max;
		self
	}

	/// How long a resolution may wait for missing records before it fails.
	pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
		self.config.resolve_timeout = timeout;
		self
	}

	/// The TTL, in seconds, of published records.
	pub fn ttl(mut self, ttl: u32) -> Self {
		self.config.ttl = ttl;
		self
	}

	/// Opens the multicast sockets for the given IP version.
	///
	/// With [`IpVersion::Unspec`], falls back to IPv4 only if IPv6 is unavailable.
	pub fn build(self, ip_version: IpVersion) -> Result<MdnsProvider, std::io::Error> {
		let MdnsProviderBuilder {
			loopback,
			interface_v4,
			interface_v6,
			host_name,
			config,
		} = self;

		let socket = match ip_version {
			IpVersion::V4 => MdnsSocket::new_v4(loopback, interface_v4)?,
			IpVersion::V6 => MdnsSocket::new_v6(loopback, interface_v6)?,
			IpVersion::Unspec => match MdnsSocket::new(loopback, interface_v4, interface_v6) {
				Ok(socket) => socket,
				Err(err) => {
					log::warn!("IPv6 multicast unavailable, falling back to IPv4 only: {err}");
					MdnsSocket::new_v4(loopback, interface_v4)?
				}
			},
		};

		Ok(MdnsProvider::new(socket, host_name.unwrap_or_else(local_host_name), loopback, config))
	}
}
impl Default for MdnsProviderBuilder {
	fn default() -> Self {
		Self::new()
	}
}
