use crate::{
	errors::ShutdownError,
	net::IpVersion,
	provider::{ClientState, Provider, ProviderInfo, ServiceRecord},
	store::ServerUrls,
	PRODUCT_NAME, SERVICE_TYPE, UUID_TXT_KEY,
};
use std::{
	collections::BTreeMap,
	sync::{mpsc::Sender, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc::UnboundedSender;

#[cfg(feature = "mdns")]
use crate::mdns::{MdnsProvider, MdnsProviderBuilder};

mod handle;
use handle::RunnerHandle;

mod runner;
use runner::{Command, Runner};

enum Worker<P> {
	/// The provider could not be created.
	Unavailable,

	/// The provider exists but nothing is pumping it yet.
	Idle(P),

	/// The event loop owns the provider.
	Running(RunnerHandle),
}

/// Publishes this server and discovers the others.
///
/// Nothing here fails across the public boundary: errors are logged and turn into no-ops or
/// empty results, so a process that cannot use discovery keeps working with direct addresses.
///
/// The event loop is started by the first successful [`register_service`](Dnssd::register_service)
/// or the first [`server_urls`](Dnssd::server_urls) call, and runs until the handle is dropped
/// or [`shutdown`](Dnssd::shutdown).
pub struct Dnssd<P: Provider> {
	worker: Mutex<Worker<P>>,
}

#[cfg(feature = "mdns")]
#[cfg_attr(docsrs, doc(cfg(feature = "mdns")))]
impl Dnssd<MdnsProvider> {
	/// Creates a handle backed by the built-in multicast DNS provider.
	///
	/// If the multicast sockets cannot be opened the error is logged and the handle is unavailable.
	pub fn new() -> Self {
		match MdnsProviderBuilder::new().build(IpVersion::Unspec) {
			Ok(provider) => Self::with_provider(provider),
			Err(err) => {
				log::error!("Failed to start mDNS provider: {err}");
				Self::unavailable()
			}
		}
	}
}

#[cfg(feature = "mdns")]
impl Default for Dnssd<MdnsProvider> {
	fn default() -> Self {
		Self::new()
	}
}

impl<P: Provider> Dnssd<P> {
	pub fn with_provider(provider: P) -> Self {
		Self {
			worker: Mutex::new(Worker::Idle(provider)),
		}
	}

	/// A handle on which every operation is a no-op.
	pub fn unavailable() -> Self {
		Self {
			worker: Mutex::new(Worker::Unavailable),
		}
	}

	fn worker(&self) -> MutexGuard<'_, Worker<P>> {
		self.worker.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn start(worker: &mut Worker<P>) {
		if !matches!(worker, Worker::Idle(_)) {
			return;
		}
		if let Worker::Idle(provider) = std::mem::replace(worker, Worker::Unavailable) {
			match Runner::spawn(provider) {
				Ok(runner) => *worker = Worker::Running(runner),
				Err(err) => log::error!("Failed to start discovery event loop: {err}"),
			}
		}
	}

	/// Whether the provider is usable, i.e. not in a failed state.
	pub fn status(&self) -> bool {
		let commands = match &*self.worker() {
			Worker::Unavailable => return false,
			Worker::Idle(provider) => return provider.state() != ClientState::Failure,
			Worker::Running(runner) => runner.commands(),
		};
		request(commands, Command::Status).unwrap_or(false)
	}

	/// Version, host name and domain of the provider, if there is one.
	pub fn info(&self) -> Option<ProviderInfo> {
		let commands = match &*self.worker() {
			Worker::Unavailable => return None,
			Worker::Idle(provider) => return Some(provider.info()),
			Worker::Running(runner) => runner.commands(),
		};
		request(commands, Command::Info)
	}

	/// Logs [`info`](Dnssd::info).
	pub fn print_info(&self) {
		match self.info() {
			Some(info) => {
				log::info!("DNS-SD version:  {}", info.version);
				log::info!("DNS-SD hostname: {}", info.host_name);
				log::info!("DNS-SD domain:   {}", info.domain);
				log::info!("DNS-SD FQDN:     {}", info.fqdn);
			}
			None => log::info!("DNS-SD unavailable"),
		}
	}

	/// Advertises a server with identity tag `uuid` listening on port `service`.
	///
	/// Best effort: failures are logged. Call at most once per process.
	pub fn register_service(&self, uuid: &str, service: &str, ip_version: IpVersion) {
		let port = match service.trim().parse::<u16>() {
			Ok(port) => port,
			Err(err) => {
				log::error!("Not registering service: invalid port {service:?}: {err}");
				return;
			}
		};

		let mut worker = self.worker();
		if let Worker::Idle(provider) = &mut *worker {
			if provider.state() == ClientState::Failure {
				log::error!("Not registering service: discovery client failed");
				return;
			}

			let record = service_record(&provider.info().host_name, uuid, port, ip_version);
			match provider.publish(record) {
				Ok(()) => {
					log::debug!("Registered {SERVICE_TYPE} [{uuid}] on port {port}");
					Self::start(&mut worker);
				}
				Err(err) => log::error!("Failed to register service: {err}"),
			}
			return;
		}

		let commands = match &*worker {
			Worker::Running(runner) => runner.commands(),
			_ => {
				log::error!("Not registering service: discovery unavailable");
				return;
			}
		};
		drop(worker);

		let info = match request(commands.clone(), Command::Info) {
			Some(info) => info,
			None => {
				log::error!("Not registering service: discovery event loop stopped");
				return;
			}
		};

		let record = service_record(&info.host_name, uuid, port, ip_version);
		match request(commands, |reply| Command::Publish { record, reply }) {
			Some(Ok(())) => log::debug!("Registered {SERVICE_TYPE} [{uuid}] on port {port}"),
			Some(Err(err)) => log::error!("Failed to register service: {err}"),
			None => log::error!("Not registering service: discovery event loop stopped"),
		}
	}

	/// Reachable servers, grouped by identity tag.
	///
	/// The first call browses on `ip_version` and blocks until the initial sweep is complete;
	/// later calls return the current, continuously updated results right away.
	pub fn server_urls(&self, ip_version: IpVersion) -> ServerUrls {
		let commands = {
			let mut worker = self.worker();
			let failed = match &*worker {
				Worker::Unavailable => true,
				Worker::Idle(provider) => provider.state() == ClientState::Failure,
				Worker::Running(_) => false,
			};
			if failed {
				return ServerUrls::new();
			}

			Self::start(&mut worker);
			match &*worker {
				Worker::Running(runner) => runner.commands(),
				_ => None,
			}
		};

		request(commands, |reply| Command::Query { ip_version, reply }).unwrap_or_default()
	}

	/// Stops the event loop and waits for it to exit.
	pub fn shutdown(self) -> Result<(), ShutdownError> {
		let worker = std::mem::replace(&mut *self.worker(), Worker::Unavailable);
		match worker {
			Worker::Running(mut runner) => runner.shutdown(),
			Worker::Idle(_) | Worker::Unavailable => Ok(()),
		}
	}
}

/// Sends a command to the event loop and waits for its reply.
fn request<R>(commands: Option<UnboundedSender<Command>>, command: impl FnOnce(Sender<R>) -> Command) -> Option<R> {
	let (reply, reply_rx) = std::sync::mpsc::channel();
	commands?.send(command(reply)).ok()?;
	reply_rx.recv().ok()
}

fn service_record(host_name: &str, uuid: &str, port: u16, scope: IpVersion) -> ServiceRecord {
	ServiceRecord {
		name: format!("{PRODUCT_NAME} @ {host_name}"),
		service_type: SERVICE_TYPE.to_owned(),
		port,
		txt: BTreeMap::from([(UUID_TXT_KEY.to_owned(), uuid.to_owned())]),
		scope,
	}
}
