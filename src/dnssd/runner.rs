use super::handle::{RunnerHandle, RunnerHandleInner};
use crate::{
	browse::{BrowseState, Browser},
	errors::ProviderError,
	net::IpVersion,
	provider::{ClientState, Provider, ProviderEvent, ProviderInfo, PublishEvent, ServiceRecord},
	store::ServerUrls,
};
use std::sync::mpsc::Sender;
use tokio::sync::{mpsc, oneshot};

/// A request from a caller thread. Replies go through a blocking channel so that any
/// thread can wait on them.
pub(crate) enum Command {
	Status(Sender<bool>),
	Info(Sender<ProviderInfo>),
	Publish {
		record: ServiceRecord,
		reply: Sender<Result<(), ProviderError>>,
	},
	Query {
		ip_version: IpVersion,
		reply: Sender<ServerUrls>,
	},
}

enum Step {
	Command(Option<Command>),
	Event(ProviderEvent),
}

/// The event loop. It exclusively owns the provider and everything discovered through it.
pub(super) struct Runner<P> {
	provider: P,
	browser: Browser,
	waiting: Vec<Sender<ServerUrls>>,
}
impl<P: Provider> Runner<P> {
	pub(super) fn spawn(provider: P) -> Result<RunnerHandle, std::io::Error> {
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let (commands, commands_rx) = mpsc::unbounded_channel();

		let runner = Runner {
			provider,
			browser: Browser::new(),
			waiting: Vec::new(),
		};

		let thread = std::thread::Builder::new().name("SoapyDNSSD Event Loop".to_owned()).spawn(move || -> Result<(), std::io::Error> {
			tokio::runtime::Builder::new_current_thread()
				.thread_name("SoapyDNSSD Event Loop (Tokio)")
				.enable_all()
				.build()?
				.block_on(runner.run(commands_rx, shutdown_rx));
			Ok(())
		})?;

		Ok(RunnerHandle(Some(RunnerHandleInner {
			thread,
			shutdown_tx,
			commands,
		})))
	}

	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, shutdown_rx: oneshot::Receiver<()>) {
		log::debug!("Discovery event loop started");

		tokio::select! {
			biased;
			_ = shutdown_rx => {}
			_ = self.event_loop(&mut commands) => {}
		}

		log::debug!("Discovery event loop stopped");
	}

	async fn event_loop(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
		loop {
			let step = tokio::select! {
				biased;
				command = commands.recv() => Step::Command(command),
				event = self.provider.next_event() => Step::Event(event),
			};

			match step {
				Step::Command(Some(command)) => self.handle_command(command),
				Step::Command(None) => return,
				Step::Event(event) => self.handle_event(event),
			}

			if self.browser.state() == BrowseState::Complete && !self.waiting.is_empty() {
				let urls = self.browser.server_urls();
				for reply in self.waiting.drain(..) {
					reply.send(urls.clone()).ok();
				}
			}
		}
	}

	fn handle_command(&mut self, command: Command) {
		match command {
			Command::Status(reply) => {
				reply.send(self.provider.state() != ClientState::Failure).ok();
			}

			Command::Info(reply) => {
				reply.send(self.provider.info()).ok();
			}

			Command::Publish { record, reply } => {
				reply.send(self.provider.publish(record)).ok();
			}

			Command::Query { ip_version, reply } => match self.browser.state() {
				BrowseState::Idle => {
					if self.provider.state() == ClientState::Failure {
						reply.send(ServerUrls::new()).ok();
					} else if let Err(err) = self.browser.start(&mut self.provider, ip_version) {
						log::error!("Failed to create browser: {err}");
						reply.send(ServerUrls::new()).ok();
					} else {
						self.waiting.push(reply);
					}
				}

				BrowseState::Browsing => {
					log::debug!("Browser already created, ignoring requested scope {ip_version}");
					self.waiting.push(reply)
				}

				BrowseState::Complete => {
					log::debug!("Browser already created, ignoring requested scope {ip_version}");
					reply.send(self.browser.server_urls()).ok();
				}
			},
		}
	}

	fn handle_event(&mut self, event: ProviderEvent) {
		match event {
			ProviderEvent::Client(state) => match state {
				ClientState::Running => log::debug!("Discovery client running"),
				ClientState::Connecting => log::debug!("Discovery client connecting"),
				ClientState::Collision => log::error!("Discovery client failure: host name collision"),
				ClientState::Failure => {
					log::error!("Discovery client failure");
					self.browser.abandon(&mut self.provider);
				}
			},

			ProviderEvent::Publish(event) => match event {
				PublishEvent::Established => log::debug!("Service registration established"),
				PublishEvent::Collision => log::error!("Service registration failure: name collision"),
				PublishEvent::Failure(reason) => log::error!("Service registration failure: {reason}"),
			},

			ProviderEvent::Browse(event) => self.browser.handle_browse(&mut self.provider, event),

			ProviderEvent::Resolve { id, event } => self.browser.handle_resolve(&mut self.provider, id, event),
		}
	}
}
