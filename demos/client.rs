use soapy_dnssd::{Dnssd, IpVersion};
use std::time::Duration;

fn main() {
	simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Info).init().unwrap();

	let dnssd = Dnssd::new();
	dnssd.print_info();

	println!("Waiting for the first discovery sweep...");

	loop {
		let servers = dnssd.server_urls(IpVersion::Unspec);
		if servers.is_empty() {
			println!("No servers found");
		}
		for (uuid, urls) in servers {
			for (ip_version, url) in urls {
				println!("{uuid} ({ip_version}): {url}");
			}
		}

		std::thread::sleep(Duration::from_secs(5));
	}
}
