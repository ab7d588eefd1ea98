use soapy_dnssd::{Dnssd, IpVersion};

fn main() {
	simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Debug).init().unwrap();

	let mut args = std::env::args().skip(1);
	let uuid = args.next().unwrap_or_else(|| "soapy-dnssd-demo".to_owned());
	let port = args.next().unwrap_or_else(|| "55132".to_owned());

	let dnssd = Dnssd::new();
	dnssd.print_info();
	dnssd.register_service(&uuid, &port, IpVersion::Unspec);

	println!("Advertising {uuid} on port {port}, press Ctrl+C to stop");

	loop {
		std::thread::park();
	}
}
