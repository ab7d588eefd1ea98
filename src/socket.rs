use crate::{
	net::{IpVersion, TargetInterface, TargetInterfaceV4, TargetInterfaceV6},
	util::iface_v6_name_to_index,
	MDNS_PORT, MDNS_V4_IP, MDNS_V6_IP,
};
use std::{
	collections::BTreeSet,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};
use tokio::net::UdpSocket as AsyncUdpSocket;

const V4_GROUP: SocketAddr = SocketAddr::V4(SocketAddrV4::new(MDNS_V4_IP, MDNS_PORT));
const V6_GROUP: SocketAddr = SocketAddr::V6(SocketAddrV6::new(MDNS_V6_IP, MDNS_PORT, 0, 0));

pub(crate) type AsyncMdnsSocket = MdnsSocket<AsyncUdpSocket>;
pub(crate) enum MdnsSocket<S = std::net::UdpSocket> {
	V4(S),
	V6(Ipv6MdnsSocket<S>),
	Multicol { v4: S, v6: Ipv6MdnsSocket<S> },
}
impl<S> MdnsSocket<S> {
	pub fn ip_version(&self) -> IpVersion {
		match self {
			Self::V4(_) => IpVersion::V4,
			Self::V6(_) => IpVersion::V6,
			Self::Multicol { .. } => IpVersion::Unspec,
		}
	}
}
impl MdnsSocket<std::net::UdpSocket> {
	pub fn new(loopback: bool, interface_v4: TargetInterfaceV4, interface_v6: TargetInterfaceV6) -> Result<Self, std::io::Error> {
		Ok(Self::Multicol {
			v4: Self::bind_v4(loopback, interface_v4)?,
			v6: Self::bind_v6(loopback, interface_v6)?,
		})
	}

	pub fn new_v4(loopback: bool, interface: TargetInterfaceV4) -> Result<Self, std::io::Error> {
		Ok(Self::V4(Self::bind_v4(loopback, interface)?))
	}

	pub fn new_v6(loopback: bool, interface: TargetInterfaceV6) -> Result<Self, std::io::Error> {
		Ok(Self::V6(Self::bind_v6(loopback, interface)?))
	}

	fn bind_v4(loopback: bool, interface: TargetInterfaceV4) -> Result<std::net::UdpSocket, std::io::Error> {
		let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
		socket.set_reuse_address(true)?;
		socket.set_multicast_loop_v4(loopback)?;

		#[cfg(unix)]
		{
			socket.set_reuse_port(true)?;
		}

		match interface {
			TargetInterface::Default => {
				socket.join_multicast_v4(&MDNS_V4_IP, &Ipv4Addr::UNSPECIFIED)?;
			}

			TargetInterface::Specific(iface) => {
				socket.join_multicast_v4(&MDNS_V4_IP, &iface)?;
			}

			TargetInterface::All => {
				let mut did_join = false;
				for iface in if_addrs::get_if_addrs()
					.map(|ifaces| {
						ifaces
							.into_iter()
							.filter(|iface| !iface.is_loopback())
							.filter_map(|iface| if let IpAddr::V4(iface) = iface.addr.ip() { Some(iface) } else { None })
							.collect::<BTreeSet<Ipv4Addr>>()
					})
					.unwrap_or_default()
				{
					if socket.join_multicast_v4(&MDNS_V4_IP, &iface).is_ok() {
						did_join = true;
					}
				}
				if !did_join {
					// Fallback to default
					socket.join_multicast_v4(&MDNS_V4_IP, &Ipv4Addr::UNSPECIFIED)?;
				}
			}
		}

		socket.bind(&socket2::SockAddr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT)))?;

		socket.set_nonblocking(true)?;

		Ok(socket.into())
	}

	fn bind_v6(loopback: bool, interface: TargetInterfaceV6) -> Result<Ipv6MdnsSocket, std::io::Error> {
		let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
		socket.set_reuse_address(true)?;
		socket.set_only_v6(true)?;
		socket.set_multicast_loop_v6(loopback)?;

		#[cfg(unix)]
		{
			socket.set_reuse_port(true)?;
		}

		let all_interfaces = match interface {
			TargetInterface::Specific(iface) => BTreeSet::from([iface.as_u32()]),
			TargetInterface::Default | TargetInterface::All => if_addrs::get_if_addrs()
				.map(|ifaces| {
					ifaces
						.into_iter()
						.filter(|iface| !iface.is_loopback() && iface.addr.ip().is_ipv6())
						.filter_map(|iface| {
							let index = iface_v6_name_to_index(&iface.name).ok()?.get();
							socket.set_multicast_if_v6(index).ok()?;
							Some(index)
						})
						.collect::<BTreeSet<_>>()
				})
				.unwrap_or_default(),
		};

		match interface {
			TargetInterface::Default => {
				socket.join_multicast_v6(&MDNS_V6_IP, 0)?;
			}

			TargetInterface::Specific(iface) => {
				socket.join_multicast_v6(&MDNS_V6_IP, iface.as_u32())?;
			}

			TargetInterface::All => {
				let mut did_join = false;

				for iface in all_interfaces.iter().copied() {
					if socket.join_multicast_v6(&MDNS_V6_IP, iface).is_ok() {
						did_join = true;
					}
				}

				if !did_join {
					// Fallback to default
					socket.join_multicast_v6(&MDNS_V6_IP, 0)?;
				}
			}
		}

		socket.bind(&socket2::SockAddr::from(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MDNS_PORT)))?;

		socket.set_nonblocking(true)?;

		let all_interfaces = match interface {
			TargetInterface::Default => BTreeSet::new(),
			_ => all_interfaces,
		};
		Ipv6MdnsSocket::new(socket, all_interfaces)
	}

	/// Registers the sockets with the Tokio reactor. Must be called from within a runtime.
	pub fn into_async(self) -> Result<AsyncMdnsSocket, std::io::Error> {
		Ok(match self {
			Self::V4(v4) => AsyncMdnsSocket::V4(AsyncUdpSocket::from_std(v4)?),
			Self::V6(v6) => AsyncMdnsSocket::V6(v6.into_async()?),
			Self::Multicol { v4, v6 } => AsyncMdnsSocket::Multicol {
				v4: AsyncUdpSocket::from_std(v4)?,
				v6: v6.into_async()?,
			},
		})
	}
}
impl AsyncMdnsSocket {
	pub async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> Result<(), std::io::Error> {
		match (addr, self) {
			(SocketAddr::V4(addr), Self::V4(v4) | Self::Multicol { v4, .. }) => v4.send_to(packet, addr).await.map(|_| ()),

			(SocketAddr::V6(_), Self::V6(v6) | Self::Multicol { v6, .. }) => v6.socket().send_to(packet, addr).await.map(|_| ()),

			_ => Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid address")),
		}
	}

	/// Sends a packet to the multicast group of every family in `scope` that this socket covers.
	///
	/// A failure on one family does not stop the send on the other; the first error is returned.
	pub async fn send_multicast(&self, packet: &[u8], scope: IpVersion) -> Result<(), std::io::Error> {
		let v4 = match self {
			Self::V4(v4) | Self::Multicol { v4, .. } if scope.includes_v4() => Some(async move { v4.send_to(packet, V4_GROUP).await.map(|_| ()) }),
			_ => None,
		};
		let v6 = match self {
			Self::V6(v6) | Self::Multicol { v6, .. } if scope.includes_v6() => Some(v6.send_to_multicast(packet, V6_GROUP)),
			_ => None,
		};
		send_each_family(v4, v6).await
	}

	/// Same as [`send_multicast`](AsyncMdnsSocket::send_multicast), but gives up instead of waiting for the socket to become writable.
	pub fn try_send_multicast(&self, packet: &[u8], scope: IpVersion) -> Result<(), std::io::Error> {
		let mut result = Ok(());
		if scope.includes_v4() {
			if let Self::V4(v4) | Self::Multicol { v4, .. } = self {
				result = v4.try_send_to(packet, V4_GROUP).map(|_| ());
			}
		}
		if scope.includes_v6() {
			if let Self::V6(v6) | Self::Multicol { v6, .. } = self {
				result = result.and(v6.try_send_to_multicast(packet, V6_GROUP));
			}
		}
		result
	}

	/// Receives the next packet into the buffer matching the family it arrived on.
	///
	/// Cancel safe.
	pub async fn recv_multicast(&self, buffers: &mut RecvBuffers) -> Result<(usize, SocketAddr), std::io::Error> {
		match self {
			Self::V4(socket) => socket.recv_from(&mut buffers.v4).await,
			Self::V6(v6) => v6.socket().recv_from(&mut buffers.v6).await,
			Self::Multicol { v4, v6 } => {
				let RecvBuffers { v4: buf_v4, v6: buf_v6 } = buffers;
				tokio::select! {
					v4 = v4.recv_from(buf_v4) => v4,
					v6 = v6.socket().recv_from(buf_v6) => v6,
				}
			}
		}
	}
}

pub(crate) struct RecvBuffers {
	v4: Vec<u8>,
	v6: Vec<u8>,
}
impl RecvBuffers {
	pub fn new(size: usize) -> Self {
		Self {
			v4: vec![0; size],
			v6: vec![0; size],
		}
	}

	/// The packet most recently received from `addr`.
	pub fn packet(&self, addr: &SocketAddr, count: usize) -> &[u8] {
		let buf = match addr {
			SocketAddr::V4(_) => &self.v4,
			SocketAddr::V6(_) => &self.v6,
		};
		&buf[..count.min(buf.len())]
	}
}

/// Hacky abstraction that allows us to send to multicast on a group of interfaces
pub(crate) enum Ipv6MdnsSocket<S = std::net::UdpSocket> {
	Single(S),
	Multi { socket: S, ifaces: BTreeSet<u32> },
}
impl Ipv6MdnsSocket {
	fn new(socket: socket2::Socket, ifaces: BTreeSet<u32>) -> Result<Self, std::io::Error> {
		let mut iter = ifaces.iter().copied();
		match (iter.next(), iter.next()) {
			(None, _) => socket.set_multicast_if_v6(0)?,
			(Some(iface), None) => socket.set_multicast_if_v6(iface)?,
			(Some(_), Some(_)) => {
				return Ok(Self::Multi {
					socket: socket.into(),
					ifaces,
				})
			}
		}

		Ok(Self::Single(socket.into()))
	}

	fn into_async(self) -> Result<Ipv6MdnsSocket<AsyncUdpSocket>, std::io::Error> {
		Ok(match self {
			Self::Single(socket) => Ipv6MdnsSocket::Single(AsyncUdpSocket::from_std(socket)?),
			Self::Multi { socket, ifaces } => Ipv6MdnsSocket::Multi {
				socket: AsyncUdpSocket::from_std(socket)?,
				ifaces,
			},
		})
	}
}
impl Ipv6MdnsSocket<AsyncUdpSocket> {
	pub async fn send_to_multicast(&self, packet: &[u8], addr: SocketAddr) -> Result<(), std::io::Error> {
		match self {
			Self::Single(socket) => {
				socket.send_to(packet, addr).await?;
			}

			Self::Multi { socket, ifaces } => {
				debug_assert!(ifaces.len() > 1);

				for iface in ifaces.iter().copied() {
					socket2::SockRef::from(socket).set_multicast_if_v6(iface)?;
					socket.send_to(packet, addr).await?;
				}
			}
		}

		Ok(())
	}

	fn try_send_to_multicast(&self, packet: &[u8], addr: SocketAddr) -> Result<(), std::io::Error> {
		match self {
			Self::Single(socket) => {
				socket.try_send_to(packet, addr)?;
			}

			Self::Multi { socket, ifaces } => {
				for iface in ifaces.iter().copied() {
					socket2::SockRef::from(socket).set_multicast_if_v6(iface)?;
					socket.try_send_to(packet, addr)?;
				}
			}
		}

		Ok(())
	}

	fn socket(&self) -> &AsyncUdpSocket {
		match self {
			Self::Single(socket) => socket,
			Self::Multi { socket, .. } => socket,
		}
	}
}

/// Runs the send for each family, reporting the first error once both have been tried.
async fn send_each_family<V4, V6>(v4: Option<V4>, v6: Option<V6>) -> Result<(), std::io::Error>
where
	V4: std::future::Future<Output = Result<(), std::io::Error>>,
	V6: std::future::Future<Output = Result<(), std::io::Error>>,
{
	let v4 = match v4 {
		Some(send) => send.await,
		None => Ok(()),
	};
	let v6 = match v6 {
		Some(send) => send.await,
		None => Ok(()),
	};
	v4.and(v6)
}
