//! Networking utilities and abstractions

use std::{fmt, net::IpAddr, num::NonZeroU32};

/// The [`if_addrs`](https://crates.io/crates/if_addrs) crate is used to discover network interfaces on the system.
///
/// Here is a re-export for your convenience.
pub use if_addrs;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// The version of IP a record is published, browsed or resolved on.
pub enum IpVersion {
	#[default]
	/// No preference: both IPv4 and IPv6.
	Unspec,

	/// IPv4 only.
	V4,

	/// IPv6 only.
	V6,
}
impl IpVersion {
	#[inline]
	pub fn includes_v4(self) -> bool {
		matches!(self, Self::Unspec | Self::V4)
	}

	#[inline]
	pub fn includes_v6(self) -> bool {
		matches!(self, Self::Unspec | Self::V6)
	}

	/// Whether `other` is within this scope.
	#[inline]
	pub fn includes(self, other: IpVersion) -> bool {
		match other {
			Self::Unspec => self == Self::Unspec,
			Self::V4 => self.includes_v4(),
			Self::V6 => self.includes_v6(),
		}
	}

	/// The IP version of the given address.
	#[inline]
	pub fn of(addr: &IpAddr) -> Self {
		match addr {
			IpAddr::V4(_) => Self::V4,
			IpAddr::V6(_) => Self::V6,
		}
	}

	/// The numeric version, `0` when unspecified.
	#[inline]
	pub fn number(self) -> u8 {
		match self {
			Self::Unspec => 0,
			Self::V4 => 4,
			Self::V6 => 6,
		}
	}
}
impl fmt::Display for IpVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Unspec => f.write_str("IPv4/IPv6"),
			Self::V4 => f.write_str("IPv4"),
			Self::V6 => f.write_str("IPv6"),
		}
	}
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A wrapper around a raw IPv6 interface index.
///
/// With IPv6, interfaces are identified by their index, which is a number that is
/// guaranteed to be unique for the lifetime of the system.
pub struct Ipv6Interface(pub NonZeroU32);
impl Ipv6Interface {
	/// Attempts to resolve the interface index from the given interface name.
	#[cfg(feature = "mdns")]
	pub fn from_name(name: &str) -> Result<Self, std::io::Error> {
		Ok(Self(crate::util::iface_v6_name_to_index(name)?))
	}

	#[inline(always)]
	/// Creates a new `Ipv6Interface` from the given raw interface index.
	pub fn from_raw(raw: NonZeroU32) -> Self {
		Self(raw)
	}

	#[inline(always)]
	/// Returns the raw interface index.
	///
	/// This will always be a non-zero value.
	pub fn as_u32(&self) -> u32 {
		self.0.get()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The interface to use for multicast.
pub enum TargetInterface<Addr> {
	/// Let the OS decide which interface to use.
	Default,

	/// Use as many interfaces as possible, falling back to `Default` if none are available.
	All,

	/// Use the given interface.
	Specific(Addr),
}

/// A `TargetInterface` for IPv4.
pub type TargetInterfaceV4 = TargetInterface<std::net::Ipv4Addr>;

/// A `TargetInterface` for IPv6.
pub type TargetInterfaceV6 = TargetInterface<Ipv6Interface>;

#[cfg(test)]
mod tests {
	use super::IpVersion;

	#[test]
	fn unspecified_scope_covers_both_families() {
		assert!(IpVersion::Unspec.includes(IpVersion::V4));
		assert!(IpVersion::Unspec.includes(IpVersion::V6));
		assert!(!IpVersion::V4.includes(IpVersion::V6));
		assert!(!IpVersion::V6.includes(IpVersion::Unspec));
		assert_eq!(IpVersion::V6.number(), 6);
	}
}
