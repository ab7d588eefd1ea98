#[derive(Debug, Error)]
/// An error reported by a discovery [`Provider`](crate::provider::Provider)
pub enum ProviderError {
	#[error("The discovery provider is not running")]
	/// The provider's client is in a failed state
	NotRunning,

	#[error("Bad DNS name: {0}")]
	/// A name could not be encoded as a DNS name
	BadDnsName(String),

	#[error("The service requires at least one advertisement address")]
	/// No local address matches the requested IP scope
	MissingAdvertisementAddr,

	#[error("TXT record too long (max 255 bytes)")]
	/// A TXT entry is longer than 255 bytes
	RecordTooLong,

	#[error("There are too many IP addresses to advertise")]
	/// The record set does not fit in a single DNS message
	TooManyIpAddresses,

	#[error("Browsing has already started")]
	/// The provider only supports one browser
	AlreadyBrowsing,

	#[error("Browsing has not started")]
	/// A resolution was requested without a browser
	NotBrowsing,

	#[error("{0}")]
	/// The provider rejected the request
	Rejected(String),

	#[error("I/O error: {0}")]
	/// An I/O error occurred
	IoError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
/// An error occurred while shutting down the event loop
pub enum ShutdownError {
	#[error("I/O error: {0}")]
	/// The event loop exited with an I/O error
	IoError(std::io::Error),

	#[error("The event loop thread panicked")]
	/// The event loop thread panicked
	ThreadJoinError(Box<dyn std::any::Any + Send + 'static>),
}
