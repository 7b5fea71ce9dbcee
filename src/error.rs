use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error taxonomy (spec.md §7).
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid HTTP response")]
    InvalidResponse,

    #[error("malformed HTTP header: {0}")]
    MalformedHeader(String),

    #[error("malformed HTTP body: {0}")]
    MalformedBody(String),

    #[error("HTTP {0}: {1}")]
    Http(u16, String),

    #[error("SOAP fault {code}: {description}")]
    SoapFault { code: u16, description: String },

    #[error("invalid subscription id")]
    InvalidSubscriptionId,

    #[error("subscription lost")]
    SubscriptionLost,

    #[error("invalid Timeout header: {0:?}")]
    InvalidTimeoutHeader(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("xml attribute error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("xml decode error: {0}")]
    XmlDecode(String),

    #[error("service {0:?} is not implemented by this device")]
    UnsupportedService(String),

    #[error("action {0:?} is not advertised as supported by this service")]
    UnsupportedAction(String),

    #[error("invalid argument: {0}")]
    InvalidArguments(String),
}

impl Error {
    /// Maps to the well known UPnP error codes carried in a SOAP fault
    /// (spec.md §7); used by device-side dispatch to decide the fault body
    /// to write back when a handler doesn't raise a typed `UpnpError`.
    pub fn as_upnp_error_code(&self) -> u16 {
        match self {
            Error::UnsupportedAction(_) => 401,
            Error::InvalidArguments(_) => 402,
            Error::InvalidSubscriptionId => 412,
            _ => 501,
        }
    }
}

/// Lets a device action handler propagate any crate error with `?` and have
/// it land in the SOAP fault the dispatcher writes back, rather than
/// requiring every handler to map to [`crate::soap::fault::UpnpError`] by
/// hand.
impl From<Error> for crate::soap::fault::UpnpError {
    fn from(err: Error) -> Self {
        crate::soap::fault::UpnpError::new(err.as_upnp_error_code(), err.to_string())
    }
}
