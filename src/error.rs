//! A dedicated error for the fallible construction APIs: name conversion, reply assembly, etc.
//!
//! The cache operations themselves are nullable by contract (a miss, an expired
//! entry and an exhausted region all look the same to the caller), so errors
//! only surface where something is being built from caller input.

#[derive(Debug)]
pub enum DNSError {
    DNS(String),
    DNSInternalError(InternalError),
}

#[derive(Debug, PartialEq)]
pub enum InternalError {
    DnsDomainNameTooLong,
    DnsLabelTooLong,
    EmptyDomainName,
    SectionCountMismatch,
}

impl DNSError {
    // Helper function to create a new DNS error from a string
    pub fn new(s: &str) -> Self {
        DNSError::DNS(String::from(s))
    }
}

/// A specific custom `Result` for all functions
pub type DNSResult<T> = Result<T, DNSError>;

// All convertion for internal errors for DNSError
impl From<String> for DNSError {
    fn from(err: String) -> Self {
        DNSError::DNS(err)
    }
}

impl From<InternalError> for DNSError {
    fn from(err: InternalError) -> Self {
        DNSError::DNSInternalError(err)
    }
}
