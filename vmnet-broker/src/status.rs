//! Status codes returned by the vmnet-broker service.
//!
//! The broker reports failures as small integers. Known codes map to a
//! closed set of variants with fixed messages; anything else is kept
//! verbatim in [`BrokerError::Unknown`] so that replies from newer brokers
//! are never lost or misreported as a known failure.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Message for codes outside the known set.
pub const UNKNOWN_STATUS_MESSAGE: &str = "(unknown status)";

/// Status code used by the broker for a successful reply.
pub const SUCCESS: u32 = 0;

/// An error status returned by (or on the way to) the broker.
///
/// Two values are equal when their numeric codes are equal, including in
/// the unknown range: `BrokerError::Unknown(5) == BrokerError::NotFound`.
/// Use [`BrokerError::from_code`] to get the canonical variant for a code.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("{}", self.message())]
pub enum BrokerError {
    /// The broker could not be reached over IPC.
    XpcFailure,
    /// The broker reply could not be decoded.
    InvalidReply,
    /// The caller is not allowed to use this network.
    NotAllowed,
    /// Malformed network name or request.
    InvalidRequest,
    /// The named network is not configured.
    NotFound,
    /// The broker failed to instantiate the network.
    CreateFailure,
    /// Unspecified failure inside the broker.
    InternalError,
    /// A code this client does not know about.
    Unknown(u32),
}

impl BrokerError {
    /// Every known status, in code order.
    pub const KNOWN: [BrokerError; 7] = [
        BrokerError::XpcFailure,
        BrokerError::InvalidReply,
        BrokerError::NotAllowed,
        BrokerError::InvalidRequest,
        BrokerError::NotFound,
        BrokerError::CreateFailure,
        BrokerError::InternalError,
    ];

    /// Decode a raw status code.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => BrokerError::XpcFailure,
            2 => BrokerError::InvalidReply,
            3 => BrokerError::NotAllowed,
            4 => BrokerError::InvalidRequest,
            5 => BrokerError::NotFound,
            6 => BrokerError::CreateFailure,
            7 => BrokerError::InternalError,
            other => BrokerError::Unknown(other),
        }
    }

    /// The raw status code, as sent on the wire.
    pub fn code(&self) -> u32 {
        match self {
            BrokerError::XpcFailure => 1,
            BrokerError::InvalidReply => 2,
            BrokerError::NotAllowed => 3,
            BrokerError::InvalidRequest => 4,
            BrokerError::NotFound => 5,
            BrokerError::CreateFailure => 6,
            BrokerError::InternalError => 7,
            BrokerError::Unknown(code) => *code,
        }
    }

    /// Fixed human-readable message for this status.
    ///
    /// The strings match the broker's own table byte for byte.
    pub fn message(&self) -> &'static str {
        match BrokerError::from_code(self.code()) {
            BrokerError::XpcFailure => "Failed to communicate with the broker",
            BrokerError::InvalidReply => "Invalid reply from the broker",
            BrokerError::NotAllowed => "Operation not allowed",
            BrokerError::InvalidRequest => "Invalid request",
            BrokerError::NotFound => "Network name not found",
            BrokerError::CreateFailure => "Failed to create network",
            BrokerError::InternalError => "Internal error",
            BrokerError::Unknown(_) => UNKNOWN_STATUS_MESSAGE,
        }
    }

    /// Whether the code belongs to the known set.
    pub fn is_known(&self) -> bool {
        !matches!(BrokerError::from_code(self.code()), BrokerError::Unknown(_))
    }
}

impl PartialEq for BrokerError {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for BrokerError {}

impl Hash for BrokerError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.code().hash(state);
    }
}

impl From<u32> for BrokerError {
    fn from(code: u32) -> Self {
        BrokerError::from_code(code)
    }
}

impl From<BrokerError> for u32 {
    fn from(err: BrokerError) -> Self {
        err.code()
    }
}

/// Formats as `(code) message`, the way broker logs print a status.
pub struct StatusDisplay(pub BrokerError);

impl fmt::Display for StatusDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.0.code(), self.0.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn known_codes_round_trip() {
        for err in BrokerError::KNOWN {
            let decoded = BrokerError::from_code(err.code());
            assert_eq!(decoded.code(), err.code());
            assert_eq!(decoded.message(), err.message());
            assert!(decoded.is_known());
        }
    }

    #[test]
    fn known_codes_are_distinct() {
        let codes: HashSet<u32> = BrokerError::KNOWN.iter().map(BrokerError::code).collect();
        assert_eq!(codes.len(), BrokerError::KNOWN.len());
        assert!(!codes.contains(&SUCCESS));
    }

    #[test]
    fn not_found_matches_broker_message() {
        let err = BrokerError::from_code(BrokerError::NotFound.code());
        assert_eq!(err, BrokerError::NotFound);
        assert_ne!(err, BrokerError::InternalError);
        assert_eq!(err.to_string(), "Network name not found");
    }

    #[test]
    fn equality_is_by_code_across_constructions() {
        for a in BrokerError::KNOWN {
            for b in BrokerError::KNOWN {
                let lhs = BrokerError::from_code(a.code());
                let rhs = BrokerError::from_code(b.code());
                assert_eq!(lhs == rhs, a.code() == b.code());
            }
        }
        // A hand-built unknown carrying a known code is still that code.
        assert_eq!(BrokerError::Unknown(5), BrokerError::NotFound);
        assert_eq!(BrokerError::Unknown(5).message(), "Network name not found");
    }

    #[test]
    fn unknown_status_is_preserved() {
        let err = BrokerError::from_code(999);
        assert_eq!(err.code(), 999);
        assert_eq!(u32::from(err), 999);
        assert_eq!(err.message(), UNKNOWN_STATUS_MESSAGE);
        assert_eq!(err.to_string(), "(unknown status)");
        assert!(!err.is_known());
        for known in BrokerError::KNOWN {
            assert_ne!(err, known);
        }
    }

    #[test]
    fn success_code_is_not_a_known_error() {
        let err = BrokerError::from_code(SUCCESS);
        assert!(!err.is_known());
        assert_eq!(err.message(), UNKNOWN_STATUS_MESSAGE);
    }

    #[test]
    fn hash_follows_code() {
        let mut set = HashSet::new();
        set.insert(BrokerError::NotFound);
        assert!(set.contains(&BrokerError::Unknown(5)));
        assert!(!set.contains(&BrokerError::Unknown(500)));
    }

    #[test]
    fn status_display_includes_code() {
        let text = StatusDisplay(BrokerError::CreateFailure).to_string();
        assert_eq!(text, "(6) Failed to create network");
    }
}
