//! TLS alert messages
//!
//! Alerts travel in their own record content type as two bytes
//! (`level | description`). The engine only ever sends fatal alerts, except for
//! `close_notify` which ends a connection cleanly.

use std::fmt;

/// Alert level byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl AlertLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }
}

/// TLS alert description codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    HandshakeFailure = 40,
    BadCertificate = 42,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InternalError = 80,
    UserCanceled = 90,
    NoRenegotiation = 100,
    CertificateRequired = 116,
    UnrecognizedName = 112,
    NoApplicationProtocol = 120,
}

impl AlertDescription {
    pub fn from_u8(v: u8) -> Option<Self> {
        use AlertDescription::*;
        Some(match v {
            0 => CloseNotify,
            10 => UnexpectedMessage,
            20 => BadRecordMac,
            22 => RecordOverflow,
            40 => HandshakeFailure,
            42 => BadCertificate,
            45 => CertificateExpired,
            46 => CertificateUnknown,
            47 => IllegalParameter,
            48 => UnknownCa,
            50 => DecodeError,
            51 => DecryptError,
            70 => ProtocolVersion,
            80 => InternalError,
            90 => UserCanceled,
            100 => NoRenegotiation,
            112 => UnrecognizedName,
            116 => CertificateRequired,
            120 => NoApplicationProtocol,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Lower-case name as it appears in RFC 8446
    pub fn as_str(&self) -> &'static str {
        use AlertDescription::*;
        match self {
            CloseNotify => "close_notify",
            UnexpectedMessage => "unexpected_message",
            BadRecordMac => "bad_record_mac",
            RecordOverflow => "record_overflow",
            HandshakeFailure => "handshake_failure",
            BadCertificate => "bad_certificate",
            CertificateExpired => "certificate_expired",
            CertificateUnknown => "certificate_unknown",
            IllegalParameter => "illegal_parameter",
            UnknownCa => "unknown_ca",
            DecodeError => "decode_error",
            DecryptError => "decrypt_error",
            ProtocolVersion => "protocol_version",
            InternalError => "internal_error",
            UserCanceled => "user_canceled",
            NoRenegotiation => "no_renegotiation",
            UnrecognizedName => "unrecognized_name",
            CertificateRequired => "certificate_required",
            NoApplicationProtocol => "no_application_protocol",
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.to_u8())
    }
}

/// A decoded alert record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Alert { level: AlertLevel::Fatal, description }
    }

    pub fn close_notify() -> Self {
        Alert { level: AlertLevel::Warning, description: AlertDescription::CloseNotify }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.level as u8, self.description.to_u8()]
    }

    /// Decode an alert payload. Returns None for anything that isn't exactly
    /// two known bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 2 {
            return None;
        }
        Some(Alert {
            level: AlertLevel::from_u8(data[0])?,
            description: AlertDescription::from_u8(data[1])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_encoding() {
        let alert = Alert::fatal(AlertDescription::BadRecordMac);
        assert_eq!(alert.encode(), [2, 20]);
        assert_eq!(Alert::decode(&[2, 20]), Some(alert));
        assert_eq!(Alert::decode(&[1, 0]), Some(Alert::close_notify()));
    }

    #[test]
    fn test_malformed_alerts() {
        assert_eq!(Alert::decode(&[2]), None);
        assert_eq!(Alert::decode(&[2, 20, 0]), None);
        assert_eq!(Alert::decode(&[3, 20]), None);
        assert_eq!(Alert::decode(&[2, 255]), None);
    }

    #[test]
    fn test_alert_display() {
        assert_eq!(
            AlertDescription::NoApplicationProtocol.to_string(),
            "no_application_protocol (120)"
        );
    }
}
