//! Server reply codes.
//!
//! A reply code is either transient (the session carries on and the user
//! sees a warning) or fatal (the connection cannot continue). Codes with a
//! session-level meaning also carry the [`ErrorKind`] they surface as.

use serde::Serialize;

use crate::error::ErrorKind;

/// How the session reacts to a reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Report and continue
    Transient,
    /// Tear the connection down
    Fatal,
}

/// Entry in the reply code table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerError {
    /// Numeric code
    pub code: u16,
    /// Description shown to the user
    pub description: &'static str,
    /// Transient or fatal
    pub severity: Severity,
    /// Session-level kind, when the code has one
    pub kind: Option<ErrorKind>,
}

const fn transient(code: u16, description: &'static str) -> ServerError {
    ServerError {
        code,
        description,
        severity: Severity::Transient,
        kind: None,
    }
}

const fn fatal(code: u16, description: &'static str, kind: ErrorKind) -> ServerError {
    ServerError {
        code,
        description,
        severity: Severity::Fatal,
        kind: Some(kind),
    }
}

static TABLE: &[ServerError] = &[
    transient(200, "syntax error"),
    transient(201, "invalid parameter"),
    transient(205, "invalid user"),
    transient(206, "domain name missing"),
    transient(207, "already logged in"),
    transient(208, "invalid username"),
    transient(209, "invalid friendly name"),
    transient(210, "list full"),
    transient(215, "already there"),
    transient(216, "not on list"),
    transient(217, "user not online"),
    transient(218, "already in the mode"),
    transient(219, "already in opposite list"),
    transient(280, "switchboard failed"),
    transient(281, "notify transfer failed"),
    transient(300, "required fields missing"),
    transient(302, "not logged in"),
    fatal(500, "internal server error", ErrorKind::ServerUnavailable),
    fatal(501, "database server error", ErrorKind::ServerUnavailable),
    transient(510, "file operation error"),
    transient(520, "memory allocation error"),
    fatal(540, "wrong challenge response", ErrorKind::ProtocolViolation),
    ServerError {
        code: 600,
        description: "server is busy",
        severity: Severity::Transient,
        kind: Some(ErrorKind::ServerBusy),
    },
    fatal(601, "server is unavailable", ErrorKind::ServerUnavailable),
    fatal(602, "peer notification server down", ErrorKind::ServerUnavailable),
    fatal(603, "database connect error", ErrorKind::ServerUnavailable),
    fatal(604, "server is going down", ErrorKind::ServerUnavailable),
    fatal(707, "could not create connection", ErrorKind::ServerUnavailable),
    fatal(710, "invalid client version parameters", ErrorKind::UnsupportedVersion),
    transient(711, "write is blocking"),
    ServerError {
        code: 712,
        description: "session is overloaded",
        severity: Severity::Transient,
        kind: Some(ErrorKind::ServerBusy),
    },
    ServerError {
        code: 713,
        description: "user is too active",
        severity: Severity::Transient,
        kind: Some(ErrorKind::ServerBusy),
    },
    fatal(714, "too many sessions", ErrorKind::ServerUnavailable),
    transient(715, "command not expected"),
    transient(717, "bad friend file"),
    fatal(911, "authentication failed", ErrorKind::BadCredentials),
    transient(913, "not allowed when offline"),
    fatal(920, "not accepting new users", ErrorKind::ServerUnavailable),
    fatal(924, "account not verified", ErrorKind::BadCredentials),
];

impl ServerError {
    /// Find a code in the table.
    pub fn lookup(code: u16) -> Option<&'static ServerError> {
        TABLE.iter().find(|e| e.code == code)
    }

    /// Description for any code, known or not.
    pub fn describe(code: u16) -> String {
        match Self::lookup(code) {
            Some(entry) => entry.description.to_string(),
            None => format!("unknown error code {code}"),
        }
    }

    /// Severity of any code; unknown codes are treated as transient.
    pub fn severity_of(code: u16) -> Severity {
        Self::lookup(code)
            .map(|e| e.severity)
            .unwrap_or(Severity::Transient)
    }

    /// Whether `code` is in the table.
    pub fn is_known(code: u16) -> bool {
        Self::lookup(code).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let entry = ServerError::lookup(911).unwrap();
        assert_eq!(entry.severity, Severity::Fatal);
        assert_eq!(entry.kind, Some(ErrorKind::BadCredentials));

        let busy = ServerError::lookup(600).unwrap();
        assert_eq!(busy.severity, Severity::Transient);
        assert_eq!(busy.kind, Some(ErrorKind::ServerBusy));
    }

    #[test]
    fn test_unknown_code() {
        assert!(ServerError::lookup(999).is_none());
        assert_eq!(ServerError::describe(999), "unknown error code 999");
        assert_eq!(ServerError::severity_of(999), Severity::Transient);
    }

    #[test]
    fn test_table_is_sorted_and_unique() {
        for pair in TABLE.windows(2) {
            assert!(pair[0].code < pair[1].code, "{} out of order", pair[1].code);
        }
    }

    #[test]
    fn test_severity_agrees_with_kind() {
        for entry in TABLE {
            if let Some(kind) = entry.kind {
                let transient = entry.severity == Severity::Transient;
                assert_eq!(transient, kind.is_transient(), "code {}", entry.code);
            }
        }
        assert_eq!(
            ServerError::lookup(714).and_then(|e| e.kind),
            Some(ErrorKind::ServerUnavailable)
        );
    }
}
