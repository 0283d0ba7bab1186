//! Pipe-delimited wire messages exchanged with hosts and clients

use crate::crypto::{self, CryptoError, EnvelopeKeys};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const AUTH_PREFIX: &[u8] = b"AUTH|";
pub const MAX_HOST_ID_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    /// True when the datagram failed authentication rather than parsing.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ProtocolError::Crypto(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCommand {
    Register,
    Heartbeat,
}

impl HostCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostCommand::Register => "REGISTER",
            HostCommand::Heartbeat => "HEARTBEAT",
        }
    }
}

impl FromStr for HostCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTER" => Ok(HostCommand::Register),
            "HEARTBEAT" => Ok(HostCommand::Heartbeat),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How host registration datagrams are authenticated. One profile is used
/// for a whole deployment; the two are not interoperable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthProfile {
    /// `CMD|hostId|gamePort|maxPlayers|timestamp|hexHmac`
    #[default]
    Signed,
    /// `base64(iv || ciphertext)|base64(hmac)`
    Envelope,
}

impl FromStr for AuthProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signed" => Ok(AuthProfile::Signed),
            "envelope" => Ok(AuthProfile::Envelope),
            other => Err(format!("unknown auth profile {other:?} (expected signed or envelope)")),
        }
    }
}

impl fmt::Display for AuthProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthProfile::Signed => f.write_str("signed"),
            AuthProfile::Envelope => f.write_str("envelope"),
        }
    }
}

/// A decoded REGISTER or HEARTBEAT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub command: HostCommand,
    pub host_id: String,
    pub game_port: u16,
    pub max_players: u32,
    /// Unix seconds at which the host produced the message
    pub timestamp: i64,
}

impl Registration {
    /// The exact text covered by the signed-profile HMAC.
    pub fn signing_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.host_id, self.game_port, self.max_players, self.timestamp
        )
    }

    fn plaintext(&self) -> String {
        format!("{}|{}", self.command, self.signing_payload())
    }

    /// Parses `CMD|hostId|gamePort|maxPlayers|timestamp` fields.
    fn from_fields(fields: &[&str]) -> Result<Self, ProtocolError> {
        if fields.len() != 5 {
            return Err(ProtocolError::FieldCount {
                expected: 5,
                found: fields.len(),
            });
        }

        let command = fields[0].parse::<HostCommand>()?;
        let host_id = fields[1];
        if host_id.is_empty() || host_id.len() > MAX_HOST_ID_LEN {
            return Err(invalid("hostId", host_id));
        }

        let game_port: u16 = parse_field("gamePort", fields[2])?;
        if game_port == 0 {
            return Err(invalid("gamePort", fields[2]));
        }

        Ok(Registration {
            command,
            host_id: host_id.to_string(),
            game_port,
            max_players: parse_field("maxPlayers", fields[3])?,
            timestamp: parse_field("timestamp", fields[4])?,
        })
    }
}

fn invalid(field: &'static str, value: &str) -> ProtocolError {
    ProtocolError::InvalidField {
        field,
        value: value.chars().take(32).collect(),
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ProtocolError> {
    value.parse::<T>().map_err(|_| invalid(field, value))
}

/// Seals and opens registration datagrams for one deployment profile.
#[derive(Clone)]
pub enum HostAuthenticator {
    Signed { secret: Vec<u8> },
    Envelope { keys: EnvelopeKeys },
}

impl fmt::Debug for HostAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostAuthenticator({})", self.profile())
    }
}

impl HostAuthenticator {
    pub fn new(profile: AuthProfile, secret: &str) -> Self {
        match profile {
            AuthProfile::Signed => HostAuthenticator::Signed {
                secret: secret.as_bytes().to_vec(),
            },
            AuthProfile::Envelope => HostAuthenticator::Envelope {
                keys: EnvelopeKeys::derive(secret),
            },
        }
    }

    pub fn profile(&self) -> AuthProfile {
        match self {
            HostAuthenticator::Signed { .. } => AuthProfile::Signed,
            HostAuthenticator::Envelope { .. } => AuthProfile::Envelope,
        }
    }

    /// Produces the datagram text a host sends to the registry port.
    pub fn seal(&self, registration: &Registration) -> Result<String, CryptoError> {
        match self {
            HostAuthenticator::Signed { secret } => {
                let signature = crypto::sign_hex(&registration.signing_payload(), secret)?;
                Ok(format!("{}|{}", registration.plaintext(), signature))
            }
            HostAuthenticator::Envelope { keys } => {
                crypto::seal(registration.plaintext().as_bytes(), keys)
            }
        }
    }

    /// Authenticates and decodes a registration datagram.
    ///
    /// Signed profile: field shape is checked first so that transport
    /// corruption surfaces as a parse error, then the HMAC is verified over
    /// the raw field text. Envelope profile: the envelope is verified and
    /// decrypted before any field is looked at.
    pub fn open(&self, datagram: &[u8]) -> Result<Registration, ProtocolError> {
        let text = std::str::from_utf8(datagram).map_err(|_| ProtocolError::NotUtf8)?;
        let text = text.trim_end_matches(['\r', '\n']);

        match self {
            HostAuthenticator::Signed { secret } => {
                let fields: Vec<&str> = text.split('|').collect();
                if fields.len() != 6 {
                    return Err(ProtocolError::FieldCount {
                        expected: 6,
                        found: fields.len(),
                    });
                }
                let registration = Registration::from_fields(&fields[..5])?;
                let signed_text = fields[1..5].join("|");
                crypto::verify_hex(&signed_text, fields[5], secret)?;
                Ok(registration)
            }
            HostAuthenticator::Envelope { keys } => {
                let plaintext = crypto::open(text, keys)?;
                let plaintext =
                    String::from_utf8(plaintext).map_err(|_| ProtocolError::NotUtf8)?;
                let fields: Vec<&str> = plaintext.split('|').collect();
                Registration::from_fields(&fields)
            }
        }
    }
}

/// Classification of a datagram arriving on the client port.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientDatagram<'a> {
    /// `AUTH|<token>`; carries the token bytes
    Auth(&'a [u8]),
    /// Anything else, forwarded untouched
    Payload(&'a [u8]),
}

pub fn classify_client_datagram(data: &[u8]) -> ClientDatagram<'_> {
    match data.strip_prefix(AUTH_PREFIX) {
        Some(token) => ClientDatagram::Auth(token),
        None => ClientDatagram::Payload(data),
    }
}

pub fn auth_datagram(token: &str) -> Vec<u8> {
    let mut datagram = AUTH_PREFIX.to_vec();
    datagram.extend_from_slice(token.as_bytes());
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(command: HostCommand) -> Registration {
        Registration {
            command,
            host_id: "HostA".to_string(),
            game_port: 9000,
            max_players: 8,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_signed_datagram_layout() {
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let datagram = auth.seal(&registration(HostCommand::Register)).unwrap();
        let fields: Vec<&str> = datagram.split('|').collect();

        assert_eq!(fields.len(), 6);
        assert_eq!(&fields[..5], &["REGISTER", "HostA", "9000", "8", "1700000000"]);
        assert_eq!(
            fields[5],
            crypto::sign_hex("HostA|9000|8|1700000000", b"CHANGE_ME").unwrap()
        );
    }

    #[test]
    fn test_open_both_profiles() {
        for profile in [AuthProfile::Signed, AuthProfile::Envelope] {
            let auth = HostAuthenticator::new(profile, "CHANGE_ME");
            for command in [HostCommand::Register, HostCommand::Heartbeat] {
                let original = registration(command);
                let datagram = auth.seal(&original).unwrap();
                assert_eq!(auth.open(datagram.as_bytes()).unwrap(), original);
            }
        }
    }

    #[test]
    fn test_profiles_do_not_interoperate() {
        let signed = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let envelope = HostAuthenticator::new(AuthProfile::Envelope, "CHANGE_ME");
        let original = registration(HostCommand::Register);

        let signed_datagram = signed.seal(&original).unwrap();
        let envelope_datagram = envelope.seal(&original).unwrap();

        assert!(envelope.open(signed_datagram.as_bytes()).is_err());
        assert!(signed.open(envelope_datagram.as_bytes()).is_err());
    }

    #[test]
    fn test_signed_malformed_is_not_auth_failure() {
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");

        let cases: [&[u8]; 6] = [
            b"REGISTER|HostA|9000|8|1700000000",
            b"REGISTER|HostA|notaport|8|1700000000|abcd",
            b"REGISTER|HostA|9000|-1|1700000000|abcd",
            b"JOIN|HostA|9000|8|1700000000|abcd",
            b"REGISTER||9000|8|1700000000|abcd",
            &[0xff, 0xfe, b'|'],
        ];

        for case in cases {
            let err = auth.open(case).unwrap_err();
            assert!(!err.is_authentication_failure(), "{:?}", err);
        }
    }

    #[test]
    fn test_signed_tampered_field_is_auth_failure() {
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let datagram = auth.seal(&registration(HostCommand::Register)).unwrap();
        let tampered = datagram.replacen("|8|", "|9|", 1);

        let err = auth.open(tampered.as_bytes()).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_signed_command_swap_still_verifies() {
        // The command is outside the signed text, so REGISTER and HEARTBEAT
        // carry the same signature.
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let datagram = auth.seal(&registration(HostCommand::Heartbeat)).unwrap();
        let swapped = datagram.replacen("HEARTBEAT", "REGISTER", 1);

        assert_eq!(
            auth.open(swapped.as_bytes()).unwrap().command,
            HostCommand::Register
        );
    }

    #[test]
    fn test_envelope_garbage_is_auth_failure() {
        let auth = HostAuthenticator::new(AuthProfile::Envelope, "CHANGE_ME");
        let err = auth
            .open(b"REGISTER|HostA|9000|8|1700000000|abcd")
            .unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_host_id_length_limit() {
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let mut long = registration(HostCommand::Register);
        long.host_id = "x".repeat(MAX_HOST_ID_LEN + 1);
        let datagram = auth.seal(&long).unwrap();

        assert!(matches!(
            auth.open(datagram.as_bytes()),
            Err(ProtocolError::InvalidField { field: "hostId", .. })
        ));
    }

    #[test]
    fn test_zero_game_port_is_rejected() {
        for profile in [AuthProfile::Signed, AuthProfile::Envelope] {
            let auth = HostAuthenticator::new(profile, "CHANGE_ME");
            let mut zero = registration(HostCommand::Register);
            zero.game_port = 0;
            let datagram = auth.seal(&zero).unwrap();

            let err = auth.open(datagram.as_bytes()).unwrap_err();
            assert!(!err.is_authentication_failure());
            assert!(matches!(
                err,
                ProtocolError::InvalidField { field: "gamePort", .. }
            ));
        }
    }

    #[test]
    fn test_trailing_newline_is_tolerated() {
        let auth = HostAuthenticator::new(AuthProfile::Signed, "CHANGE_ME");
        let datagram = auth.seal(&registration(HostCommand::Register)).unwrap() + "\n";
        assert!(auth.open(datagram.as_bytes()).is_ok());
    }

    #[test]
    fn test_classify_client_datagram() {
        assert_eq!(
            classify_client_datagram(b"AUTH|MY_SECRET_TOKEN"),
            ClientDatagram::Auth(b"MY_SECRET_TOKEN")
        );
        assert_eq!(classify_client_datagram(b"AUTH|"), ClientDatagram::Auth(b""));
        assert_eq!(
            classify_client_datagram(b"AUTH"),
            ClientDatagram::Payload(b"AUTH")
        );
        assert_eq!(
            classify_client_datagram(&[1, 2, 3]),
            ClientDatagram::Payload(&[1, 2, 3])
        );
        assert_eq!(auth_datagram("tok"), b"AUTH|tok".to_vec());
    }

    #[test]
    fn test_auth_profile_parsing() {
        assert_eq!("signed".parse::<AuthProfile>(), Ok(AuthProfile::Signed));
        assert_eq!("Envelope".parse::<AuthProfile>(), Ok(AuthProfile::Envelope));
        assert!("aes".parse::<AuthProfile>().is_err());
        assert_eq!(AuthProfile::Envelope.to_string(), "envelope");
    }
}
