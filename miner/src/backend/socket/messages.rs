use std::fmt;

use crate::error::{MinerError, Result};

/// Line sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Login { user: String, pass: String },
    Meta { key: String, value: String },
    /// Ask for another work unit
    More,
    /// Hex-encoded submission payload
    Result(String),
}

impl ClientMessage {
    pub fn login(user: &str, pass: &str) -> Self {
        Self::Login {
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }

    pub fn meta(key: &str, value: impl fmt::Display) -> Self {
        Self::Meta {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login { user, pass } => write!(f, "LOGIN {} {}", user, pass),
            Self::Meta { key, value } => write!(f, "META {} {}", key, value),
            Self::More => write!(f, "MORE"),
            Self::Result(hex) => write!(f, "RESULT {}", hex),
        }
    }
}

/// Line received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Msg(String),
    Target(Vec<u8>),
    /// Server wall clock, unix seconds
    Time(u64),
    Block(u64),
    Work { data: Vec<u8>, mask: u32 },
    Accepted(String),
    Rejected(String),
}

impl ServerMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let malformed = || MinerError::Protocol(format!("malformed {} line: {:?}", command, line));

        let message = match command {
            "MSG" => Self::Msg(rest.to_string()),
            "TARGET" => Self::Target(hex::decode(rest)?),
            "TIME" => Self::Time(rest.parse().map_err(|_| malformed())?),
            "BLOCK" => Self::Block(rest.parse().map_err(|_| malformed())?),
            "WORK" => {
                let mut parts = rest.split_whitespace();
                let data = hex::decode(parts.next().ok_or_else(malformed)?)?;
                let mask = parts
                    .next()
                    .ok_or_else(malformed)?
                    .parse()
                    .map_err(|_| malformed())?;
                Self::Work { data, mask }
            }
            "ACCEPTED" if !rest.is_empty() => Self::Accepted(rest.to_ascii_lowercase()),
            "REJECTED" if !rest.is_empty() => Self::Rejected(rest.to_ascii_lowercase()),
            _ => return Err(MinerError::Protocol(format!("unknown server line: {:?}", line))),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_lines() {
        assert_eq!(ClientMessage::login("u", "p").to_string(), "LOGIN u p");
        assert_eq!(ClientMessage::meta("rate", 1234.5).to_string(), "META rate 1234.5");
        assert_eq!(ClientMessage::More.to_string(), "MORE");
        assert_eq!(ClientMessage::Result("ab".into()).to_string(), "RESULT ab");
    }

    #[test]
    fn test_parse_server_lines() {
        assert_eq!(ServerMessage::parse("MSG hello there").unwrap(), ServerMessage::Msg("hello there".into()));
        assert_eq!(ServerMessage::parse("TARGET 00ff").unwrap(), ServerMessage::Target(vec![0, 0xff]));
        assert_eq!(ServerMessage::parse("TIME 1700000000\r").unwrap(), ServerMessage::Time(1_700_000_000));
        assert_eq!(ServerMessage::parse("BLOCK 42").unwrap(), ServerMessage::Block(42));
        assert_eq!(
            ServerMessage::parse("WORK 0102 30").unwrap(),
            ServerMessage::Work { data: vec![1, 2], mask: 30 }
        );
        assert_eq!(ServerMessage::parse("ACCEPTED ABCD").unwrap(), ServerMessage::Accepted("abcd".into()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServerMessage::parse("HELLO").is_err());
        assert!(ServerMessage::parse("WORK 0102").is_err());
        assert!(ServerMessage::parse("TIME soon").is_err());
        assert!(ServerMessage::parse("TARGET zz").is_err());
        assert!(ServerMessage::parse("ACCEPTED").is_err());
    }
}
