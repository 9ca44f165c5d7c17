//! Wire codec for the emulator bridge.
//!
//! Newline-delimited ASCII lines with pipe-separated fields:
//!
//! ```text
//! CMD|<id>|<verb>|<arg>...     client -> script command
//! ACK|<id>                     script -> client, command accepted
//! NACK|<id>|<reason>           script -> client, command rejected
//! PING|<ts>                    script -> client liveness probe
//! PONG|<ts>                    client -> script liveness answer
//! HELLO                        script (re)initialized, ready for commands
//! CMD|<verb>|...               script -> client telemetry event
//! ```
//!
//! Argument fields must not contain `|` or line breaks; [`encode_command`]
//! replaces them with spaces.

/// A decoded line from the embedded script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLine {
    /// Command `id` was accepted.
    Ack {
        /// Id of the acknowledged command.
        id: u64,
    },
    /// Command `id` was rejected.
    Nack {
        /// Id of the rejected command.
        id: u64,
        /// Peer-supplied reason.
        reason: String,
    },
    /// Liveness probe; must be answered with `PONG` carrying the same stamp.
    Ping {
        /// Opaque timestamp echoed back in the answer.
        ts: String,
    },
    /// The script (re)initialized and accepts commands from scratch.
    Hello,
    /// Telemetry event line, forwarded verbatim.
    Event {
        /// The full raw line.
        raw: String,
    },
}

/// Parse one line from the peer. Returns `None` for unrecognized input.
#[must_use]
pub fn parse_line(line: &str) -> Option<PeerLine> {
    let line = line.trim_end_matches('\r');
    let (head, rest) = match line.split_once('|') {
        Some((head, rest)) => (head, Some(rest)),
        None => (line, None),
    };

    match head {
        "ACK" => {
            let id = rest?.parse().ok()?;
            Some(PeerLine::Ack { id })
        }
        "NACK" => {
            let (id, reason) = match rest?.split_once('|') {
                Some((id, reason)) => (id, reason.to_string()),
                None => (rest?, String::new()),
            };
            Some(PeerLine::Nack {
                id: id.parse().ok()?,
                reason,
            })
        }
        "PING" => Some(PeerLine::Ping {
            ts: rest.unwrap_or("").to_string(),
        }),
        "HELLO" => Some(PeerLine::Hello),
        "CMD" => Some(PeerLine::Event {
            raw: line.to_string(),
        }),
        _ => None,
    }
}

/// Encode an outbound command line (without the trailing newline).
#[must_use]
pub fn encode_command(id: u64, verb: &str, args: &[&str]) -> String {
    let mut line = format!("CMD|{id}|{verb}");
    for arg in args {
        line.push('|');
        line.push_str(&clean_field(arg));
    }
    line
}

/// Encode the answer to a `PING` (without the trailing newline).
#[must_use]
pub fn encode_pong(ts: &str) -> String {
    format!("PONG|{}", clean_field(ts))
}

/// Fields carry no framing characters; separators become spaces.
fn clean_field(field: &str) -> String {
    if field.contains(['|', '\n', '\r']) {
        field.replace(['|', '\n', '\r'], " ")
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_line("ACK|17"), Some(PeerLine::Ack { id: 17 }));
    }

    #[test]
    fn test_parse_nack_with_reason() {
        assert_eq!(
            parse_line("NACK|4|rom not loaded"),
            Some(PeerLine::Nack {
                id: 4,
                reason: "rom not loaded".to_string()
            })
        );
    }

    #[test]
    fn test_parse_nack_reason_keeps_extra_pipes() {
        assert_eq!(
            parse_line("NACK|4|bad state|details"),
            Some(PeerLine::Nack {
                id: 4,
                reason: "bad state|details".to_string()
            })
        );
    }

    #[test]
    fn test_parse_nack_without_reason() {
        assert_eq!(
            parse_line("NACK|9"),
            Some(PeerLine::Nack {
                id: 9,
                reason: String::new()
            })
        );
    }

    #[test]
    fn test_parse_ping_and_hello() {
        assert_eq!(
            parse_line("PING|1718000000"),
            Some(PeerLine::Ping {
                ts: "1718000000".to_string()
            })
        );
        assert_eq!(parse_line("HELLO"), Some(PeerLine::Hello));
    }

    #[test]
    fn test_parse_event_passthrough() {
        assert_eq!(
            parse_line("CMD|message|level up"),
            Some(PeerLine::Event {
                raw: "CMD|message|level up".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("WHAT|1"), None);
        assert_eq!(parse_line("ACK|not-a-number"), None);
    }

    #[test]
    fn test_parse_tolerates_carriage_return() {
        assert_eq!(parse_line("ACK|3\r"), Some(PeerLine::Ack { id: 3 }));
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(7, "swap", &["zelda.zip", "p1-1"]),
            "CMD|7|swap|zelda.zip|p1-1"
        );
        assert_eq!(encode_command(1, "pause", &[]), "CMD|1|pause");
    }

    #[test]
    fn test_encode_sanitizes_separators() {
        assert_eq!(
            encode_command(2, "message", &["hi|there\nall"]),
            "CMD|2|message|hi there all"
        );
    }

    #[test]
    fn test_encode_pong() {
        assert_eq!(encode_pong("1718000000"), "PONG|1718000000");
    }
}
