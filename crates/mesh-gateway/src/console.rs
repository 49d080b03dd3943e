//! Operator commands read line by line from stdin

use anyhow::{bail, Result};
use mesh_core::MessageKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Submit a payment: relayed directly in gateway mode, forwarded otherwise
    Pay { kind: MessageKind, payload: String },
    Announce,
    Status,
}

/// Parse one input line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match (word, rest) {
        ("btc_tx", payload) if !payload.is_empty() => ConsoleCommand::Pay {
            kind: MessageKind::BtcTx,
            payload: payload.to_string(),
        },
        ("cashu", payload) if !payload.is_empty() => ConsoleCommand::Pay {
            kind: MessageKind::Cashu,
            payload: payload.to_string(),
        },
        ("btc_tx" | "cashu", _) => bail!("{} needs a payload", word),
        ("announce", "") => ConsoleCommand::Announce,
        ("status", "") => ConsoleCommand::Status,
        _ => bail!("unknown command: {}", line),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payments() {
        assert_eq!(
            parse_line("btc_tx 0200aabb\n").unwrap(),
            Some(ConsoleCommand::Pay {
                kind: MessageKind::BtcTx,
                payload: "0200aabb".into()
            })
        );
        assert_eq!(
            parse_line("  cashu   cashuAeyJ0 ").unwrap(),
            Some(ConsoleCommand::Pay {
                kind: MessageKind::Cashu,
                payload: "cashuAeyJ0".into()
            })
        );
        assert!(parse_line("cashu").is_err());
    }

    #[test]
    fn test_parse_other_lines() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("status").unwrap(), Some(ConsoleCommand::Status));
        assert_eq!(parse_line("announce").unwrap(), Some(ConsoleCommand::Announce));
        assert!(parse_line("announce now").is_err());
        assert!(parse_line("send 1 hi").is_err());
    }
}
