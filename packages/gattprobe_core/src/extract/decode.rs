//! Decoding of captured ATT writes against the known command table

use serde::Serialize;

use super::labels::TrafficLabel;
use crate::ble::gatt::Opcode;

/// One ATT Write Command row as reported by the capture tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttWrite {
    pub frame: String,
    pub time: String,
    pub opcode: String,
    pub method: String,
    pub handle: String,
    pub value: String,
    /// Absolute capture time, when the tool reported one.
    pub epoch: Option<f64>,
}

/// Split tool output into rows, skipping blank lines and rows with fewer
/// than six fields. A seventh field is read as the epoch time.
pub fn parse_rows(output: &str, separator: char) -> Vec<AttWrite> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line
                .split(separator)
                .map(|f| f.trim().trim_matches('"'))
                .collect();
            if fields.len() < 6 {
                log::debug!("Skipping short capture row: {:?}", line);
                return None;
            }
            Some(AttWrite {
                frame: fields[0].to_string(),
                time: fields[1].to_string(),
                opcode: fields[2].to_string(),
                method: fields[3].to_string(),
                handle: fields[4].to_string(),
                value: fields[5].to_string(),
                epoch: fields.get(6).and_then(|f| f.parse().ok()),
            })
        })
        .collect()
}

/// Command-specific fields pulled out of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandDetail {
    Mode { mode: String },
    Brightness { brightness: u8 },
    Timer { timer_minutes: u8 },
    Pin { pin_ascii: String, pin_hex: String },
    Plain {},
}

/// A captured write that matched the known command table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedCommand {
    pub frame: String,
    pub time: String,
    pub handle: String,
    pub command: &'static str,
    pub cmd_byte: String,
    pub hex: String,
    pub bytes: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<TrafficLabel>,
    #[serde(flatten)]
    pub detail: CommandDetail,
}

impl DecodedCommand {
    pub fn opcode(&self) -> Option<Opcode> {
        self.bytes.first().copied().and_then(Opcode::from_byte)
    }
}

/// Decode a tool-formatted value (`01:02:00:00` or `01020000`).
///
/// Returns `None` for empty or malformed values and for unknown opcodes.
pub fn decode_value(value: &str) -> Option<(Opcode, Vec<u8>, CommandDetail)> {
    let clean: String = value.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
    if clean.len() < 2 {
        return None;
    }
    let bytes = hex::decode(&clean).ok()?;
    let opcode = Opcode::from_byte(bytes[0])?;

    let detail = match opcode {
        Opcode::AuthRequest if bytes.len() >= 6 => {
            let pin = &bytes[1..];
            CommandDetail::Pin {
                pin_ascii: pin
                    .iter()
                    .filter(|b| (32..=126).contains(*b))
                    .map(|&b| b as char)
                    .collect(),
                pin_hex: hex::encode_upper(pin),
            }
        }
        Opcode::SetBrightness if bytes.len() > 1 => CommandDetail::Brightness {
            brightness: bytes[1],
        },
        Opcode::SetMode if bytes.len() > 1 => CommandDetail::Mode {
            mode: match bytes[1] {
                0 => "ECO".to_string(),
                1 => "TURBO".to_string(),
                other => format!("UNKNOWN({})", other),
            },
        },
        Opcode::SetTimer if bytes.len() > 1 => CommandDetail::Timer {
            timer_minutes: bytes[1],
        },
        _ => CommandDetail::Plain {},
    };
    Some((opcode, bytes, detail))
}

/// Decode every row whose value matches a known command.
pub fn decode_rows(rows: &[AttWrite]) -> Vec<DecodedCommand> {
    rows.iter()
        .filter_map(|row| {
            let (opcode, bytes, detail) = decode_value(&row.value)?;
            Some(DecodedCommand {
                frame: row.frame.clone(),
                time: row.time.clone(),
                handle: row.handle.clone(),
                command: opcode.name(),
                cmd_byte: format!("0x{:02X}", opcode.byte()),
                hex: row.value.clone(),
                bytes,
                epoch: row.epoch,
                label: None,
                detail,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

/// A weakness evidenced by the captured commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub id: &'static str,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

/// Derive findings from decoded commands.
///
/// Unauthenticated writes, cleartext PINs and denial-of-service commands
/// (brightness zero or reset) each produce findings.
pub fn assess(commands: &[DecodedCommand]) -> Vec<Finding> {
    let mut findings = Vec::new();

    let writes: Vec<String> = commands
        .iter()
        .filter(|c| c.opcode() != Some(Opcode::AuthRequest))
        .map(|c| c.command.to_string())
        .collect();
    if !writes.is_empty() {
        findings.push(Finding {
            id: "VULN-01",
            severity: Severity::High,
            title: "GATT commands accepted without authentication".to_string(),
            description: format!("{} write commands without prior authentication", writes.len()),
            commands: writes,
        });
    }

    for command in commands {
        if let CommandDetail::Pin { pin_ascii, pin_hex } = &command.detail {
            if !pin_ascii.is_empty() {
                findings.push(Finding {
                    id: "VULN-02",
                    severity: Severity::Critical,
                    title: "PIN transmitted in cleartext".to_string(),
                    description: format!(
                        "PIN {} (hex {}) in frame {}",
                        pin_ascii, pin_hex, command.frame
                    ),
                    commands: Vec::new(),
                });
            }
        }
    }

    let dos: Vec<String> = commands
        .iter()
        .filter(|c| {
            matches!(c.detail, CommandDetail::Brightness { brightness: 0 })
                || c.opcode() == Some(Opcode::Reset)
        })
        .map(|c| c.command.to_string())
        .collect();
    if !dos.is_empty() {
        findings.push(Finding {
            id: "VULN-03",
            severity: Severity::Medium,
            title: "Denial-of-service vectors".to_string(),
            description: format!("{} potentially disruptive commands", dos.len()),
            commands: dos,
        });
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPE_OUTPUT: &str = "\
12|1.204511|0x52|0x12|0x002a|03:00:00:00
15|2.510002|0x52|0x12|0x002a|01:01:00:00
18|3.000100|0x52|0x12|0x002a|10:31:32:33:34:35:36
21|3.500000|0x52|0x12
24|4.100000|0x52|0x12|0x002a|ff:00:00:00

30|5.000000|0x52|0x12|0x002a|05
";

    #[test]
    fn test_parse_rows_skips_short_rows() {
        let rows = parse_rows(PIPE_OUTPUT, '|');
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].frame, "12");
        assert_eq!(rows[0].handle, "0x002a");
        assert_eq!(rows[0].value, "03:00:00:00");
    }

    #[test]
    fn test_parse_csv_rows() {
        let rows = parse_rows("7,0.5,0x52,0x12,0x002a,\"04:0a:00:00\"\n", ',');
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "04:0a:00:00");
    }

    #[test]
    fn test_decode_known_commands() {
        let commands = decode_rows(&parse_rows(PIPE_OUTPUT, '|'));
        let names: Vec<&str> = commands.iter().map(|c| c.command).collect();
        assert_eq!(names, vec!["SET_BRIGHTNESS", "SET_MODE", "AUTH_REQUEST", "RESET"]);

        assert_eq!(commands[0].detail, CommandDetail::Brightness { brightness: 0 });
        assert_eq!(commands[1].detail, CommandDetail::Mode { mode: "TURBO".into() });
        assert_eq!(
            commands[2].detail,
            CommandDetail::Pin {
                pin_ascii: "123456".into(),
                pin_hex: "313233343536".into()
            }
        );
        assert_eq!(commands[3].cmd_byte, "0x05");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_value("").is_none());
        assert!(decode_value("0").is_none());
        assert!(decode_value("zz:00").is_none());
        assert!(decode_value("ff:00:00:00").is_none());
        let (op, _, detail) = decode_value("04 1e 00 00").unwrap();
        assert_eq!(op, Opcode::SetTimer);
        assert_eq!(detail, CommandDetail::Timer { timer_minutes: 30 });
    }

    #[test]
    fn test_findings() {
        let commands = decode_rows(&parse_rows(PIPE_OUTPUT, '|'));
        let findings = assess(&commands);
        let ids: Vec<&str> = findings.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["VULN-01", "VULN-02", "VULN-03"]);
        assert_eq!(findings[0].commands.len(), 3);
        assert_eq!(findings[2].commands, vec!["SET_BRIGHTNESS", "RESET"]);
    }

    #[test]
    fn test_no_findings_for_empty_capture() {
        assert!(assess(&[]).is_empty());
    }
}
