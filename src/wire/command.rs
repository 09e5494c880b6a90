use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};

use anyhow::bail;
use rustc_hash::FxHashMap;

/// A [CommandCode] is sent as part of every message header to identify the handler on the
///  receiving side. It is a single byte on the wire.
///
/// Human-readable names live in a separate [CommandNames] table that is populated once at
///  startup.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct CommandCode(pub u8);

impl CommandCode {
    pub const INVALID: CommandCode = CommandCode(0);

    /// Control response telling a peer that its protocol version is not supported any more
    pub const BAD_VERSION: CommandCode = CommandCode(0xff);
}

impl Debug for CommandCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Length of a command name in the previous protocol generation, which sent commands as
///  NUL-padded ASCII strings instead of a single byte
pub const LEGACY_COMMAND_LEN: usize = 8;

/// Maps command codes to names and back. Names are at most eight ASCII characters so that they
///  double as the legacy string representation of a command.
#[derive(Default, Clone)]
pub struct CommandNames {
    by_code: FxHashMap<CommandCode, String>,
    by_name: FxHashMap<String, CommandCode>,
}

impl Debug for CommandNames {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandNames{{{} entries}}", self.by_code.len())
    }
}

impl CommandNames {
    pub fn new() -> CommandNames {
        let mut result = CommandNames::default();
        result.by_code.insert(CommandCode::BAD_VERSION, "RspBdVer".to_string());
        result.by_name.insert("RspBdVer".to_string(), CommandCode::BAD_VERSION);
        result
    }

    pub fn register(&mut self, code: CommandCode, name: &str) -> anyhow::Result<()> {
        if name.is_empty() || name.len() > LEGACY_COMMAND_LEN || !name.is_ascii() || name.contains('\0') {
            bail!("invalid command name {:?}: must be 1 to {} ASCII characters", name, LEGACY_COMMAND_LEN);
        }
        if let Some(other) = self.by_name.get(name) {
            if *other != code {
                bail!("command name {:?} is already used for {:?}", name, other);
            }
        }

        match self.by_code.entry(code) {
            Entry::Occupied(e) => {
                if e.get() != name {
                    bail!("command {:?} is already registered as {:?}", code, e.get());
                }
            }
            Entry::Vacant(e) => {
                e.insert(name.to_string());
                self.by_name.insert(name.to_string(), code);
            }
        }
        Ok(())
    }

    pub fn name(&self, code: CommandCode) -> Option<&str> {
        self.by_code.get(&code)
            .map(|s| s.as_str())
    }

    pub fn code(&self, name: &str) -> Option<CommandCode> {
        self.by_name.get(name).copied()
    }

    /// name for logging, falling back to the numeric code for unregistered commands
    pub fn describe(&self, code: CommandCode) -> String {
        match self.name(code) {
            Some(name) => name.to_string(),
            None => format!("{:?}", code),
        }
    }

    pub fn resolve_legacy(&self, raw: &[u8; LEGACY_COMMAND_LEN]) -> Option<CommandCode> {
        let used = raw.iter()
            .position(|&b| b == 0)
            .map(|len| &raw[..len])
            .unwrap_or(raw);

        let name = std::str::from_utf8(used).ok()?;
        self.code(name)
    }

    pub fn legacy_bytes(&self, code: CommandCode) -> Option<[u8; LEGACY_COMMAND_LEN]> {
        let name = self.name(code)?;
        let mut result = [0u8; LEGACY_COMMAND_LEN];
        result[..name.len()].copy_from_slice(name.as_bytes());
        Some(result)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
