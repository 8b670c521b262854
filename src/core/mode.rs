// Open-mode flag set: combination, validation, and textual form.
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::core::error::{Error, ErrorKind};

/// Combinable set of open flags. `CREATE` and `TRUNCATE` require `WRITER`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct OpenMode(u32);

impl OpenMode {
    pub const READER: OpenMode = OpenMode(1 << 0);
    pub const WRITER: OpenMode = OpenMode(1 << 1);
    pub const CREATE: OpenMode = OpenMode(1 << 2);
    pub const TRUNCATE: OpenMode = OpenMode(1 << 3);
    pub const AUTO_TRANSACTION: OpenMode = OpenMode(1 << 4);
    pub const AUTO_SYNC: OpenMode = OpenMode(1 << 5);
    pub const NO_LOCK: OpenMode = OpenMode(1 << 6);
    pub const TRY_LOCK: OpenMode = OpenMode(1 << 7);
    pub const NO_REPAIR: OpenMode = OpenMode(1 << 8);

    const NAMES: [(&'static str, OpenMode); 9] = [
        ("reader", OpenMode::READER),
        ("writer", OpenMode::WRITER),
        ("create", OpenMode::CREATE),
        ("truncate", OpenMode::TRUNCATE),
        ("autotran", OpenMode::AUTO_TRANSACTION),
        ("autosync", OpenMode::AUTO_SYNC),
        ("nolock", OpenMode::NO_LOCK),
        ("trylock", OpenMode::TRY_LOCK),
        ("norepair", OpenMode::NO_REPAIR),
    ];

    pub const fn empty() -> Self {
        OpenMode(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_writer(self) -> bool {
        self.contains(OpenMode::WRITER)
    }

    /// Rejects combinations that cannot be honored together.
    pub fn validate(self) -> Result<(), Error> {
        let invalid = |message: &str| Err(Error::new(ErrorKind::InvalidMode).with_message(message));
        if !self.contains(OpenMode::READER) && !self.contains(OpenMode::WRITER) {
            return invalid("mode must include reader or writer");
        }
        if self.contains(OpenMode::READER) && self.contains(OpenMode::WRITER) {
            return invalid("reader and writer are mutually exclusive");
        }
        if self.contains(OpenMode::CREATE) && !self.is_writer() {
            return invalid("create requires writer");
        }
        if self.contains(OpenMode::TRUNCATE) && !self.is_writer() {
            return invalid("truncate requires writer");
        }
        if (self.contains(OpenMode::AUTO_TRANSACTION) || self.contains(OpenMode::AUTO_SYNC))
            && !self.is_writer()
        {
            return invalid("autotran and autosync require writer");
        }
        if self.contains(OpenMode::NO_LOCK) && self.contains(OpenMode::TRY_LOCK) {
            return invalid("nolock and trylock are mutually exclusive");
        }
        Ok(())
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, flag) in OpenMode::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut mode = OpenMode::empty();
        for part in input.split('|').map(str::trim) {
            let flag = OpenMode::NAMES
                .iter()
                .find(|(name, _)| part.eq_ignore_ascii_case(name))
                .map(|(_, flag)| *flag)
                .ok_or_else(|| {
                    Error::new(ErrorKind::InvalidMode)
                        .with_message(format!("unknown open flag: {part:?}"))
                        .with_hint("Use names like reader, writer, create joined by '|'.")
                })?;
            mode |= flag;
        }
        Ok(mode)
    }
}

impl Serialize for OpenMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::OpenMode;
    use crate::core::error::ErrorKind;

    #[test]
    fn create_without_writer_is_invalid() {
        let err = (OpenMode::READER | OpenMode::CREATE)
            .validate()
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
        let err = OpenMode::CREATE.validate().expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
    }

    #[test]
    fn common_modes_validate() {
        OpenMode::READER.validate().expect("reader");
        (OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRY_LOCK)
            .validate()
            .expect("writer create");
        (OpenMode::WRITER | OpenMode::AUTO_SYNC | OpenMode::NO_REPAIR)
            .validate()
            .expect("autosync");
    }

    #[test]
    fn conflicting_lock_flags_are_invalid() {
        let err = (OpenMode::READER | OpenMode::NO_LOCK | OpenMode::TRY_LOCK)
            .validate()
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
    }

    #[test]
    fn text_form_parses_and_prints() {
        let mode: OpenMode = "Writer | create|trylock".parse().expect("parse");
        assert_eq!(mode, OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRY_LOCK);
        assert_eq!(mode.to_string(), "writer|create|trylock");

        let err = "writer|bogus".parse::<OpenMode>().expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
    }

    #[test]
    fn serializes_as_string() {
        let value = serde_json::to_value(OpenMode::READER | OpenMode::NO_LOCK).expect("json");
        assert_eq!(value, serde_json::json!("reader|nolock"));
    }
}
