//! The list of USB (VID, PID) pairs that identify EVB1000 boards.
//!
//! It is read once at startup from a small text file:
//!
//! ```text
//! CONFIG_VID_PID
//! VID PID
//! 0403 6001
//! 10c4 ea60
//! ```
//!
//! Anything wrong with the file is fatal, there is no sensible fallback.

use nom::{
    bytes::complete::take_while_m_n,
    character::complete::{space0, space1},
    combinator::{all_consuming, map_res},
    sequence::{separated_pair, terminated},
    Finish, IResult,
};

use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

const MAGIC: &str = "CONFIG_VID_PID";

/// A USB vendor id and product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VidPid {
    /// Vendor id
    pub vid: u16,
    /// Product id
    pub pid: u16,
}

impl VidPid {
    /// Does this pair identify the given device?
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

impl fmt::Display for VidPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Why the allow-list could not be loaded.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file does not exist
    NotFound(PathBuf),
    /// The configuration file could not be read
    Io(io::Error),
    /// The first line is not `CONFIG_VID_PID`
    MissingMagic,
    /// The second line is not `VID PID`
    BadHeader,
    /// An entry is not two 4-character hex fields
    BadEntry {
        /// 1-based line number
        line: usize,
        /// The offending line
        text: String,
    },
    /// The file has no entries
    Empty,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ConfigError as CE;
        let msg = match self {
            CE::NotFound(path) => {
                Cow::from(format!("configuration file {} not found", path.display()))
            }
            CE::Io(error) => Cow::from(format!("io error: {}", error)),
            CE::MissingMagic => Cow::from(format!("malformed configuration, expected {}", MAGIC)),
            CE::BadHeader => Cow::from("malformed configuration, expected a `VID PID` header"),
            CE::BadEntry { line, text } => Cow::from(format!(
                "malformed (VID, PID) entry on line {}: {:?}",
                line, text
            )),
            CE::Empty => Cow::from("no (VID, PID) entries found"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// An ordered, non-empty list of [`VidPid`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList(Vec<VidPid>);

impl AllowList {
    /// Fails with [`ConfigError::Empty`] if `pairs` is empty.
    pub fn new(pairs: Vec<VidPid>) -> Result<Self, ConfigError> {
        if pairs.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(Self(pairs))
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(path.to_owned()),
            _ => ConfigError::Io(e),
        })?;
        text.parse()
    }

    /// Is the device with this vid and pid allowed?
    pub fn contains(&self, vid: u16, pid: u16) -> bool {
        self.0.iter().any(|p| p.matches(vid, pid))
    }

    /// The pairs, in file order.
    pub fn iter(&self) -> impl Iterator<Item = &VidPid> {
        self.0.iter()
    }

    /// Number of pairs, never zero.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false, an [`AllowList`] can't be built empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn hex4(s: &str) -> IResult<&str, u16> {
    map_res(
        take_while_m_n(4, 4, |c: char| c.is_ascii_hexdigit()),
        |h| u16::from_str_radix(h, 16),
    )(s)
}

fn parse_entry(s: &str) -> IResult<&str, VidPid> {
    let (rest, (vid, pid)) = terminated(separated_pair(hex4, space1, hex4), space0)(s)?;
    Ok((rest, VidPid { vid, pid }))
}

impl FromStr for AllowList {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // blank lines carry nothing, skip them but keep line numbers right
        let mut lines = s
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end()))
            .filter(|(_, l)| !l.is_empty());

        match lines.next() {
            Some((_, l)) if l.split(' ').next() == Some(MAGIC) => {}
            _ => return Err(ConfigError::MissingMagic),
        }

        match lines.next() {
            Some((_, l)) if l.split_whitespace().take(2).eq(["VID", "PID"]) => {}
            _ => return Err(ConfigError::BadHeader),
        }

        let pairs = lines
            .map(|(line, text)| {
                all_consuming(parse_entry)(text)
                    .finish()
                    .map(|(_, pair)| pair)
                    .map_err(|_: nom::error::Error<&str>| ConfigError::BadEntry {
                        line,
                        text: text.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(pairs)
    }
}
