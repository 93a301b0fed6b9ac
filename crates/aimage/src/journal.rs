//! Append-only journal backing the disk store index
//!
//! Layout: a five line header (magic, format version, app version, value
//! count, blank) followed by one record per line:
//!
//! ```text
//! DIRTY <key>
//! CLEAN <key> <len> [<len> ...]
//! REMOVE <key>
//! READ <key>
//! ```
//!
//! Replaying the records in order rebuilds the index and its access order.

use std::fmt;
use std::io::{self, BufRead, Write};

pub(crate) const MAGIC: &str = "aimage.disk.journal";
pub(crate) const FORMAT_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub app_version: u32,
    pub value_count: usize,
}

impl Header {
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(
            out,
            "{}\n{}\n{}\n{}\n\n",
            MAGIC, FORMAT_VERSION, self.app_version, self.value_count
        )
    }

    /// Read and validate the header, failing on any mismatch with `expected`
    pub fn read_from<R: BufRead>(lines: &mut io::Lines<R>, expected: Header) -> io::Result<()> {
        let mut next = || -> io::Result<String> {
            lines
                .next()
                .unwrap_or_else(|| Err(corrupt("truncated journal header")))
        };

        let magic = next()?;
        let format = next()?;
        let app_version = next()?;
        let value_count = next()?;
        let blank = next()?;

        if magic != MAGIC
            || format != FORMAT_VERSION
            || app_version != expected.app_version.to_string()
            || value_count != expected.value_count.to_string()
            || !blank.is_empty()
        {
            return Err(corrupt(format!(
                "unexpected journal header: [{}, {}, {}, {}, {}]",
                magic, format, app_version, value_count, blank
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Dirty(String),
    Clean(String, Vec<u64>),
    Remove(String),
    Read(String),
}

impl Record {
    pub fn parse(line: &str, value_count: usize) -> io::Result<Self> {
        let mut parts = line.split(' ');
        let op = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| corrupt(format!("journal line without key: {}", line)))?
            .to_string();
        let rest: Vec<&str> = parts.collect();

        match (op, rest.len()) {
            ("DIRTY", 0) => Ok(Record::Dirty(key)),
            ("REMOVE", 0) => Ok(Record::Remove(key)),
            ("READ", 0) => Ok(Record::Read(key)),
            ("CLEAN", n) if n == value_count => {
                let lengths = rest
                    .iter()
                    .map(|len| len.parse::<u64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| corrupt(format!("bad lengths in journal line: {}", line)))?;
                Ok(Record::Clean(key, lengths))
            }
            _ => Err(corrupt(format!("unexpected journal line: {}", line))),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Dirty(key) => write!(f, "DIRTY {}", key),
            Record::Remove(key) => write!(f, "REMOVE {}", key),
            Record::Read(key) => write!(f, "READ {}", key),
            Record::Clean(key, lengths) => {
                write!(f, "CLEAN {}", key)?;
                for len in lengths {
                    write!(f, " {}", len)?;
                }
                Ok(())
            }
        }
    }
}

pub(crate) fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
