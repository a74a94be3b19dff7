// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::DecodeError;
use std::io::{Read, Write};

pub const MAGIC_BYTES: [u8; 3] = [b'T', b'P', b'E'];

/// Serialized payload format version
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FormatVersion {
    /// Version for 0.x.x releases
    V0,
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<FormatVersion> for u8 {
    fn from(value: FormatVersion) -> Self {
        match value {
            FormatVersion::V0 => 0,
        }
    }
}

impl TryFrom<u8> for FormatVersion {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::V0),
            _ => Err(()),
        }
    }
}

pub fn write_header<W: Write>(writer: &mut W, version: FormatVersion) -> std::io::Result<()> {
    writer.write_all(&MAGIC_BYTES)?;
    writer.write_all(&[u8::from(version)])
}

pub fn read_header<R: Read>(reader: &mut R) -> Result<FormatVersion, DecodeError> {
    let mut header = [0; 4];
    reader.read_exact(&mut header)?;

    if header[0..3] != MAGIC_BYTES {
        return Err(DecodeError::InvalidHeader("no magic bytes"));
    }

    header[3]
        .try_into()
        .map_err(|()| DecodeError::InvalidTag(("FormatVersion", header[3])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_version_roundtrip() {
        let mut buf = vec![];
        write_header(&mut buf, FormatVersion::V0).expect("should write");

        let mut reader = &buf[..];
        assert_eq!(
            FormatVersion::V0,
            read_header(&mut reader).expect("should read"),
        );
    }

    #[test]
    fn format_version_bad_magic() {
        let buf = [b'X', b'Y', b'Z', 0];
        let mut reader = &buf[..];
        assert!(read_header(&mut reader).is_err());
    }

    #[test]
    fn format_version_unknown() {
        let buf = [b'T', b'P', b'E', 250];
        let mut reader = &buf[..];
        assert!(read_header(&mut reader).is_err());
    }
}
