// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    checksum::Checksum,
};

/// Represents errors that can occur during topology enumeration
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Malformed input histogram
    MalformedHistogram(&'static str),

    /// Unusable configuration value
    InvalidConfig(&'static str),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum computed over the payload
        got: Checksum,

        /// Checksum stored in the payload trailer
        expected: Checksum,
    },

    /// A save archive is missing a required entry
    MissingArchiveEntry(&'static str),

    /// A save archive entry could not be parsed
    MalformedArchiveEntry(&'static str),

    /// A save archive's leaf name encoding does not match the input histograms
    LeafEncodingMismatch,

    /// The spill FIFO's rollover exchange with its spooler broke down
    SpoolerUnavailable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TopolenumError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Enumeration result
pub type Result<T> = std::result::Result<T, Error>;
