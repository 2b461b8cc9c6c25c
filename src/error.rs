use core::fmt;

/// Errors returned by the wire codecs.
///
/// Decoders are total: malformed input must produce one of these, never a
/// panic.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// A length field disagrees with the amount of data that is actually
    /// present.
    InvalidLength,

    /// Invalid value supplied for a field (bad version, unknown PCP, zero
    /// PSM, ...).
    InvalidValue,

    /// Unexpectedly reached the end of the buffer while reading or writing.
    Eof,

    /// Input that is not valid UTF-8 where a string was required.
    InvalidUtf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::InvalidUtf8 => "invalid utf-8 in string field",
        })
    }
}

impl std::error::Error for Error {}
