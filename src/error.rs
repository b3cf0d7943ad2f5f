use thiserror::Error;

/// All failure kinds a DFU operation can produce, each mapped to the exit
/// code the command-line tools report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    NoInput(String),

    /// Malformed suffix, CRC mismatch, bad prefix, unparsable memory layout,
    /// or a DfuSe signature mismatch.
    #[error("{0}")]
    Data(String),

    #[error("USB transaction error while {action}")]
    Usb {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("file I/O error")]
    File(#[from] std::io::Error),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Protocol(String),

    /// More than one matching device, or an unsupported DFU version
    /// combination.
    #[error("{0}")]
    Compatibility(String),

    #[error("internal error: {0}")]
    Software(String),
}

impl Error {
    /// Exit code reported by the command-line tools for this error kind.
    pub fn exit_code(&self) -> i32 {
        use Error::*;
        match self {
            Usage(_) => 2,
            Compatibility(_) => 3,
            Data(_) => 65,
            NoInput(_) => 66,
            Software(_) => 70,
            Usb { .. } | File(_) | Io(_) => 74,
            Protocol(_) => 76,
        }
    }

    pub(crate) fn usb(source: rusb::Error, action: &'static str) -> Self {
        Error::Usb { source, action }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(Error::Usage("x".into()).exit_code(), 2);
        assert_eq!(Error::Compatibility("x".into()).exit_code(), 3);
        assert_eq!(Error::Data("x".into()).exit_code(), 65);
        assert_eq!(Error::NoInput("x".into()).exit_code(), 66);
        assert_eq!(Error::Software("x".into()).exit_code(), 70);
        assert_eq!(Error::Io("x".into()).exit_code(), 74);
        assert_eq!(Error::Protocol("x".into()).exit_code(), 76);
    }
}
