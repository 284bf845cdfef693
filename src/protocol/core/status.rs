use core::fmt;

use crate::error::ProtocolError;

/// Outcome carried by a frame.
///
/// For calls and replies this tells success from failure. For stream frames
/// it also drives the stream state machine: `Continue` carries data, `Ok`
/// finishes the stream and `Error` aborts it.
#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub enum Status {
    #[default]
    Ok = 0,
    Error = 1,
    Continue = 2,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Continue => "CONTINUE",
        }
    }
}

impl TryFrom<u32> for Status {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Continue),
            v => Err(ProtocolError::UnknownStatus(v)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
