use crate::error::ProtocolError;

/// Response status written after the packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Closed = 1,
    RunModeChanged = 2,
    Error = 3,
}

impl TryFrom<i32> for Status {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Closed),
            2 => Ok(Status::RunModeChanged),
            3 => Ok(Status::Error),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}
