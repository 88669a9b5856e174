// SPDX-License-Identifier: GPL-2.0
// Copyright 2022-2023 Google LLC
// Author: Ard Biesheuvel <ardb@google.com>

use core::fmt;

/// A EFI status code. Error codes have the top bit of the native word set, warnings do not.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Status(pub usize);

const ERROR_BIT: usize = 1 << (usize::BITS - 1);

const fn error(code: usize) -> Status {
    Status(ERROR_BIT | code)
}

#[allow(dead_code)]
impl Status {
    pub const EFI_SUCCESS: Status = Status(0);

    pub const EFI_LOAD_ERROR: Status = error(1);
    pub const EFI_INVALID_PARAMETER: Status = error(2);
    pub const EFI_UNSUPPORTED: Status = error(3);
    pub const EFI_BAD_BUFFER_SIZE: Status = error(4);
    pub const EFI_BUFFER_TOO_SMALL: Status = error(5);
    pub const EFI_NOT_READY: Status = error(6);
    pub const EFI_DEVICE_ERROR: Status = error(7);
    pub const EFI_WRITE_PROTECTED: Status = error(8);
    pub const EFI_OUT_OF_RESOURCES: Status = error(9);
    pub const EFI_VOLUME_CORRUPTED: Status = error(10);
    pub const EFI_VOLUME_FULL: Status = error(11);
    pub const EFI_NO_MEDIA: Status = error(12);
    pub const EFI_MEDIA_CHANGED: Status = error(13);
    pub const EFI_NOT_FOUND: Status = error(14);
    pub const EFI_ACCESS_DENIED: Status = error(15);
    pub const EFI_NO_RESPONSE: Status = error(16);
    pub const EFI_NO_MAPPING: Status = error(17);
    pub const EFI_TIMEOUT: Status = error(18);
    pub const EFI_NOT_STARTED: Status = error(19);
    pub const EFI_ALREADY_STARTED: Status = error(20);
    pub const EFI_ABORTED: Status = error(21);
    pub const EFI_ICMP_ERROR: Status = error(22);
    pub const EFI_TFTP_ERROR: Status = error(23);
    pub const EFI_PROTOCOL_ERROR: Status = error(24);
    pub const EFI_INCOMPATIBLE_VERSION: Status = error(25);
    pub const EFI_SECURITY_VIOLATION: Status = error(26);
    pub const EFI_CRC_ERROR: Status = error(27);

    pub const EFI_WARN_UNKNOWN_GLYPH: Status = Status(1);
    pub const EFI_WARN_DELETE_FAILURE: Status = Status(2);
    pub const EFI_WARN_WRITE_FAILURE: Status = Status(3);
    pub const EFI_WARN_BUFFER_TOO_SMALL: Status = Status(4);

    pub const fn is_error(&self) -> bool {
        self.0 & ERROR_BIT != 0
    }

    /// Converts the status into a `Result`, treating warnings as success.
    pub fn ok(self) -> Result<(), Status> {
        if self.is_error() {
            Err(self)
        } else {
            Ok(())
        }
    }

    /// Encodes the status as a guest native word of `width` bytes, moving the error bit to the
    /// top of the narrower word if needed.
    pub fn to_guest(self, width: usize) -> u64 {
        let code = (self.0 & !ERROR_BIT) as u64;
        if self.is_error() {
            code | 1 << (width * 8 - 1)
        } else {
            code
        }
    }

    /// Decodes a status returned by guest code in a native word of `width` bytes.
    pub fn from_guest(value: u64, width: usize) -> Status {
        let top = 1u64 << (width * 8 - 1);
        let code = (value & (top - 1)) as usize;
        if value & top != 0 {
            error(code)
        } else {
            Status(code)
        }
    }
}

impl From<Result<(), Status>> for Status {
    fn from(r: Result<(), Status>) -> Self {
        match r {
            Ok(()) => Status::EFI_SUCCESS,
            Err(s) => s,
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Status::EFI_SUCCESS => "EFI_SUCCESS",
            Status::EFI_LOAD_ERROR => "EFI_LOAD_ERROR",
            Status::EFI_INVALID_PARAMETER => "EFI_INVALID_PARAMETER",
            Status::EFI_UNSUPPORTED => "EFI_UNSUPPORTED",
            Status::EFI_BAD_BUFFER_SIZE => "EFI_BAD_BUFFER_SIZE",
            Status::EFI_BUFFER_TOO_SMALL => "EFI_BUFFER_TOO_SMALL",
            Status::EFI_NOT_READY => "EFI_NOT_READY",
            Status::EFI_DEVICE_ERROR => "EFI_DEVICE_ERROR",
            Status::EFI_WRITE_PROTECTED => "EFI_WRITE_PROTECTED",
            Status::EFI_OUT_OF_RESOURCES => "EFI_OUT_OF_RESOURCES",
            Status::EFI_VOLUME_CORRUPTED => "EFI_VOLUME_CORRUPTED",
            Status::EFI_VOLUME_FULL => "EFI_VOLUME_FULL",
            Status::EFI_NOT_FOUND => "EFI_NOT_FOUND",
            Status::EFI_ACCESS_DENIED => "EFI_ACCESS_DENIED",
            Status::EFI_ABORTED => "EFI_ABORTED",
            Status::EFI_SECURITY_VIOLATION => "EFI_SECURITY_VIOLATION",
            Status::EFI_CRC_ERROR => "EFI_CRC_ERROR",
            _ => {
                return write!(
                    f,
                    "Status({}{:#x})",
                    if self.is_error() { "error " } else { "" },
                    self.0 & !ERROR_BIT
                );
            }
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_encoding_moves_error_bit() {
        let s = Status::EFI_NOT_FOUND;
        assert_eq!(s.to_guest(4), 0x8000_000e);
        assert_eq!(s.to_guest(8), 0x8000_0000_0000_000e);
        assert_eq!(Status::from_guest(0x8000_000e, 4), s);
        assert_eq!(Status::from_guest(0x8000_0000_0000_000e, 8), s);
        assert_eq!(Status::from_guest(0, 8), Status::EFI_SUCCESS);
    }

    #[test]
    fn warnings_are_not_errors() {
        assert!(Status::EFI_WARN_BUFFER_TOO_SMALL.ok().is_ok());
        assert_eq!(Status::EFI_ABORTED.ok(), Err(Status::EFI_ABORTED));
    }
}
