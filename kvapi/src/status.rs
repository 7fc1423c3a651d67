//! Wire-visible status codes.
//!
//! Success codes are non-negative, errors are negative; the numeric values
//! travel in protocol responses and across the ADO boundary.

use std::fmt;

/// Operation status. `Ok` and `OkCreated` are the only codes `is_ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    OkCreated,
    /// Incremental work remains (tasks, index scans).
    More,
    /// ADO-initiated request to erase the invocation target.
    EraseTarget,
    /// First user-defined success code; ADO plugins may return up to this.
    User0,
    Fail,
    Inval,
    KeyNotFound,
    Locked,
    TooLarge,
    InsufficientSpace,
    AlreadyExists,
    AlreadyOpen,
    NoIndex,
    Busy,
    BadParam,
    NotImpl,
    NotSupported,
    OutOfBounds,
    MaxReached,
    PoolError,
}

/// Lowest status value accepted from an ADO plugin before clamping.
pub const ERROR_BASE: i32 = -32;

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::OkCreated)
    }

    pub fn is_err(self) -> bool {
        self.to_i32() < 0
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::OkCreated => 1,
            Status::More => 2,
            Status::EraseTarget => 3,
            Status::User0 => 16,
            Status::Fail => -1,
            Status::Inval => -2,
            Status::KeyNotFound => -3,
            Status::Locked => -4,
            Status::TooLarge => -5,
            Status::InsufficientSpace => -6,
            Status::AlreadyExists => -7,
            Status::AlreadyOpen => -8,
            Status::NoIndex => -9,
            Status::Busy => -10,
            Status::BadParam => -11,
            Status::NotImpl => -12,
            Status::NotSupported => -13,
            Status::OutOfBounds => -14,
            Status::MaxReached => -15,
            Status::PoolError => -16,
        }
    }

    /// Decode a wire status; unknown values collapse to `Fail`.
    pub fn from_i32(v: i32) -> Status {
        match v {
            0 => Status::Ok,
            1 => Status::OkCreated,
            2 => Status::More,
            3 => Status::EraseTarget,
            16 => Status::User0,
            -1 => Status::Fail,
            -2 => Status::Inval,
            -3 => Status::KeyNotFound,
            -4 => Status::Locked,
            -5 => Status::TooLarge,
            -6 => Status::InsufficientSpace,
            -7 => Status::AlreadyExists,
            -8 => Status::AlreadyOpen,
            -9 => Status::NoIndex,
            -10 => Status::Busy,
            -11 => Status::BadParam,
            -12 => Status::NotImpl,
            -13 => Status::NotSupported,
            -14 => Status::OutOfBounds,
            -15 => Status::MaxReached,
            -16 => Status::PoolError,
            _ => Status::Fail,
        }
    }

    /// Clamp an ADO-reported status into the accepted window
    /// `[ERROR_BASE, User0]`; anything outside becomes `Fail`.
    pub fn clamp_ado(v: i32) -> Status {
        if v > Status::User0.to_i32() || v < ERROR_BASE {
            Status::Fail
        } else {
            Status::from_i32(v)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::OkCreated => write!(f, "ok (created)"),
            Status::More => write!(f, "more work remains"),
            Status::EraseTarget => write!(f, "erase target requested"),
            Status::User0 => write!(f, "user status"),
            Status::Fail => write!(f, "operation failed"),
            Status::Inval => write!(f, "invalid argument"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::Locked => write!(f, "entry is locked"),
            Status::TooLarge => write!(f, "value too large"),
            Status::InsufficientSpace => write!(f, "insufficient space"),
            Status::AlreadyExists => write!(f, "already exists"),
            Status::AlreadyOpen => write!(f, "pool already open"),
            Status::NoIndex => write!(f, "no index configured"),
            Status::Busy => write!(f, "resource busy"),
            Status::BadParam => write!(f, "bad parameter"),
            Status::NotImpl => write!(f, "not implemented"),
            Status::NotSupported => write!(f, "not supported"),
            Status::OutOfBounds => write!(f, "out of bounds"),
            Status::MaxReached => write!(f, "limit reached"),
            Status::PoolError => write!(f, "pool error"),
        }
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for s in [
            Status::Ok,
            Status::OkCreated,
            Status::More,
            Status::EraseTarget,
            Status::Fail,
            Status::Inval,
            Status::KeyNotFound,
            Status::Locked,
            Status::TooLarge,
            Status::InsufficientSpace,
            Status::AlreadyExists,
            Status::AlreadyOpen,
            Status::NoIndex,
            Status::Busy,
            Status::BadParam,
            Status::NotImpl,
            Status::NotSupported,
            Status::OutOfBounds,
            Status::MaxReached,
            Status::PoolError,
        ] {
            assert_eq!(Status::from_i32(s.to_i32()), s);
        }
    }

    #[test]
    fn test_unknown_collapses_to_fail() {
        assert_eq!(Status::from_i32(-999), Status::Fail);
        assert_eq!(Status::from_i32(77), Status::Fail);
    }

    #[test]
    fn test_ado_clamp() {
        assert_eq!(Status::clamp_ado(0), Status::Ok);
        assert_eq!(Status::clamp_ado(3), Status::EraseTarget);
        assert_eq!(Status::clamp_ado(17), Status::Fail);
        assert_eq!(Status::clamp_ado(-33), Status::Fail);
        assert_eq!(Status::clamp_ado(-7), Status::AlreadyExists);
    }
}
