//! Result codes and last-error slots
//!
//! Each environment and each runtime carries its own slot. Fallible
//! operations route their result through [`ErrorSlot::record`], which keeps
//! the most recent failure together with the engine source location that
//! reported it.

use std::fmt;
use std::panic::Location;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{Error, Result};

/// Closed set of outcome categories, stable across the C ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    ParseError = 1,
    LinkError = 2,
    TrapError = 3,
    ArgMismatch = 4,
    NotFound = 5,
    InvalidState = 6,
}

impl ResultCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        use ResultCode::*;
        Some(match code {
            0 => Ok,
            1 => ParseError,
            2 => LinkError,
            3 => TrapError,
            4 => ArgMismatch,
            5 => NotFound,
            6 => InvalidState,
            _ => return None,
        })
    }

    /// Static description, NUL terminated for the C ABI
    pub fn message(&self) -> &'static str {
        match self {
            ResultCode::Ok => "ok\0",
            ResultCode::ParseError => "parse error\0",
            ResultCode::LinkError => "link error\0",
            ResultCode::TrapError => "trap\0",
            ResultCode::ArgMismatch => "argument type mismatch\0",
            ResultCode::NotFound => "not found\0",
            ResultCode::InvalidState => "invalid state\0",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().trim_end_matches('\0'))
    }
}

/// Details of the most recent failure in a context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub code: ResultCode,
    pub message: String,
    /// Engine source location that reported the failure; diagnostic only
    pub file: &'static str,
    pub line: u32,
}

impl ErrorInfo {
    #[track_caller]
    pub fn capture(err: &Error) -> Self {
        let location = Location::caller();
        ErrorInfo {
            code: err.code(),
            message: err.to_string(),
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.message, self.file, self.line)
    }
}

#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Mutex<Option<ErrorInfo>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ErrorInfo> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, info: ErrorInfo) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Store the error of a failed result and pass the result through
    #[track_caller]
    pub fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.set(ErrorInfo::capture(err));
        }
        result
    }
}
