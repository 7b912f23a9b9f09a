//! Error taxonomy shared by the allocators and the containers built on them.
//!
//! Every violation is an explicit [`MemoryError`] value so callers and tests
//! can match on the precise failure. Failing public operations hand their
//! error to [`report_violation`], which logs it and, when the
//! `abort-on-violation` feature is enabled, escalates to [`report`] and
//! terminates the process.

use core::fmt;

use cfg_if::cfg_if;
use snafu::{GenerateImplicitData, Snafu};

use crate::AllocatorKind;

/// Source location captured implicitly when a [`MemoryError`] is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A violated allocator or container invariant.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MemoryError {
    /// An arena cursor or a fixed-capacity container would pass its bound.
    #[snafu(display(
        "capacity exceeded: {requested} more requested with {used} of {capacity} in use"
    ))]
    CapacityExceeded {
        requested: usize,
        used: usize,
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// An index at or beyond the current length.
    #[snafu(display("index {index} out of bounds for length {len}"))]
    OutOfBounds {
        index: usize,
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The heap still holds live bytes at shutdown.
    #[snafu(display(
        "unreleased memory at shutdown: {allocated} of {total} bytes still allocated in {live} blocks"
    ))]
    UnreleasedMemory {
        allocated: usize,
        total: usize,
        live: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The heap pool has no free block large enough for the request.
    #[snafu(display(
        "heap pool exhausted: cannot satisfy {requested} bytes ({allocated} of {limit} bytes allocated)"
    ))]
    ExhaustedPool {
        requested: usize,
        allocated: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {align} is not a power of two"))]
    InvalidAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region size {size} outside of supported range {min}..={max}"))]
    InvalidRegionSize {
        size: usize,
        min: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("system allocator could not provide a region of {size} bytes"))]
    RegionAcquisition {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {address:#x} is not a live allocation of this heap"))]
    ForeignPointer {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{operation} is not supported by the {kind} allocator"))]
    Unsupported {
        operation: &'static str,
        kind: AllocatorKind,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot cut {amount} bytes from an arena cursor at {used}"))]
    CutUnderflow {
        amount: usize,
        used: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("growth factor {factor} would not increase capacity"))]
    InvalidGrowth {
        factor: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} elements of {element_size} bytes overflow the address space"))]
    SizeOverflow {
        count: usize,
        element_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid range {start}..{end}"))]
    InvalidRange {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{what} is not initialized"))]
    NotInitialized {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{what} is already initialized"))]
    AlreadyInitialized {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap pool is corrupt: {reason}"))]
    CorruptPool {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

impl MemoryError {
    /// Where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::CapacityExceeded { location, .. }
            | Self::OutOfBounds { location, .. }
            | Self::UnreleasedMemory { location, .. }
            | Self::ExhaustedPool { location, .. }
            | Self::InvalidAlignment { location, .. }
            | Self::InvalidRegionSize { location, .. }
            | Self::RegionAcquisition { location, .. }
            | Self::ForeignPointer { location, .. }
            | Self::Unsupported { location, .. }
            | Self::CutUnderflow { location, .. }
            | Self::InvalidGrowth { location, .. }
            | Self::SizeOverflow { location, .. }
            | Self::InvalidRange { location, .. }
            | Self::NotInitialized { location, .. }
            | Self::AlreadyInitialized { location, .. }
            | Self::CorruptPool { location, .. } => *location,
        }
    }
}

/// Human readable rendering of a [`MemoryError`] with its origin.
pub struct Report<'a> {
    error: &'a MemoryError,
}

impl<'a> Report<'a> {
    #[must_use]
    pub fn new(error: &'a MemoryError) -> Self {
        Self { error }
    }
}

impl fmt::Debug for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        write!(f, "  at {}", self.error.location())
    }
}

/// Reports `err` and panics.
///
/// With `panic = "abort"` this terminates the process.
#[track_caller]
pub fn report(err: &MemoryError) -> ! {
    panic!("Critical memory violation\n\n{}", Report::new(err));
}

/// Logs a violation returned from a public operation.
///
/// With the `abort-on-violation` feature the violation is escalated to
/// [`report`].
#[track_caller]
pub fn report_violation(err: &MemoryError) {
    tracing::error!(location = %err.location(), "{err}");
    escalate(err);
}

cfg_if! {
    if #[cfg(feature = "abort-on-violation")] {
        #[track_caller]
        fn escalate(err: &MemoryError) {
            report(err);
        }
    } else {
        fn escalate(_err: &MemoryError) {}
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use snafu::ensure;

    use super::*;

    fn check_len(index: usize, len: usize) -> Result<(), MemoryError> {
        ensure!(index < len, OutOfBoundsSnafu { index, len });
        Ok(())
    }

    #[test]
    fn test_location_points_at_raise_site() {
        let err = check_len(3, 3).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfBounds { index: 3, len: 3, .. }));
        let location = err.location().to_string();
        assert!(location.contains("error.rs"), "{location}");
    }

    #[test]
    fn test_report_contains_message_and_location() {
        let err = check_len(7, 2).unwrap_err();
        let rendered = Report::new(&err).to_string();
        assert!(rendered.starts_with("Error: index 7 out of bounds for length 2\n"));
        assert!(rendered.contains("  at "));
    }

    #[test]
    #[should_panic(expected = "Critical memory violation")]
    fn test_report_panics() {
        let err = check_len(1, 0).unwrap_err();
        report(&err);
    }

    #[cfg(not(feature = "abort-on-violation"))]
    #[test]
    fn test_report_violation_only_logs() {
        let err = check_len(1, 0).unwrap_err();
        report_violation(&err);
    }
}
