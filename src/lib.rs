#![doc = include_str!(concat!(env!("OUT_DIR"), "/README-rustdocified.md"))]
#![deny(missing_docs)]

use std::fmt;

pub use crate::{
    plan::{
        fft_size, mem_required, safety_margin, supported_fft_sizes, Circular, FmaMode, Options,
        PostAction, VecOptions, Window,
    },
    polymult::{HelpersGuard, PolyIn, Polymult, SeveralArg},
    preprocess::{PreOptions, PreprocessedPoly},
};

#[cfg(test)]
mod test_util;

mod lines;
mod plan;
mod polymult;
mod pool;
mod preprocess;
mod twiddles;

pub mod algorithm {
    #![doc = include_str!("algorithm.md")]
}
pub mod engine;

mod kernels;

// ======================================================================
// Error - PUBLIC

/// Represents all possible errors that can occur in this library.
///
/// Every error is detected while planning or allocating; the kernels are
/// pure compute and cannot fail, so partial results are never written.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Error {
    /// Given coefficient has a different transform length than the
    /// engine's `element_doubles`.
    DifferentElementSize {
        /// The engine's doubles per coefficient.
        element_doubles: usize,
        /// Length of the given coefficient.
        got: usize,
    },

    /// A size argument is zero or inconsistent with the other arguments.
    InvalidSize {
        /// Which size was invalid.
        what: &'static str,
        /// The given value.
        got: usize,
    },

    /// Scratch or twiddle allocation failed. The handle stays usable.
    OutOfMemory {
        /// Bytes that could not be reserved.
        bytes: usize,
    },

    /// A preprocessed poly was given to a call whose sizes or options
    /// differ from the ones recorded at preprocessing time.
    PreprocessedMismatch {
        /// Which recorded parameter differs.
        what: &'static str,
        /// The recorded value.
        expected: usize,
        /// The value of this call.
        got: usize,
    },

    /// Illegal option combination for this entry point.
    UnsupportedOptions {
        /// What was wrong.
        detail: &'static str,
    },
}

// ======================================================================
// Error - IMPL DISPLAY

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DifferentElementSize {
                element_doubles,
                got,
            } => {
                write!(
                    f,
                    "different element size: engine has {} doubles, coefficient has {}",
                    element_doubles, got
                )
            }

            Error::InvalidSize { what, got } => {
                write!(f, "invalid {}: {}", what, got)
            }

            Error::OutOfMemory { bytes } => {
                write!(f, "out of memory: could not reserve {} bytes", bytes)
            }

            Error::PreprocessedMismatch {
                what,
                expected,
                got,
            } => {
                write!(
                    f,
                    "preprocessed poly mismatch: {} was {} at preprocessing time, got {}",
                    what, expected, got
                )
            }

            Error::UnsupportedOptions { detail } => {
                write!(f, "unsupported options: {}", detail)
            }
        }
    }
}

// ======================================================================
// Error - IMPL ERROR

impl std::error::Error for Error {}

// ======================================================================
// TESTS
