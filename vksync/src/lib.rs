//! Synchronization-dependency test orchestration for Vulkan-like devices.
//!
//! The crate builds chains and graphs of GPU operations (write → read, or write → copy → read)
//! across queues and semaphore types, assigns the wait and signal values that encode the
//! expected ordering, submits the work (including wait-before-signal orderings where consumers
//! are handed to the device before their producers) and verifies the data that comes out the
//! other end.
//!
//! The device itself is opaque: everything goes through the [`Provider`] trait, which is
//! implemented by a real Vulkan binding or by a software device such as `vksync-soft`.
//!
//! # Structure
//!
//! - [`resource`] describes buffers and images and turns those descriptions into live objects.
//! - [`operation`] is the catalog of read, write and copy operations that can be recorded
//!   against resources.
//! - [`sync`] presents one submit and barrier contract over the legacy and the
//!   `synchronization2` protocols, and over binary and timeline semaphores.
//! - [`graph`] builds linear chains, fan-outs and randomized submission combinatorics.
//! - [`schedule`] decides the order in which the built work is handed to queues and runs the
//!   test families.
//! - [`verify`] compares what was written with what was read.
//! - [`cases`] enumerates the named test cases and runs them.
//!
//! [`Provider`]: provider::Provider

use ash::vk;
use std::{error::Error, fmt};

pub use self::verify::Mismatch;

pub mod cases;
pub mod config;
pub mod context;
pub mod graph;
pub mod operation;
pub mod provider;
pub mod resource;
pub mod schedule;
pub mod sync;
pub mod verify;

/// Error that can happen while building, submitting or verifying a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestError {
    /// A capability the test needs is missing from the device. This is the only error that is
    /// recovered from: the case is reported as skipped.
    NotSupported(SkipReason),

    /// An invariant of the test harness itself was violated, for example a wait value without
    /// a matching signal. This indicates a bug in the harness, not in the device.
    Harness(String),

    /// The device broke a rule of the API that doesn't involve resource data, for example a
    /// timeline counter that went backwards or an event wait that didn't block.
    Conformance(String),

    /// The data that was read back doesn't match the data that was written.
    Mismatch(Mismatch),

    /// The provider returned an error from a call that was expected to succeed.
    Provider {
        call: &'static str,
        result: vk::Result,
    },
}

impl TestError {
    /// Creates a [`TestError::Harness`] error.
    #[inline]
    pub fn harness(message: impl Into<String>) -> Self {
        TestError::Harness(message.into())
    }

    /// Creates a [`TestError::Conformance`] error.
    #[inline]
    pub fn conformance(message: impl Into<String>) -> Self {
        TestError::Conformance(message.into())
    }

    /// Creates a [`TestError::NotSupported`] error.
    #[inline]
    pub fn not_supported(message: impl Into<String>) -> Self {
        TestError::NotSupported(SkipReason::new(message))
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported(reason) => write!(f, "not supported: {reason}"),
            Self::Harness(message) => write!(f, "harness invariant violated: {message}"),
            Self::Conformance(message) => write!(f, "the device doesn't conform: {message}"),
            Self::Mismatch(_) => f.write_str("the data read back doesn't match the data written"),
            Self::Provider { call, result } => write!(f, "`{call}` failed with {result}"),
        }
    }
}

impl Error for TestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Mismatch(mismatch) => Some(mismatch),
            Self::Provider { result, .. } => Some(result),
            Self::NotSupported(_) | Self::Harness(_) | Self::Conformance(_) => None,
        }
    }
}

impl From<SkipReason> for TestError {
    #[inline]
    fn from(reason: SkipReason) -> Self {
        Self::NotSupported(reason)
    }
}

impl From<Mismatch> for TestError {
    #[inline]
    fn from(mismatch: Mismatch) -> Self {
        Self::Mismatch(mismatch)
    }
}

/// The reason a test can't run on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkipReason {
    message: String,
}

impl SkipReason {
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        SkipReason {
            message: message.into(),
        }
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The outcome of one test case, as reported to the result sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail(String),
    NotSupported(String),
}

impl TestStatus {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, TestStatus::Pass)
    }

    #[inline]
    pub fn is_fail(&self) -> bool {
        matches!(self, TestStatus::Fail(_))
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("Pass"),
            Self::Fail(message) => write!(f, "Fail ({message})"),
            Self::NotSupported(message) => write!(f, "NotSupported ({message})"),
        }
    }
}

impl From<Result> for TestStatus {
    fn from(result: Result) -> Self {
        match result {
            Ok(()) => TestStatus::Pass,
            Err(TestError::NotSupported(reason)) => TestStatus::NotSupported(reason.message),
            Err(TestError::Mismatch(mismatch)) => TestStatus::Fail(mismatch.to_string()),
            Err(err) => TestStatus::Fail(err.to_string()),
        }
    }
}

/// Attaches the name of the provider call to a raw result code.
pub(crate) trait ProviderResultExt<T> {
    fn checked(self, call: &'static str) -> Result<T>;
}

impl<T> ProviderResultExt<T> for ash::prelude::VkResult<T> {
    #[inline]
    fn checked(self, call: &'static str) -> Result<T> {
        self.map_err(|result| TestError::Provider { call, result })
    }
}

type Result<T = (), E = TestError> = ::std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(TestStatus::from(Ok(())), TestStatus::Pass);
        assert_eq!(
            TestStatus::from(Err(TestError::not_supported("no geometry shaders"))),
            TestStatus::NotSupported("no geometry shaders".to_owned()),
        );

        let conformance = TestStatus::from(Err(TestError::conformance("the counter went back")));
        let harness = TestStatus::from(Err(TestError::harness("no signal for a wait")));

        assert!(conformance.is_fail());
        assert!(harness.is_fail());
        assert_ne!(conformance, harness);
        assert!(!conformance.to_string().contains("harness"));
    }
}
