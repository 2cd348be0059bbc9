//! Command-stream construction and submission for GPU kernel drivers.
//!
//! This crate sits between an API-level command emitter (which decides *what*
//! packets to record) and the kernel driver (which executes them). It is
//! responsible for packaging command words into correctly sized, aligned and
//! linked indirect buffers (IBs), tracking the buffer objects each stream
//! references, and submitting the result with the right cross-queue ordering.
//!
//! - The [`Device`](crate::device::Device) is the root object. It wraps a
//!   [`KernelDevice`](pyrite_drm::KernelDevice) implementation and holds the
//!   per-engine capability tables, the segment recycling pool and the
//!   diagnostic buffer registry.
//!
//! - [`Buffer`](crate::buffer::Buffer)s are kernel memory allocations with a
//!   stable handle and GPU address. A *virtual* buffer stands in for a set of
//!   concrete buffers and is only expanded when a submission list is built.
//!
//! - A [`CommandStream`](crate::stream::CommandStream) is the append-only
//!   word buffer the emitting layer writes into. Streams grow transparently:
//!   engines with hardware chaining link new segments with chain packets,
//!   the rest collect retired pieces for the scheduler to stitch together.
//!
//! - A [`SubmitContext`](crate::context::SubmitContext) owns a kernel
//!   submission context plus the persistent per-queue sync objects, sequence
//!   numbers and the user-fence region. Submissions go through
//!   [`SubmitContext::submit`](crate::context::SubmitContext::submit), which
//!   picks the submission strategy from the engine's capabilities.
//!
//! - [`Semaphore`](crate::sync::Semaphore)s wrap kernel sync objects (binary
//!   or timeline) and appear in submissions as wait/signal descriptors.
//!
//! Streams are single-owner: one thread records into a stream at a time.
//! Different streams, and submissions on different contexts, are freely
//! concurrent.

use std::{error::Error, fmt, sync::Arc};


pub mod bo_list;
pub mod buffer;
pub mod context;
pub mod device;
pub mod engine;
mod packet;
pub mod stream;
pub mod submit;
pub mod sync;

pub use crate::device::Device;
pub use pyrite_drm::KernelError;

/// Errors surfaced by this crate. A deliberately small, closed set: kernel
/// errno values never escape, they are folded into one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinsysError {
    /// A host (system) memory allocation failed, or the kernel kept
    /// reporting transient exhaustion past the retry budget.
    OutOfHostMemory,
    /// A device memory allocation failed, or a stream outgrew the engine's
    /// hard segment-size ceiling.
    OutOfDeviceMemory,
    /// The kernel cancelled the context, typically after a GPU hang.
    DeviceLost,
    /// The operation requires a privilege the caller does not have.
    NotPermitted,
    /// The kernel rejected a request as malformed. Indicates a bug in this
    /// crate or below it.
    Unknown,
}

impl Error for WinsysError {}

impl fmt::Display for WinsysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WinsysError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            WinsysError::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            WinsysError::DeviceLost => write!(f, "The device has been lost."),
            WinsysError::NotPermitted => write!(f, "A requested operation was not permitted."),
            WinsysError::Unknown => {
                write!(f, "The kernel rejected a submission for an unknown reason.")
            }
        }
    }
}

impl From<KernelError> for WinsysError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::NoMemory => WinsysError::OutOfHostMemory,
            KernelError::NoSpace => WinsysError::OutOfDeviceMemory,
            KernelError::Canceled => WinsysError::DeviceLost,
            KernelError::NoPermission => WinsysError::NotPermitted,
            KernelError::InvalidInput => WinsysError::Unknown,
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a
/// field of this type can only be constructed by calling a constructor
/// function or `Default::default()`. The effect is similar to the standard
/// Rust `#[non_exhaustive]` attribute, except that it does not prevent update
/// syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

/// Implemented by every object that belongs to a [`Device`].
///
/// # Safety
///
/// `device` must return the device that actually owns `self`; submission
/// assembly mixes handles from multiple owned objects and assumes they all
/// target the same kernel device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

unsafe impl<T: DeviceOwned + ?Sized> DeviceOwned for Arc<T> {
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}
