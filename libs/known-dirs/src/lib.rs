//! Well-known filesystem paths for the border control plane.
//!
//! Only Linux is a supported deployment target for the daemon itself, but
//! keeping the platform split mirrors how the rest of the workspace is laid
//! out and leaves room for a non-Linux dev/test build.

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(not(target_os = "linux"))]
#[path = "other.rs"]
mod platform;

pub use platform::*;
