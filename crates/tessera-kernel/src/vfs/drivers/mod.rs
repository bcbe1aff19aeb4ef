//! Storage drivers.
//!
//! Drivers implement [`Driver`](crate::vfs::Driver) plus whichever optional
//! capabilities their backend supports.

pub mod alias;
pub mod local;
pub mod memory;
#[cfg(any(test, feature = "test-mock"))]
pub mod mock;

pub use alias::AliasDriver;
pub use local::LocalDriver;
pub use memory::MemoryDriver;

use super::error::FsResult;
use super::registry::DriverRegistry;

/// Register every built-in driver.
pub fn register_builtin(registry: &DriverRegistry) -> FsResult<()> {
    registry.register(|| Box::new(LocalDriver::new()))?;
    registry.register(|| Box::new(MemoryDriver::new()))?;
    registry.register(|| Box::new(AliasDriver::new()))?;
    Ok(())
}
