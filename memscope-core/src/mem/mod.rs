/*!
Module with the address-space interface of the inspected system.

The actual virtual-to-physical translation (page-table walking) happens
behind this interface; memscope only consumes it as a byte-read service
over one or more memory-dump revisions.
*/

pub mod addr_space;
#[doc(hidden)]
pub use addr_space::AddressSpace;

pub mod dummy;
#[doc(hidden)]
pub use dummy::DummyMemory;
