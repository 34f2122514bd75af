/*!
Module with basic types used in memscope.

This module contains the address abstraction of the inspected system
and different size helpers.
*/

pub mod address;
#[doc(hidden)]
pub use address::Address;

pub mod size;
