/*!
Abstraction over a virtual address on the inspected system.
*/

use std::fmt;
use std::ops;

/**
This type represents a virtual address on the inspected system.
It internally holds a `u64` value but can also be used
when working with 32-bit snapshots.

This type will not handle overflow for 32-bit or 64-bit addresses.
*/
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde_derive", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct Address(u64);

/// Constructs an `Address` from a `u32` value.
impl From<u32> for Address {
    fn from(item: u32) -> Self {
        Self(u64::from(item))
    }
}

/// Constructs an `Address` from a `u64` value.
impl From<u64> for Address {
    fn from(item: u64) -> Self {
        Self(item)
    }
}

/// Constructs an `Address` from a `usize` value.
impl From<usize> for Address {
    fn from(item: usize) -> Self {
        Self(item as u64)
    }
}

impl Address {
    /// A address with the value of zero.
    pub const NULL: Address = Address(0);

    /// A address with an invalid value.
    pub const INVALID: Address = Address(!0);

    /// Returns an address with a value of zero.
    pub const fn null() -> Self {
        Address::NULL
    }

    /// Checks wether the address is zero or not.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns an address with a invalid value.
    pub const fn invalid() -> Self {
        Address::INVALID
    }

    /// Checks wether the address is valid or not.
    pub const fn is_valid(self) -> bool {
        self.0 != !0
    }

    /// Converts the address into a `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts the address into a `usize` value.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Checks wether the address satisfies the given power-of-two alignment.
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align.wrapping_sub(1)) == 0
    }

    /// Aligns the address downwards to the given power-of-two alignment.
    pub const fn align_down(self, align: u64) -> Address {
        Address(self.0 & !(align.wrapping_sub(1)))
    }

    /// Checks wether a 64-bit address is in canonical form, i.e. whether
    /// bits 63..47 are a sign extension of bit 47.
    pub const fn is_canonical(self) -> bool {
        let high_bits = self.0 >> 47;
        high_bits == 0 || high_bits == 0x1_ffff
    }

    /// Returns the address moved by the given byte offset.
    pub const fn wrapping_add(self, offset: u64) -> Address {
        Address(self.0.wrapping_add(offset))
    }
}

/// Returns a address with a value of zero.
impl Default for Address {
    fn default() -> Self {
        Self::null()
    }
}

/// Adds a byte count to a `Address` which results in a `Address`.
impl ops::Add<u64> for Address {
    type Output = Self;

    fn add(self, other: u64) -> Self {
        Self(self.0 + other)
    }
}

/// Adds a byte count to a `Address` which results in a `Address`.
impl ops::Add<usize> for Address {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other as u64)
    }
}

/// Adds a byte count to a `Address`.
impl ops::AddAssign<u64> for Address {
    fn add_assign(&mut self, other: u64) {
        *self = Self(self.0 + other)
    }
}

/// Subtracts a `Address` from a `Address` resulting in a byte count.
impl ops::Sub for Address {
    type Output = u64;

    fn sub(self, other: Self) -> u64 {
        self.0 - other.0
    }
}

/// Subtracts a byte count from a `Address`.
impl ops::Sub<u64> for Address {
    type Output = Self;

    fn sub(self, other: u64) -> Self {
        Self(self.0 - other)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::UpperHex for Address {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}
impl fmt::LowerHex for Address {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
