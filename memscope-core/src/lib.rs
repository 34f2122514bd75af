/*!
This crate contains the core of the memscope kernel object graph
reconstruction framework.

Starting from a set of root symbols (global kernel variables) it interprets
the raw bytes of a memory snapshot according to debug-symbol type
descriptions, follows pointers and aggregate members transitively, scores
every discovered object with a heuristic plausibility and exposes the result
as an address-indexed, queryable [memory map](map/index.html).

It contains abstractions over [memory addresses](types/index.html),
[type descriptions](symbols/index.html),
[reading snapshot memory](mem/index.html) and
[typed views of raw bytes](instance/index.html).
*/

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate smallvec;

pub mod error;
#[doc(hidden)]
pub use error::*;

pub mod types;
#[doc(hidden)]
pub use types::*;

pub mod symbols;
#[doc(hidden)]
pub use symbols::*;

pub mod mem;
#[doc(hidden)]
pub use mem::*;

pub mod instance;
#[doc(hidden)]
pub use instance::*;

pub mod map;
#[doc(hidden)]
pub use map::*;
