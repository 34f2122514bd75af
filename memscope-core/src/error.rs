/*!
Specialized `Error` and `Result` types for memscope.
*/

use std::{convert, error, fmt, result};

/// Specialized `Error` type for memscope errors.
///
/// All variants except [`Error::Precondition`] describe recoverable
/// per-task conditions: they are folded into node or task state by the
/// builder and never abort a running build.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Generic error type containing a string
    Other(&'static str),
    /// Out of bounds.
    ///
    /// Catch-all for bounds check errors such as indexing past a
    /// declared array length.
    Bounds,
    /// Unmapped memory.
    ///
    /// The address is not resolvable in the current memory snapshot.
    Unmapped,
    /// Unresolved type.
    ///
    /// The type catalog lacks the referenced type id.
    UnresolvedType,
    /// Type interpretation error.
    ///
    /// The operation is not meaningful for the type's tag, e.g.
    /// dereferencing a non-pointer.
    InvalidTypeTag(&'static str),
    /// Budget exceeded.
    ///
    /// The configured depth or node budget was hit; remaining work is
    /// deferred, not lost.
    BudgetExceeded,
    /// The build was cancelled; partial results remain valid.
    Cancelled,
    /// Precondition violated before any task ran.
    ///
    /// This is the only fatal error class of a build.
    Precondition(&'static str),
}

/// Convert from &str to error
impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

impl Error {
    /// Returns a tuple representing the error description and its string value.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("other error", Some(e)),
            Error::Bounds => ("out of bounds", None),
            Error::Unmapped => ("address not mapped in snapshot", None),
            Error::UnresolvedType => ("type not present in catalog", None),
            Error::InvalidTypeTag(e) => ("operation invalid for type tag", Some(e)),
            Error::BudgetExceeded => ("traversal budget exceeded", None),
            Error::Cancelled => ("build cancelled", None),
            Error::Precondition(e) => ("build precondition violated", Some(e)),
        }
    }

    /// Returns a simple string representation of the error.
    pub fn to_str(self) -> &'static str {
        self.to_str_pair().0
    }

    /// Returns `true` for errors that a build folds into per-task state.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Error::Precondition(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (desc, value) = self.to_str_pair();

        if let Some(value) = value {
            write!(f, "{}: {}", desc, value)
        } else {
            f.write_str(desc)
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        self.to_str()
    }
}

/// Specialized `Result` type for memscope results.
pub type Result<T> = result::Result<T, Error>;
