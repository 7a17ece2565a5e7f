//! Sortable record contract.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Record comparison error.
///
/// Reported by [`Record::less`] when two records cannot be ordered (for example a floating point `NaN`).
/// Comparison failures are fatal for the sort or merge step that hit them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareError {
    reason: String,
}

impl CompareError {
    /// Creates a comparison error with a human readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        CompareError { reason: reason.into() }
    }

    /// Returns the failure reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Display for CompareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "records are not comparable: {}", self.reason)
    }
}

impl Error for CompareError {}

/// Sortable record interface.
///
/// Every value passed through the splitter and the merger implements this trait. The order defined by
/// [`Record::less`] must be a strict weak ordering, otherwise the sorting result is undefined.
/// The textual representation of a record is its [`Display`] implementation.
pub trait Record: Display + Send + 'static {
    /// Returns `true` if `self` is ordered before `other`.
    fn less(&self, other: &Self) -> Result<bool, CompareError>;
}

/// Derives a three-way ordering from [`Record::less`].
pub fn compare<T: Record>(a: &T, b: &T) -> Result<Ordering, CompareError> {
    if a.less(b)? {
        Ok(Ordering::Less)
    } else if b.less(a)? {
        Ok(Ordering::Greater)
    } else {
        Ok(Ordering::Equal)
    }
}

macro_rules! impl_total_record {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Record for $ty {
                fn less(&self, other: &Self) -> Result<bool, CompareError> {
                    Ok(self < other)
                }
            }
        )*
    };
}

impl_total_record!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, char, bool, String);

macro_rules! impl_float_record {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Record for $ty {
                fn less(&self, other: &Self) -> Result<bool, CompareError> {
                    match self.partial_cmp(other) {
                        Some(ordering) => Ok(ordering == Ordering::Less),
                        None => Err(CompareError::new(format!("{} and {} have no order", self, other))),
                    }
                }
            }
        )*
    };
}

impl_float_record!(f32, f64);
