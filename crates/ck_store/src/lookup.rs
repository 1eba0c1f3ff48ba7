//! Three-way result for reads of wrapped material.
//!
//! "Does not exist" and "exists but cannot be opened" must stay distinguishable,
//! so reads return [`Lookup`] instead of overloading `None` and errors.

use crate::error::StoreError;

#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Failed(StoreError),
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Lookup::Failed(_))
    }

    /// `Found(v)` → `Ok(Some(v))`, `NotFound` → `Ok(None)`, `Failed(e)` → `Err(e)`.
    pub fn into_result(self) -> Result<Option<T>, StoreError> {
        match self {
            Lookup::Found(v) => Ok(Some(v)),
            Lookup::NotFound => Ok(None),
            Lookup::Failed(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(v) => Lookup::Found(f(v)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(e) => Lookup::Failed(e),
        }
    }
}

impl<T> From<Result<Option<T>, StoreError>> for Lookup<T> {
    fn from(r: Result<Option<T>, StoreError>) -> Self {
        match r {
            Ok(Some(v)) => Lookup::Found(v),
            Ok(None) => Lookup::NotFound,
            Err(e) => Lookup::Failed(e),
        }
    }
}
