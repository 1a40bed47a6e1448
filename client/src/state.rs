//! What a page renders: the rows, the loading flag and the error.

use quarry_engine::{Error, Row};
use serde::Serialize;

/// Observable state of a live table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableState {
    /// Rows in query order.
    pub data: Vec<Row>,
    /// True until the first fetch resolves (and during a manual refresh).
    pub loading: bool,
    /// Last fetch or stream failure.
    #[serde(serialize_with = "error_message")]
    pub error: Option<Error>,
    /// The change stream is down; `data` may be out of date.
    pub stale: bool,
}

impl TableState {
    /// Loaded, error-free and receiving changes.
    pub fn is_live(&self) -> bool {
        !self.loading && !self.stale && self.error.is_none()
    }

    /// The error as the message shown to the user.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// A call result in the `{data, error}` shape pages consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub data: Option<T>,
    #[serde(serialize_with = "error_message")]
    pub error: Option<Error>,
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

impl<T> From<Result<T, Error>> for Outcome<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(data) => Outcome {
                data: Some(data),
                error: None,
            },
            Err(error) => Outcome {
                data: None,
                error: Some(error),
            },
        }
    }
}

fn error_message<S: serde::Serializer>(error: &Option<Error>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
