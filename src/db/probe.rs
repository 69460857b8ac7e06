//! Classification of driver errors that mean "this feature is not supported".
//!
//! Some ODBC drivers (desktop databases, flat-file drivers) reject parameter markers or
//! transactions. The broker uses these checks on the first failure to decide whether to fall
//! back, and remembers the answer for the lifetime of the pool.

use regex::RegexSet;
use std::sync::{LazyLock, OnceLock};

use crate::error::BackendError;

const UNSUPPORTED_STATES: [&str; 2] = ["HYC00", "0A000"];
const PARAMETER_STATES: [&str; 3] = ["HY092", "07009", "IM001"];

static PARAMETER_MESSAGES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"driver.*non.*supporta.*questa.*funzione",
        r"driver.*does.*not.*support.*this.*function",
        r"parameter.*not.*support(ed)?",
        r"parametr.*non.*supportat",
        r"placeholder.*not.*support(ed)?",
        r"segnaposto.*non.*supportat",
        r"\?.*not.*support(ed)?",
        r"bind.*parameter.*not.*support(ed)?",
        r"dynamic.*parameter.*not.*support(ed)?",
    ])
    .unwrap_or_else(|err| panic!("invalid parameter probe patterns: {err}"))
});

static TRANSACTION_MESSAGES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"transazion.*non.*supportata", r"not support(ed)?"])
        .unwrap_or_else(|err| panic!("invalid transaction probe patterns: {err}"))
});

fn state_in(err: &BackendError, states: &[&str]) -> bool {
    err.sql_state
        .as_deref()
        .is_some_and(|state| states.contains(&state))
}

/// Whether `err` says parameter markers are not supported.
pub fn parameters_unsupported(err: &BackendError) -> bool {
    state_in(err, &UNSUPPORTED_STATES)
        || state_in(err, &PARAMETER_STATES)
        || PARAMETER_MESSAGES.is_match(&err.message.to_lowercase())
}

/// Whether `err` says transactions are not supported.
pub fn transactions_unsupported(err: &BackendError) -> bool {
    state_in(err, &UNSUPPORTED_STATES) || TRANSACTION_MESSAGES.is_match(&err.message.to_lowercase())
}

/// Discovered driver features, shared by every connection of one pool.
#[derive(Debug, Default)]
pub struct Capabilities {
    parameters: OnceLock<bool>,
    transactions: OnceLock<bool>,
}

impl Capabilities {
    /// `None` until probed.
    pub fn parameters(&self) -> Option<bool> {
        self.parameters.get().copied()
    }

    pub fn transactions(&self) -> Option<bool> {
        self.transactions.get().copied()
    }

    pub fn record_parameters(&self, supported: bool) {
        let _ = self.parameters.set(supported);
    }

    pub fn record_transactions(&self, supported: bool) {
        let _ = self.transactions.set(supported);
    }
}
