//! Persistence boundary used by the scan session.

use toolcrib_protocol::{LoanAction, TagKind};

use crate::error::StorageError;
use crate::tag::TagId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanOutcome {
    pub action: LoanAction,
    pub loan_id: i64,
    /// Set for returns: who had the tool.
    pub prior_borrower_id: Option<String>,
}

pub trait LoanGateway: Send + Sync {
    /// Display name of a user tag, or the raw id when it is not registered.
    fn name_of_user(&self, id: &TagId) -> Result<String, StorageError>;

    /// Display name of a tool tag, or the raw id when it is not registered.
    fn name_of_tool(&self, id: &TagId) -> Result<String, StorageError>;

    /// Closes the open loan of `tool` if there is one, otherwise opens a new
    /// loan for `user`. Atomic per tool.
    fn borrow_or_return(&self, user: &TagId, tool: &TagId) -> Result<LoanOutcome, StorageError>;

    /// Appends to the scan log.
    fn record_scan(&self, id: &TagId, role: TagKind) -> Result<(), StorageError>;
}
