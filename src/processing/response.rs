use tokio::sync::mpsc;

use crate::record::{Record, RejectionType, RequestRef};
use crate::types::PartitionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(Record),
    Rejected(Rejection),
}

impl Outcome {
    pub fn rejected(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection {
            rejection_type,
            reason: reason.into(),
        })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(rejection) => Some(rejection),
            Outcome::Accepted(_) => None,
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            Outcome::Accepted(record) => Some(record),
            Outcome::Rejected(_) => None,
        }
    }
}

/// Answer to one client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub partition_id: PartitionId,
    pub request: RequestRef,
    pub outcome: Outcome,
}

pub type ResponseSender = mpsc::UnboundedSender<CommandResponse>;
pub type ResponseReceiver = mpsc::UnboundedReceiver<CommandResponse>;

pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    mpsc::unbounded_channel()
}
