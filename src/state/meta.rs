use crate::error::StateResult;
use crate::record::SourceRef;
use crate::types::{LogIndex, RecordPosition, Term};

use super::{ColumnFamily, ProcessingState};

const LAST_APPLIED_INDEX: &[u8] = b"last_applied_index";
const LAST_APPLIED_POSITION: &[u8] = b"last_applied_position";
const LAST_PROCESSED: &[u8] = b"last_processed";
const TERM: &[u8] = b"term";

// Processing metadata
impl ProcessingState {
    pub fn last_applied_index(&self) -> StateResult<LogIndex> {
        Ok(self
            .db
            .get(ColumnFamily::Meta, LAST_APPLIED_INDEX)?
            .unwrap_or(0))
    }

    pub fn set_last_applied_index(&mut self, index: LogIndex) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Meta, LAST_APPLIED_INDEX.to_vec(), &index)
    }

    /// Highest record position whose event has been applied.
    pub fn last_applied_position(&self) -> StateResult<RecordPosition> {
        Ok(self
            .db
            .get(ColumnFamily::Meta, LAST_APPLIED_POSITION)?
            .unwrap_or(0))
    }

    pub fn set_last_applied_position(&mut self, position: RecordPosition) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Meta, LAST_APPLIED_POSITION.to_vec(), &position)
    }

    /// The newest command whose processing left a trace in the log.
    pub fn last_processed(&self) -> StateResult<Option<SourceRef>> {
        self.db.get(ColumnFamily::Meta, LAST_PROCESSED)
    }

    pub fn set_last_processed(&mut self, source: SourceRef) -> StateResult<()> {
        self.db
            .put(ColumnFamily::Meta, LAST_PROCESSED.to_vec(), &source)
    }

    pub fn term(&self) -> StateResult<Term> {
        Ok(self.db.get(ColumnFamily::Meta, TERM)?.unwrap_or(0))
    }

    pub fn set_term(&mut self, term: Term) -> StateResult<()> {
        self.db.put(ColumnFamily::Meta, TERM.to_vec(), &term)
    }
}
