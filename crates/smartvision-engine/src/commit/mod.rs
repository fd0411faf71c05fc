//! Interchangeable ways of committing a description result.

pub mod embed;
pub mod ledger;

use smartvision_contracts::{
    CommitError, CommitStrategy, DescriptionResult, FatalError, ImageTask,
};

pub use embed::EmbedCommitter;
pub use ledger::LedgerCommitter;

pub trait MetadataCommitter {
    fn strategy(&self) -> CommitStrategy;

    /// Runs once before the first item. A failure here aborts the batch.
    fn begin(&mut self) -> Result<(), FatalError> {
        Ok(())
    }

    fn commit(&mut self, task: &ImageTask, result: &DescriptionResult) -> Result<(), CommitError>;
}
