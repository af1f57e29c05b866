pub mod reader;
pub mod writer;

pub use reader::{MergeTreeReader, RunIterator};
pub use writer::{InPlaceBuffer, MergeTreeWriter, SpillableBuffer, WriteBuffer};
