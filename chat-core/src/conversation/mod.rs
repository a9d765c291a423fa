mod store;

pub use store::{ConversationStore, COMPACTION_THRESHOLD, SUMMARY_INSTRUCTION};
