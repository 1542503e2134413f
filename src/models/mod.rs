pub mod contest;
pub mod entry;
pub mod loaders;

pub use contest::{Contest, ContestType, EntryJob, EntryMethod, ProfileData};
pub use entry::{EntryAttempt, EntryResult, EntryStatus, FailureKind, InstantWinOutcome};
pub use loaders::{load_all_entry_files, load_entry_file};
