/// Represents all possible errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A raw record carried an event tag the decoder does not know.
    #[error("unknown event kind tag: {0}")]
    UnknownEventKind(u64),

    /// A raw record was shorter than its kind's fixed layout.
    #[error("truncated event record: kind {kind}, {len} bytes")]
    TruncatedEvent { kind: u64, len: usize },

    /// Error occurred while loading the configuration file.
    #[error("failed to load config: {0}")]
    ConfigLoadFailed(#[from] config::Error),

    /// Error occurred while reading data from procfs.
    #[error("failed to read procfs info: {0}")]
    ProcfsReadFailed(#[from] procfs::ProcError),

    /// Error occurred while reading a file.
    #[error("failed to read file: {0}")]
    FileReadFailed(#[from] std::io::Error),
}
