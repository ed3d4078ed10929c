use std::fmt;

/// How a file's contents are turned into store-object content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileIngestionMethod {
    /// The bytes of a single file, as-is.
    Flat,
    /// A NAR serialization of a filesystem subtree.
    Recursive,
}

impl FileIngestionMethod {
    pub fn is_recursive(&self) -> bool {
        matches!(self, Self::Recursive)
    }

    /// The `r:` marker used inside rendered content addresses; empty for
    /// flat ingestion.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Flat => "",
            Self::Recursive => "r:",
        }
    }
}

impl fmt::Display for FileIngestionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flat => "flat",
            Self::Recursive => "recursive",
        })
    }
}
