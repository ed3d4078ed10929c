/// Worker-protocol operation codes. The numbering is part of the wire
/// format and must match the daemon's table exactly; gaps are opcodes that
/// were retired before this table was frozen.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    IsValidPath = 1,
    /// Obsolete since minor 12; still sent to older daemons by the
    /// `query_substitutable_paths` fallback.
    HasSubstitutes = 3,
    QueryReferrers = 6,
    AddToStore = 7,
    /// Obsolete since minor 25; the text-hash leg of `add_ca_to_store`
    /// on older daemons.
    AddTextToStore = 8,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    AddIndirectRoot = 12,
    SyncWithGC = 13,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    /// Obsolete since minor 12; per-path fallback for
    /// `query_substitutable_path_infos`.
    QuerySubstitutablePathInfo = 21,
    /// Obsolete since minor 22; the RPC leg of `query_derivation_outputs`.
    QueryDerivationOutputs = 22,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    /// Obsolete since minor 18; the import envelope `add_to_store_nar`
    /// sends to very old daemons.
    ImportPaths = 27,
    QueryPathFromHashPart = 29,
    QuerySubstitutablePathInfos = 30,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
}
