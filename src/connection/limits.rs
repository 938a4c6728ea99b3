/// Per-connection run-time limits (`SQLITE_LIMIT_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Limit {
    /// Largest string or blob.
    Length,
    /// Longest SQL statement text.
    SqlLength,
    /// Columns in a table, index, or result set.
    Column,
    /// Expression tree depth.
    ExprDepth,
    /// Terms in a compound SELECT.
    CompoundSelect,
    /// Virtual machine instructions per statement.
    VdbeOp,
    /// Arguments to a function.
    FunctionArg,
    /// Attached databases.
    Attached,
    /// LIKE/GLOB pattern length.
    LikePatternLength,
    /// Highest parameter index.
    VariableNumber,
    /// Trigger recursion depth.
    TriggerDepth,
    /// Auxiliary worker threads.
    WorkerThreads,
    /// Pages in one database file.
    PageCount,
}

impl Limit {
    /// Every limit, ordered by id.
    pub const ALL: [Limit; 13] = [
        Limit::Length,
        Limit::SqlLength,
        Limit::Column,
        Limit::ExprDepth,
        Limit::CompoundSelect,
        Limit::VdbeOp,
        Limit::FunctionArg,
        Limit::Attached,
        Limit::LikePatternLength,
        Limit::VariableNumber,
        Limit::TriggerDepth,
        Limit::WorkerThreads,
        Limit::PageCount,
    ];

    /// Engine id of this limit.
    pub const fn id(self) -> i32 {
        match self {
            Limit::Length => 0,
            Limit::SqlLength => 1,
            Limit::Column => 2,
            Limit::ExprDepth => 3,
            Limit::CompoundSelect => 4,
            Limit::VdbeOp => 5,
            Limit::FunctionArg => 6,
            Limit::Attached => 7,
            Limit::LikePatternLength => 8,
            Limit::VariableNumber => 9,
            Limit::TriggerDepth => 10,
            Limit::WorkerThreads => 11,
            Limit::PageCount => 12,
        }
    }

    /// Limit for an engine id.
    pub fn from_id(id: i32) -> Option<Limit> {
        usize::try_from(id).ok().and_then(|idx| Self::ALL.get(idx).copied())
    }
}
