mod database;
mod objects;
mod resource_limits;

pub use {
  database::{shared, ChainTables, Database, DbError, SharedDb, UndoSession},
  objects::{
    AccountObject,
    AccountUsage,
    ActivatedFeature,
    ChainParams,
    GlobalProperties,
    ProposedSchedule,
    ProtocolState,
    ScheduledTransaction,
    UsageAccumulator,
  },
  resource_limits::{ResourceError, ACCOUNT_USAGE_WINDOW_SLOTS},
};
