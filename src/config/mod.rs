pub mod options;
pub mod watcher;

pub use options::{
    AggregatorTransportProtocol, ApiServer, ClickHouseOptions, FilterClause, FlowCollectorOptions, FlowLoggerOptions, Mode, Options, RecordContents, RecordFormat,
    S3UploaderOptions, TlsOptions,
};
pub use watcher::{ConfigUpdate, ConfigWatcher};
