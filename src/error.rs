use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

/// Control-path errors from the WebSocket ingestor. A `Report<IngestError>`
/// returned from `Restartable::restart` always means the connection attempt
/// ended and the caller (the `RecoveryManager`) must decide whether to retry.
#[derive(Debug, Display, Error)]
pub enum IngestError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("subscribe rejected by {exchange}")]
    Subscribe { exchange: String },
    #[display("write to {exchange} socket failed")]
    Send { exchange: String },
}

/// Data-path error: a rate lookup failed. Never propagated past the
/// `PriceConverter` boundary -- callers get the `0.0` sentinel instead.
#[derive(Debug, Display, Error)]
pub enum ConvertError {
    #[display("rate fetch for {quote} failed")]
    RateFetch { quote: String },
    #[display("could not parse trading pair symbol {symbol}")]
    SymbolParse { symbol: String },
}

#[derive(Debug, Display, Error)]
pub enum ArchiveError {
    #[display("failed to open archive file")]
    Open,
    #[display("failed to append to archive file")]
    Write,
}

#[derive(Debug, Display, Error)]
pub enum SinkError {
    #[display("failed to deliver alert to {recipient}")]
    Delivery { recipient: String },
}
