pub mod config;
pub mod config_loader;
pub mod events;
pub mod traits;
pub mod types;

pub use config::{
    AppConfig, DiscoveryConfig, EngineConfig, EntryConfig, ExecutionConfig, ExitConfig,
    PaperConfig, RecordsConfig, RiskConfig, SignalsConfig,
};
pub use config_loader::ConfigLoader;
pub use events::MarketEvent;
pub use traits::{DiscoveryError, FairValueOracle, MarketDiscovery, TrendFilter};
pub use types::{
    market_slug, window_end, window_start, BookSnapshot, BookSummary, MarketTokens, Outcome,
    PriceLevel, TokenMapError, TrendBias, WINDOW_SECS,
};
