// Tick pipeline: feed, aggregation, fan-out, positions and monitoring sessions
pub mod broadcaster;
pub mod monitor;
pub mod position_manager;
pub mod price_feed;
pub mod simulator;
pub mod tick_aggregator;

pub use broadcaster::{BroadcastReport, BroadcasterConfig, TickBroadcaster};
pub use monitor::{
    spawn_position_tracker, Evaluation, MonitorConfig, MonitorSupervisor, SignalPipeline,
    POSITION_TRACKER,
};
pub use position_manager::{
    AdjustmentKind, ClosedPosition, ExitReason, Position, PositionConfig, PositionManager,
    PositionStatus, PriceUpdate, StopAdjustment,
};
pub use price_feed::{FeedAdapter, FeedConfig, FeedManager, FeedState};
pub use simulator::{SimulatorConfig, TickSimulator};
pub use tick_aggregator::{AggregatorConfig, TickAggregator};
