pub mod dedup;
pub mod tracker;

pub use dedup::BoundedSet;
pub use tracker::MarketTracker;
