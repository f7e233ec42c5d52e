#[path = "integration/cancellation.rs"]
mod cancellation;
#[path = "integration/config.rs"]
mod config;
#[path = "integration/lock_stress.rs"]
mod lock_stress;
#[path = "integration/pool_bounds.rs"]
mod pool_bounds;
#[path = "integration/scenarios.rs"]
mod scenarios;
