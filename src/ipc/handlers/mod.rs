pub mod balances;
pub mod billing;
pub mod core;
pub mod families;
pub mod seasons;
pub mod setup;
