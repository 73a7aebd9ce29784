pub mod fear_greed;
pub mod idempotency;
pub mod locks;
pub mod paper;
