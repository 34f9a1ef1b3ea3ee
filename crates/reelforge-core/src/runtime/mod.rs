pub mod cancel;
pub mod dispatch;
pub mod limiter;
pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod poller;
pub mod provider;
pub mod quorum;
pub mod reconcile;
pub mod stage;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;
