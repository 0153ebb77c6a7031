pub mod bus;
pub mod device;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod sink;
