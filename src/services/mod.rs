pub mod command;
pub mod handlers;
pub mod queue;
pub mod worker;
