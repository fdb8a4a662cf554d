//! Priority task queues and the task lifecycle table

pub mod board;
pub mod priority;

pub use board::{BoardStats, SweepReport, TaskBoard};
pub use priority::PriorityQueue;
