pub mod compression;
pub mod queue;
pub mod storage;
pub mod worker;
