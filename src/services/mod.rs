pub mod assembler;
pub mod inference;
pub mod orchestrator;
pub mod storage;
