//! Job store trait and implementations.

pub mod job;
pub mod memory;
pub mod postgres;

pub use job::JobStore;
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
