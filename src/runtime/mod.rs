//! Background side of the engine.
//!
//! # Architecture guarantees
//! * **Single writer**: one [`IngestDriver`] feeds admissions; query paths
//!   only bootstrap addresses and read.
//! * **Recoverable reorgs**: a continuity break never stops the driver, it
//!   reconciles and walks forward again.

mod ingest;

#[cfg(test)]
mod tests;

pub use ingest::{IngestDriver, TickReport};
