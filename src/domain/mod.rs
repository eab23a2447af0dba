// Domain layer - Core telemetry types and pure data structures
pub mod codec;
pub mod ring_buffer;
pub mod telemetry;
