// Application layer - Services and use cases over the domain
pub mod history;
pub mod ror;
pub mod telemetry_store;
pub mod thinner;
