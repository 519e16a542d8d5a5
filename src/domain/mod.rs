// Core value types shared with adapters
pub mod types;

// Algo configuration schema and values
pub mod params;

// Per-algo subscription state
pub mod instrument;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;

// Domain-specific error types
pub mod errors;
