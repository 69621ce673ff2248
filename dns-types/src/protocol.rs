pub mod deserialise;
pub mod serialise;
pub mod tsig;
pub mod types;
pub mod wire;
