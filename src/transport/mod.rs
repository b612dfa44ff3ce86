pub mod port;
pub mod socket;
pub mod wire;
