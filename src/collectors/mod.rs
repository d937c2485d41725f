pub mod powercap;

pub use powercap::Powercap;
