pub mod escrow_relayer;
pub mod juno;
pub mod registry;
pub mod sandbox;
pub mod traits;

pub use registry::RailRegistry;
