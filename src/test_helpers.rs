pub mod objects;
pub mod tunnel_mocks;
