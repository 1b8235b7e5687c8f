pub mod node;
pub mod remote;
