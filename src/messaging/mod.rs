pub mod envelope;
pub mod fd_passing;
pub mod wire;
