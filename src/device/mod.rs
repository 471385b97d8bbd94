pub mod btle;
pub mod constants;
pub mod frame;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod fake;
