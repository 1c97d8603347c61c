pub mod autoconsent;
pub mod banner;
pub mod bridge;
pub mod collector;
pub mod protocol;
pub mod recorder;
pub mod scan;
pub mod session;

#[cfg(test)]
mod testing;
