pub mod inbox;
pub mod rides;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testing;
