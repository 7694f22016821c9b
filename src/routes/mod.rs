pub mod rides;
pub mod session;
pub mod utils;
pub mod wallet;
