pub mod domo;
pub mod flow;
pub mod message;
pub mod transport;
pub mod util;
pub mod test_util;
