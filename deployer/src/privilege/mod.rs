pub mod elevation;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod worker;
