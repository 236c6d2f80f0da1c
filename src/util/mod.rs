pub mod address;
pub mod constants;
pub mod conversions;
pub mod freelist;
#[macro_use]
pub mod log;
pub mod logger;
pub mod memory;
pub mod os;

pub use self::address::Address;
