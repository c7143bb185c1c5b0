pub mod checksum;
pub mod time;

pub use checksum::payload_checksum;
pub use time::now_millis;
