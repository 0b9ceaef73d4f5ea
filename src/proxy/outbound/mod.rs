pub mod block;
pub mod direct;

pub const TYPE_DIRECT: &str = "direct";
pub const TYPE_BLOCK: &str = "block";
