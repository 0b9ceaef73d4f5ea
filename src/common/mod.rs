pub mod addr;
pub mod error;
pub mod interrupt;
pub mod stream;
pub mod tls;

pub use addr::Address;
pub use error::{OutboundError, OutboundErrorKind};
pub use interrupt::InterruptGroup;
pub use stream::{BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
