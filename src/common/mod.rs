pub mod error;
pub mod stream;
pub mod timer;
pub mod udp;

pub use error::Error;
pub use stream::{AsyncStream, ProxyStream};
pub use timer::ActivityTimer;
pub use udp::{BoxUdpTransport, UdpPacket, UdpTransport};
