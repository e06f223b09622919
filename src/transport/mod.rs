//! 传输层：消息、协议、原始错误与会话 trait

pub mod error;
pub mod message;
pub mod protocol;
pub mod session;

pub use error::{BoxError, HubError, TransportError};
pub use message::Message;
pub use protocol::{Protocol, ServiceCode};
pub use session::{AuthContext, Disposition, SessionConnector, Transport, TransportSession};
