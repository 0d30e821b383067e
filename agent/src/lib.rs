pub mod channel;
pub mod error;
pub mod exec;
pub mod flow;
pub mod handshake;
pub mod listener;
pub mod session;
pub mod transport;

pub use channel::{BoxedStream, Frame, FramedChannel};
pub use error::AgentError;
pub use exec::ShellHandler;
pub use flow::{ExecKind, Flow};
pub use listener::Listener;
pub use session::ExecHandler;
pub use transport::{Connector, VsockConnector, VsockListener};
