//! Networking: wire protocol, sessions, the staged server, cluster bus.

pub mod cluster;
pub mod codec;
pub mod handlers;
pub mod message;
pub mod server;
pub mod session;

pub use cluster::{send_join, Cluster, ClusterError, Member};
pub use codec::{Header, Opcode, ProtocolError, MAX_BODY_LEN};
pub use message::{Request, Response, Tuple, NOK, OK};
pub use server::{Server, ServerContext, ServerError, State};
pub use session::{Session, SessionTable};
