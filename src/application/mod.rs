//! Application layer: the orchestration services behind the node's RPC calls.
//!
//! Each service validates what a client sends, hands the work to one of the
//! node's engines through the domain ports and relays the results back onto
//! the client's stream. Cancellation flows from a shared [`shutdown::ShutdownSignal`].

pub mod acceptor;
pub mod dispatcher;
pub mod lifecycle;
pub mod preflight;
pub mod resolver;
pub mod shutdown;
