//! A client/server implementation using UNIX sockets for gRPC, meant for use with tonic. Socket
//! support is not built in to tonic, so the listener is wrapped in a `Stream` of connections that
//! can be handed to `serve_with_incoming`.

pub mod client;
pub mod server;
