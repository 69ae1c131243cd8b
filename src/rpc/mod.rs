//! JSONL RPC plumbing shared by the daemon, the worker, and the CLI client:
//! line framing, message envelopes, the worker-command registry, and the
//! transport error taxonomy.

mod commands;
mod protocol;

pub use commands::{WORKER_COMMANDS, get_command_name, is_command_request, is_command_response};
pub use protocol::{
    CLIENT_ID_FIELD, LineBuffer, RpcError, WORKER_ID_FIELD, error_response, make_request,
    ok_response, read_frame, response_type_for, write_frame,
};
